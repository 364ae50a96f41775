//! Sandbox management — cheap on-demand access to isolated, resource-
//! limited workspaces with durable best-effort storage.
//!
//! [`SandboxManager`] is the singleton owning every sandbox lifecycle:
//! pool maintenance, debounced file writes, tar-based backup/restore
//! against the object store, and startup reconciliation of orphaned
//! containers. The container backend sits behind [`ContainerRuntime`].

pub mod backup;
pub mod manager;
pub mod paths;
pub mod process;
pub mod runtime;

pub use manager::{SandboxManager, SandboxState};
pub use paths::normalize_workspace_path;
pub use process::ProcessRuntime;
pub use runtime::{ContainerRuntime, ContainerSummary, CreateOpts, ExecOutput};
