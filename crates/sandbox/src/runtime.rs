//! Container runtime seam.
//!
//! The manager drives containers exclusively through this trait: shell
//! execs with timeouts (`mkdir -p`, `: >` truncate, piped `cat >>`),
//! tar archive reads/writes for snapshot and restore, and label-based
//! listing for orphan reconciliation. A Docker/Firecracker client
//! implements the same surface; [`crate::ProcessRuntime`] backs the
//! single-host deployment and the tests.

use std::time::Duration;

use ed_domain::error::Result;

/// Resource policy and identity for a new container.
#[derive(Debug, Clone)]
pub struct CreateOpts {
    /// Well-known label so the reconciler can find orphans.
    pub label: String,
    /// Workspace root inside the container.
    pub workspace_root: String,
    pub memory_bytes: u64,
    pub cpus: u32,
    pub pids_limit: u32,
    /// Network starts disabled; flipped on selectively for installs.
    pub network: bool,
}

/// Output of one exec'd command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One labeled container as seen by the runtime, for reconciliation.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub container_id: String,
    pub running: bool,
}

#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container (paused/stopped until `unpause`). Returns the
    /// container id.
    async fn create(&self, opts: &CreateOpts) -> Result<String>;

    async fn unpause(&self, container_id: &str) -> Result<()>;

    async fn pause(&self, container_id: &str) -> Result<()>;

    /// Force-remove the container and its filesystem.
    async fn remove(&self, container_id: &str) -> Result<()>;

    /// Toggle network access (installs need the registry, nothing else
    /// does).
    async fn set_network(&self, container_id: &str, enabled: bool) -> Result<()>;

    /// Run `sh -c <script>` inside the container workspace. `stdin` is
    /// piped to the command when present. Exceeding `timeout` kills the
    /// command and returns a `Timeout` error.
    async fn exec(
        &self,
        container_id: &str,
        script: &str,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ExecOutput>;

    /// Tar up the workspace, excluding any path containing one of the
    /// `excludes` components. Returns raw (uncompressed) tar bytes.
    async fn read_archive(&self, container_id: &str, excludes: &[String]) -> Result<Vec<u8>>;

    /// Unpack raw tar bytes into the workspace root.
    async fn write_archive(&self, container_id: &str, tar_bytes: Vec<u8>) -> Result<()>;

    /// All containers carrying the label, running or not.
    async fn list_labeled(&self, label: &str) -> Result<Vec<ContainerSummary>>;
}
