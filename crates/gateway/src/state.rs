use std::sync::Arc;

use ed_domain::config::Config;
use ed_providers::{LlmClient, WebSearchClient};
use ed_sandbox::SandboxManager;
use ed_storage::{KvStore, ObjectStore};

use crate::runtime::cancel::CancelMap;
use crate::runtime::gate::ConcurrencyGate;
use crate::runtime::runs::RunStore;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — config, stores, LLM and search clients
/// - **Sandboxes** — the manager singleton
/// - **Runtime** — run transcripts, per-user gate, per-chat cancel map
/// - **Security (startup-computed)** — the read-only command allowlist
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub kv: Arc<dyn KvStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub llm: Arc<dyn LlmClient>,
    pub search: Arc<dyn WebSearchClient>,

    // ── Sandboxes ─────────────────────────────────────────────────────
    pub sandboxes: SandboxManager,

    // ── Runtime ───────────────────────────────────────────────────────
    pub runs: Arc<RunStore>,
    pub gate: Arc<ConcurrencyGate>,
    pub cancels: Arc<CancelMap>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// Precompiled allowlist for `<edward_command>` tools.
    pub command_allowlist: Arc<regex::RegexSet>,
}
