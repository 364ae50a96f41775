use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Sanity findings for `config validate`. Empty = all good.
    pub fn validate(&self) -> Vec<String> {
        let mut findings = Vec::new();
        if self.limits.max_concurrent_per_user == 0 {
            findings.push("limits.max_concurrent_per_user must be at least 1".into());
        }
        if self.sandbox.pool_size > 16 {
            findings.push(format!(
                "sandbox.pool_size = {} is suspiciously large (pool containers stay resident)",
                self.sandbox.pool_size
            ));
        }
        if self.sandbox.flush_debounce_ms == 0 {
            findings.push("sandbox.flush_debounce_ms = 0 disables write coalescing".into());
        }
        if self.llm.base_url.is_empty() {
            findings.push("llm.base_url is empty — streaming requests will fail".into());
        }
        findings
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Origins allowed for CORS. Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            allowed_origins: d_cors_origins(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions base URL.
    #[serde(default = "d_llm_url")]
    pub base_url: String,
    #[serde(default = "d_llm_model")]
    pub default_model: String,
    /// Connect/first-byte timeout. The stream itself has no hard cap and
    /// is bounded only by the session wall clock.
    #[serde(default = "d_120")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_llm_url(),
            default_model: d_llm_model(),
            request_timeout_secs: 120,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Target number of pre-created paused containers.
    #[serde(default = "d_3")]
    pub pool_size: usize,
    /// Workspace root inside each container.
    #[serde(default = "d_workspace_root")]
    pub workspace_root: String,
    /// Label attached to every container so the reconciler can find orphans.
    #[serde(default = "d_label")]
    pub label: String,
    /// Idle TTL before a sandbox becomes eligible for cleanup.
    #[serde(default = "d_600")]
    pub ttl_secs: u64,
    /// Debounce window for buffered file writes.
    #[serde(default = "d_100")]
    pub flush_debounce_ms: u64,
    /// Cap on buffered bytes per sandbox; exceeding forces a flush.
    #[serde(default = "d_5mib")]
    pub max_buffered_bytes: usize,
    /// Quick commands (mkdir, truncate, file writes).
    #[serde(default = "d_10")]
    pub exec_timeout_secs: u64,
    /// Dependency installs.
    #[serde(default = "d_120")]
    pub install_timeout_secs: u64,
    /// Production builds.
    #[serde(default = "d_180")]
    pub build_timeout_secs: u64,
    /// Container memory limit in bytes.
    #[serde(default = "d_1gib")]
    pub memory_bytes: u64,
    #[serde(default = "d_1")]
    pub cpus: u32,
    #[serde(default = "d_100u")]
    pub pids_limit: u32,
    /// Base directory for the local process-backed runtime.
    #[serde(default = "d_sandbox_dir")]
    pub base_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            workspace_root: d_workspace_root(),
            label: d_label(),
            ttl_secs: 600,
            flush_debounce_ms: 100,
            max_buffered_bytes: 5 * 1024 * 1024,
            exec_timeout_secs: 10,
            install_timeout_secs: 120,
            build_timeout_secs: 180,
            memory_bytes: 1024 * 1024 * 1024,
            cpus: 1,
            pids_limit: 100,
            base_dir: d_sandbox_dir(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// TTL on `workflow:<id>` keys.
    #[serde(default = "d_3600")]
    pub state_ttl_secs: u64,
    /// TTL on `lock:<key>` entries.
    #[serde(default = "d_300")]
    pub lock_ttl_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            state_ttl_secs: 3600,
            lock_ttl_secs: 300,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "d_2")]
    pub max_concurrent_per_user: u32,
    /// TTL on the per-user counter so crashed callers release slots.
    #[serde(default = "d_300")]
    pub concurrency_ttl_secs: u64,
    /// Agentic loop bounds.
    #[serde(default = "d_8")]
    pub max_turns: u32,
    #[serde(default = "d_24")]
    pub max_tool_calls: u32,
    /// Cumulative LLM text cap; exceeding aborts the stream.
    #[serde(default = "d_10mib")]
    pub max_raw_response_bytes: usize,
    /// Stream wall clock.
    #[serde(default = "d_300")]
    pub stream_timeout_secs: u64,
    /// Checkpoint every N FILE_END events (plus every turn boundary).
    #[serde(default = "d_5")]
    pub checkpoint_file_interval: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_user: 2,
            concurrency_ttl_secs: 300,
            max_turns: 8,
            max_tool_calls: 24,
            max_raw_response_bytes: 10 * 1024 * 1024,
            stream_timeout_secs: 300,
            checkpoint_file_interval: 5,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local state directory (runs JSONL, filesystem object store).
    #[serde(default = "d_state_dir")]
    pub state_dir: PathBuf,
    /// TTL on the `backup:exists:<chat_id>` negative-cache hint.
    #[serde(default = "d_7d")]
    pub backup_hint_ttl_secs: u64,
    /// Base URL previews are published under.
    #[serde(default = "d_preview_base")]
    pub preview_base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: d_state_dir(),
            backup_hint_ttl_secs: d_7d(),
            preview_base_url: d_preview_base(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Web search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "d_8usize")]
    pub max_results_cap: usize,
    #[serde(default = "d_20")]
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_results_cap: 8,
            timeout_secs: 20,
        }
    }
}

// ── serde default helpers ────────────────────────────────────────────

fn d_port() -> u16 {
    3210
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".into(), "http://127.0.0.1:3000".into()]
}
fn d_llm_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_llm_model() -> String {
    "gpt-4o".into()
}
fn d_workspace_root() -> String {
    "/home/node/edward".into()
}
fn d_label() -> String {
    "works.pragnya.edward".into()
}
fn d_sandbox_dir() -> PathBuf {
    PathBuf::from("./data/sandboxes")
}
fn d_state_dir() -> PathBuf {
    PathBuf::from("./data/state")
}
fn d_preview_base() -> String {
    "https://preview.edward.app".into()
}
fn d_1() -> u32 {
    1
}
fn d_2() -> u32 {
    2
}
fn d_3() -> usize {
    3
}
fn d_5() -> u32 {
    5
}
fn d_8() -> u32 {
    8
}
fn d_8usize() -> usize {
    8
}
fn d_10() -> u64 {
    10
}
fn d_20() -> u64 {
    20
}
fn d_24() -> u32 {
    24
}
fn d_100() -> u64 {
    100
}
fn d_100u() -> u32 {
    100
}
fn d_120() -> u64 {
    120
}
fn d_180() -> u64 {
    180
}
fn d_300() -> u64 {
    300
}
fn d_600() -> u64 {
    600
}
fn d_3600() -> u64 {
    3600
}
fn d_7d() -> u64 {
    7 * 24 * 3600
}
fn d_5mib() -> usize {
    5 * 1024 * 1024
}
fn d_10mib() -> usize {
    10 * 1024 * 1024
}
fn d_1gib() -> u64 {
    1024 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let cfg = Config::default();
        assert_eq!(cfg.limits.max_concurrent_per_user, 2);
        assert_eq!(cfg.limits.max_turns, 8);
        assert_eq!(cfg.limits.max_tool_calls, 24);
        assert_eq!(cfg.sandbox.pool_size, 3);
        assert_eq!(cfg.sandbox.flush_debounce_ms, 100);
        assert_eq!(cfg.sandbox.max_buffered_bytes, 5 * 1024 * 1024);
        assert_eq!(cfg.limits.max_raw_response_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.workflow.lock_ttl_secs, 300);
        assert_eq!(cfg.workflow.state_ttl_secs, 3600);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            [server]
            port = 8080

            [sandbox]
            pool_size = 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.sandbox.pool_size, 1);
        assert_eq!(cfg.sandbox.workspace_root, "/home/node/edward");
        assert_eq!(cfg.limits.max_turns, 8);
    }

    #[test]
    fn validate_flags_zero_gate() {
        let mut cfg = Config::default();
        cfg.limits.max_concurrent_per_user = 0;
        let findings = cfg.validate();
        assert!(findings.iter().any(|f| f.contains("max_concurrent_per_user")));
    }

    #[test]
    fn validate_clean_defaults() {
        assert!(Config::default().validate().is_empty());
    }
}
