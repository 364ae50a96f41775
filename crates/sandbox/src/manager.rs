//! The sandbox manager singleton.
//!
//! Owns every sandbox lifecycle: a warm pool of paused containers,
//! per-sandbox serialized file operations with debounced buffered
//! writes, tar.gz backup/restore against the object store, TTL sweeps,
//! and the startup reconciliation pass — the only place allowed to act
//! on containers that are not in the active map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use ed_domain::config::SandboxConfig;
use ed_domain::error::{Error, Result};
use ed_storage::{KvStore, ObjectStore};

use crate::backup;
use crate::paths::normalize_workspace_path;
use crate::runtime::{ContainerRuntime, CreateOpts, ExecOutput};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Free,
    Active,
    Paused,
    Destroyed,
}

/// Snapshot of one sandbox handle.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxInstance {
    pub id: String,
    pub container_id: String,
    pub user_id: String,
    pub chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub state: SandboxState,
}

#[derive(Default)]
struct Buffers {
    /// path → pending appended content.
    files: HashMap<String, String>,
    bytes: usize,
    timer_scheduled: bool,
}

struct SandboxEntry {
    meta: Mutex<SandboxInstance>,
    /// Serializes prepare/write-forced-flush/flush/cleanup per sandbox.
    mailbox: AsyncMutex<()>,
    buffers: Mutex<Buffers>,
    /// Bumped after every container write pass; lets concurrent flush
    /// callers detect that their work was already done while queued.
    flush_gen: AtomicU64,
}

#[derive(Default)]
struct Registry {
    /// sandbox_id → entry.
    active: HashMap<String, Arc<SandboxEntry>>,
    /// chat_id → sandbox_id.
    by_chat: HashMap<String, String>,
    /// Paused pool container ids, ready to be acquired.
    pool: Vec<String>,
}

struct Shared {
    runtime: Arc<dyn ContainerRuntime>,
    objects: Arc<dyn ObjectStore>,
    kv: Arc<dyn KvStore>,
    config: SandboxConfig,
    registry: Mutex<Registry>,
    refill_in_flight: AtomicBool,
}

/// Cheap-to-clone handle to the process-wide sandbox manager.
#[derive(Clone)]
pub struct SandboxManager {
    shared: Arc<Shared>,
}

impl SandboxManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        objects: Arc<dyn ObjectStore>,
        kv: Arc<dyn KvStore>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                runtime,
                objects,
                kv,
                config,
                registry: Mutex::new(Registry::default()),
                refill_in_flight: AtomicBool::new(false),
            }),
        }
    }

    fn create_opts(&self) -> CreateOpts {
        let cfg = &self.shared.config;
        CreateOpts {
            label: cfg.label.clone(),
            workspace_root: cfg.workspace_root.clone(),
            memory_bytes: cfg.memory_bytes,
            cpus: cfg.cpus,
            pids_limit: cfg.pids_limit,
            network: false,
        }
    }

    fn quick_timeout(&self) -> Duration {
        Duration::from_secs(self.shared.config.exec_timeout_secs)
    }

    fn entry(&self, sandbox_id: &str) -> Result<Arc<SandboxEntry>> {
        self.shared
            .registry
            .lock()
            .active
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| Error::Sandbox(format!("unknown sandbox {sandbox_id}")))
    }

    // ── Startup / shutdown ───────────────────────────────────────────

    /// Reconcile labeled containers left over from a previous process and
    /// fill the warm pool. Runs once at service start.
    pub async fn init(&self) -> Result<()> {
        self.reconcile().await?;
        self.fill_pool().await;
        Ok(())
    }

    /// Adopt or remove labeled containers not tracked by this process.
    async fn reconcile(&self) -> Result<()> {
        let label = self.shared.config.label.clone();
        let found = self.shared.runtime.list_labeled(&label).await?;
        for summary in found {
            let tracked = {
                let registry = self.shared.registry.lock();
                registry.pool.contains(&summary.container_id)
                    || registry
                        .active
                        .values()
                        .any(|e| e.meta.lock().container_id == summary.container_id)
            };
            if tracked {
                continue;
            }

            let adopt = self.shared.registry.lock().pool.len() < self.shared.config.pool_size;
            if adopt && self.adopt_into_pool(&summary.container_id).await {
                tracing::info!(container_id = %summary.container_id, "adopted orphan container into pool");
            } else {
                tracing::info!(container_id = %summary.container_id, "removing orphan container");
                if let Err(e) = self.shared.runtime.remove(&summary.container_id).await {
                    tracing::warn!(error = %e, container_id = %summary.container_id, "orphan removal failed");
                }
            }
        }
        Ok(())
    }

    /// Reset an orphan and park it in the pool. Returns false when the
    /// container can't be driven (caller removes it instead).
    async fn adopt_into_pool(&self, container_id: &str) -> bool {
        let runtime = &self.shared.runtime;
        let reset = async {
            runtime.unpause(container_id).await?;
            self.reset_workspace(container_id).await?;
            runtime.pause(container_id).await
        };
        match reset.await {
            Ok(()) => {
                self.shared.registry.lock().pool.push(container_id.to_string());
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, container_id, "orphan adoption failed");
                false
            }
        }
    }

    async fn reset_workspace(&self, container_id: &str) -> Result<()> {
        let out = self
            .shared
            .runtime
            .exec(container_id, "find . -mindepth 1 -delete", None, self.quick_timeout())
            .await?;
        if !out.success() {
            return Err(Error::Sandbox(format!(
                "workspace reset failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn fill_pool(&self) {
        loop {
            let deficit = {
                let registry = self.shared.registry.lock();
                self.shared.config.pool_size.saturating_sub(registry.pool.len())
            };
            if deficit == 0 {
                break;
            }
            match self.shared.runtime.create(&self.create_opts()).await {
                Ok(container_id) => {
                    self.shared.registry.lock().pool.push(container_id);
                }
                Err(e) => {
                    // Pool refill is opportunistic; on-demand create still works.
                    tracing::warn!(error = %e, "pool refill create failed");
                    break;
                }
            }
        }
    }

    /// Kick an asynchronous pool refill, deduplicated behind a
    /// singleflight flag.
    fn spawn_refill(&self) {
        if self.shared.refill_in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            manager.fill_pool().await;
            manager.shared.refill_in_flight.store(false, Ordering::Release);
        });
    }

    /// Destroy active sandboxes. Pool containers stay paused on disk for
    /// the next process to reconcile.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.shared.registry.lock().active.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.cleanup(&id).await {
                tracing::warn!(error = %e, sandbox_id = %id, "cleanup during shutdown failed");
            }
        }
    }

    // ── Acquisition ──────────────────────────────────────────────────

    /// The active sandbox for a chat, or a fresh provision.
    pub async fn ensure(
        &self,
        user_id: &str,
        chat_id: &str,
        framework: Option<&str>,
    ) -> Result<String> {
        if let Some(id) = self.get_active(chat_id) {
            return Ok(id);
        }
        self.provision(user_id, chat_id, framework).await
    }

    /// Acquire a container (pool first, on-demand otherwise), reset its
    /// workspace, and register it as the chat's active sandbox.
    pub async fn provision(
        &self,
        user_id: &str,
        chat_id: &str,
        framework: Option<&str>,
    ) -> Result<String> {
        // At most one active sandbox per chat.
        if let Some(existing) = self.get_active(chat_id) {
            return Ok(existing);
        }

        let pooled = self.shared.registry.lock().pool.pop();
        let container_id = match pooled {
            Some(id) => id,
            None => {
                tracing::debug!("pool empty, creating container on demand");
                self.shared.runtime.create(&self.create_opts()).await?
            }
        };

        self.shared.runtime.unpause(&container_id).await?;
        self.reset_workspace(&container_id).await?;

        let sandbox_id = Uuid::new_v4().to_string();
        let entry = Arc::new(SandboxEntry {
            meta: Mutex::new(SandboxInstance {
                id: sandbox_id.clone(),
                container_id,
                user_id: user_id.to_string(),
                chat_id: chat_id.to_string(),
                framework: framework.map(str::to_owned),
                expires_at: Utc::now()
                    + chrono::Duration::seconds(self.shared.config.ttl_secs as i64),
                state: SandboxState::Active,
            }),
            mailbox: AsyncMutex::new(()),
            buffers: Mutex::new(Buffers::default()),
            flush_gen: AtomicU64::new(0),
        });

        {
            let mut registry = self.shared.registry.lock();
            registry.active.insert(sandbox_id.clone(), entry);
            registry.by_chat.insert(chat_id.to_string(), sandbox_id.clone());
        }
        self.spawn_refill();

        tracing::info!(sandbox_id = %sandbox_id, chat_id = %chat_id, "sandbox provisioned");
        Ok(sandbox_id)
    }

    pub fn get_active(&self, chat_id: &str) -> Option<String> {
        let registry = self.shared.registry.lock();
        let id = registry.by_chat.get(chat_id)?;
        let entry = registry.active.get(id)?;
        let result = (entry.meta.lock().state == SandboxState::Active).then(|| id.clone());
        result
    }

    pub fn instance(&self, sandbox_id: &str) -> Option<SandboxInstance> {
        let registry = self.shared.registry.lock();
        registry.active.get(sandbox_id).map(|e| e.meta.lock().clone())
    }

    // ── File operations ──────────────────────────────────────────────

    /// Create parent directories and truncate the file. Idempotent; also
    /// drops any content still buffered for the path.
    pub async fn prepare_file(&self, sandbox_id: &str, path: &str) -> Result<()> {
        let path = normalize_workspace_path(path)?;
        let entry = self.entry(sandbox_id)?;
        let _guard = entry.mailbox.lock().await;

        {
            let mut buffers = entry.buffers.lock();
            if let Some(dropped) = buffers.files.remove(&path) {
                buffers.bytes = buffers.bytes.saturating_sub(dropped.len());
            }
        }

        let container_id = entry.meta.lock().container_id.clone();
        let script = match parent_dir(&path) {
            Some(dir) => format!("mkdir -p {} && : > {}", shell_quote(dir), shell_quote(&path)),
            None => format!(": > {}", shell_quote(&path)),
        };
        let out = self
            .shared
            .runtime
            .exec(&container_id, &script, None, self.quick_timeout())
            .await?;
        if !out.success() {
            return Err(Error::Sandbox(format!(
                "prepare {path} failed: {}",
                out.stderr.trim()
            )));
        }
        self.touch(&entry);
        Ok(())
    }

    /// Append content to the sandbox's in-memory buffer for the path and
    /// schedule a debounced flush. Exceeding the per-sandbox buffer cap
    /// forces a synchronous flush instead.
    pub async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()> {
        let path = normalize_workspace_path(path)?;
        let entry = self.entry(sandbox_id)?;

        let (force, schedule) = {
            let mut buffers = entry.buffers.lock();
            buffers.files.entry(path).or_default().push_str(content);
            buffers.bytes += content.len();
            let force = buffers.bytes >= self.shared.config.max_buffered_bytes;
            let schedule = !force && !buffers.timer_scheduled;
            if schedule {
                buffers.timer_scheduled = true;
            }
            (force, schedule)
        };

        if schedule {
            let manager = self.clone();
            let id = sandbox_id.to_string();
            let debounce = Duration::from_millis(self.shared.config.flush_debounce_ms);
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                if let Ok(entry) = manager.entry(&id) {
                    entry.buffers.lock().timer_scheduled = false;
                }
                if let Err(e) = manager.flush(&id, false).await {
                    tracing::warn!(error = %e, sandbox_id = %id, "debounced flush failed");
                }
            });
        }

        if force {
            self.flush(sandbox_id, false).await?;
        }
        Ok(())
    }

    /// Drain all buffered content into the container.
    ///
    /// Concurrent callers share one write pass: whoever holds the mailbox
    /// drains the buffers; queued callers observe the bumped generation
    /// and return once that write completed.
    pub async fn flush(&self, sandbox_id: &str, _final_flush: bool) -> Result<()> {
        let entry = self.entry(sandbox_id)?;
        let gen_before = entry.flush_gen.load(Ordering::Acquire);
        let _guard = entry.mailbox.lock().await;

        if entry.flush_gen.load(Ordering::Acquire) != gen_before
            && entry.buffers.lock().files.is_empty()
        {
            // Our buffered content rode along with the write that just
            // finished.
            return Ok(());
        }

        self.flush_locked(&entry).await
    }

    /// Perform the write pass. Caller holds the mailbox.
    async fn flush_locked(&self, entry: &Arc<SandboxEntry>) -> Result<()> {
        let drained: Vec<(String, String)> = {
            let mut buffers = entry.buffers.lock();
            buffers.bytes = 0;
            let mut files: Vec<_> = buffers.files.drain().collect();
            files.sort_by(|a, b| a.0.cmp(&b.0));
            files
        };
        if drained.is_empty() {
            return Ok(());
        }

        let container_id = entry.meta.lock().container_id.clone();
        for (path, content) in drained {
            let script = match parent_dir(&path) {
                Some(dir) => format!(
                    "mkdir -p {} && cat >> {}",
                    shell_quote(dir),
                    shell_quote(&path)
                ),
                None => format!("cat >> {}", shell_quote(&path)),
            };
            let out = self
                .shared
                .runtime
                .exec(
                    &container_id,
                    &script,
                    Some(content.into_bytes()),
                    self.quick_timeout(),
                )
                .await?;
            if !out.success() {
                return Err(Error::Sandbox(format!(
                    "write {path} failed: {}",
                    out.stderr.trim()
                )));
            }
        }

        entry.flush_gen.fetch_add(1, Ordering::AcqRel);
        self.touch(entry);
        Ok(())
    }

    /// Run a command inside the sandbox workspace.
    pub async fn exec(
        &self,
        sandbox_id: &str,
        script: &str,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let entry = self.entry(sandbox_id)?;
        let container_id = entry.meta.lock().container_id.clone();
        let out = self.shared.runtime.exec(&container_id, script, stdin, timeout).await?;
        self.touch(&entry);
        Ok(out)
    }

    /// Toggle container network access (installs only).
    pub async fn set_network(&self, sandbox_id: &str, enabled: bool) -> Result<()> {
        let entry = self.entry(sandbox_id)?;
        let container_id = entry.meta.lock().container_id.clone();
        self.shared.runtime.set_network(&container_id, enabled).await
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Flush, destroy the container, and drop all buffers. A container
    /// that can't be destroyed is left for the reconciler.
    pub async fn cleanup(&self, sandbox_id: &str) -> Result<()> {
        let entry = self.entry(sandbox_id)?;
        let _guard = entry.mailbox.lock().await;

        if let Err(e) = self.flush_locked(&entry).await {
            tracing::warn!(error = %e, sandbox_id, "flush during cleanup failed");
        }

        let (container_id, chat_id) = {
            let mut meta = entry.meta.lock();
            meta.state = SandboxState::Destroyed;
            (meta.container_id.clone(), meta.chat_id.clone())
        };

        if let Err(e) = self.shared.runtime.remove(&container_id).await {
            tracing::warn!(error = %e, container_id = %container_id, "container removal failed, reconciler will sweep it");
        }

        let mut registry = self.shared.registry.lock();
        registry.active.remove(sandbox_id);
        if registry.by_chat.get(&chat_id).map(String::as_str) == Some(sandbox_id) {
            registry.by_chat.remove(&chat_id);
        }
        entry.buffers.lock().files.clear();

        tracing::info!(sandbox_id, "sandbox destroyed");
        Ok(())
    }

    /// Destroy active sandboxes whose TTL has lapsed.
    pub async fn sweep_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = {
            let registry = self.shared.registry.lock();
            registry
                .active
                .iter()
                .filter(|(_, e)| {
                    let meta = e.meta.lock();
                    meta.state == SandboxState::Active && meta.expires_at <= now
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in expired {
            tracing::info!(sandbox_id = %id, "sandbox TTL expired");
            if let Err(e) = self.cleanup(&id).await {
                tracing::warn!(error = %e, sandbox_id = %id, "expired cleanup failed");
            }
        }
    }

    fn touch(&self, entry: &Arc<SandboxEntry>) {
        entry.meta.lock().expires_at =
            Utc::now() + chrono::Duration::seconds(self.shared.config.ttl_secs as i64);
    }

    // ── Backup / restore ─────────────────────────────────────────────

    /// Stream a tar.gz of the workspace (sans derived artifacts) plus a
    /// JSON snapshot to the object store. Best-effort: storage and
    /// container-gone failures degrade to a no-op.
    pub async fn backup(&self, sandbox_id: &str) -> Result<()> {
        let entry = self.entry(sandbox_id)?;
        let (container_id, user_id, chat_id) = {
            let meta = entry.meta.lock();
            (meta.container_id.clone(), meta.user_id.clone(), meta.chat_id.clone())
        };

        let excludes: Vec<String> = backup::BACKUP_EXCLUDES.iter().map(|s| s.to_string()).collect();
        let tar_bytes = match self.shared.runtime.read_archive(&container_id, &excludes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                // Container already gone — nothing to back up.
                tracing::warn!(error = %e, sandbox_id, "backup archive read failed");
                return Ok(());
            }
        };

        let archive = backup::gzip(&tar_bytes)?;
        let snapshot = backup::build_snapshot(&tar_bytes)?;

        let objects = &self.shared.objects;
        if let Err(e) = objects.put(&backup::backup_key(&user_id, &chat_id), archive).await {
            tracing::warn!(error = %e, chat_id = %chat_id, "backup upload failed");
            return Ok(());
        }
        if let Err(e) = objects.put(&backup::snapshot_key(&user_id, &chat_id), snapshot).await {
            tracing::warn!(error = %e, chat_id = %chat_id, "snapshot upload failed");
        }
        if let Err(e) = self
            .shared
            .kv
            .set(
                &backup::backup_hint_key(&chat_id),
                "1",
                Some(Duration::from_secs(7 * 24 * 3600)),
            )
            .await
        {
            tracing::warn!(error = %e, "backup hint write failed");
        }

        tracing::debug!(sandbox_id, chat_id = %chat_id, "backup uploaded");
        Ok(())
    }

    /// Restore the chat's last backup into the sandbox workspace.
    /// Skips silently when no backup exists.
    pub async fn restore(&self, sandbox_id: &str) -> Result<bool> {
        let entry = self.entry(sandbox_id)?;
        let (container_id, user_id, chat_id) = {
            let meta = entry.meta.lock();
            (meta.container_id.clone(), meta.user_id.clone(), meta.chat_id.clone())
        };

        // Negative-cache hint: a missing hint still falls through to the
        // store, an explicit miss there is authoritative.
        let key = backup::backup_key(&user_id, &chat_id);
        let Some(archive) = self.shared.objects.get(&key).await? else {
            return Ok(false);
        };
        let tar_bytes = backup::gunzip(&archive)?;
        self.shared.runtime.write_archive(&container_id, tar_bytes).await?;
        self.touch(&entry);
        tracing::info!(sandbox_id, chat_id = %chat_id, "workspace restored from backup");
        Ok(true)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(dir, _)| dir)
}

/// Single-quote a path for `sh -c`.
fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessRuntime;
    use crate::runtime::{ContainerRuntime, ContainerSummary};
    use ed_storage::{MemoryKv, MemoryObjectStore};
    use std::sync::atomic::AtomicUsize;

    /// Delegating runtime that counts `cat >>` write passes.
    struct CountingRuntime {
        inner: ProcessRuntime,
        write_execs: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for CountingRuntime {
        async fn create(&self, opts: &CreateOpts) -> ed_domain::Result<String> {
            self.inner.create(opts).await
        }
        async fn unpause(&self, id: &str) -> ed_domain::Result<()> {
            self.inner.unpause(id).await
        }
        async fn pause(&self, id: &str) -> ed_domain::Result<()> {
            self.inner.pause(id).await
        }
        async fn remove(&self, id: &str) -> ed_domain::Result<()> {
            self.inner.remove(id).await
        }
        async fn set_network(&self, id: &str, enabled: bool) -> ed_domain::Result<()> {
            self.inner.set_network(id, enabled).await
        }
        async fn exec(
            &self,
            id: &str,
            script: &str,
            stdin: Option<Vec<u8>>,
            timeout: Duration,
        ) -> ed_domain::Result<ExecOutput> {
            if script.contains("cat >>") {
                self.write_execs.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.exec(id, script, stdin, timeout).await
        }
        async fn read_archive(&self, id: &str, excludes: &[String]) -> ed_domain::Result<Vec<u8>> {
            self.inner.read_archive(id, excludes).await
        }
        async fn write_archive(&self, id: &str, tar: Vec<u8>) -> ed_domain::Result<()> {
            self.inner.write_archive(id, tar).await
        }
        async fn list_labeled(&self, label: &str) -> ed_domain::Result<Vec<ContainerSummary>> {
            self.inner.list_labeled(label).await
        }
    }

    fn test_config(pool_size: usize) -> SandboxConfig {
        SandboxConfig {
            pool_size,
            flush_debounce_ms: 20,
            ..SandboxConfig::default()
        }
    }

    fn make_manager(dir: &std::path::Path, pool_size: usize) -> (SandboxManager, Arc<CountingRuntime>) {
        let runtime = Arc::new(CountingRuntime {
            inner: ProcessRuntime::new(dir),
            write_execs: AtomicUsize::new(0),
        });
        let manager = SandboxManager::new(
            runtime.clone(),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryKv::new()),
            test_config(pool_size),
        );
        (manager, runtime)
    }

    async fn read_file(manager: &SandboxManager, id: &str, path: &str) -> String {
        manager
            .exec(id, &format!("cat {}", shell_quote(path)), None, Duration::from_secs(5))
            .await
            .unwrap()
            .stdout
    }

    #[tokio::test]
    async fn one_active_sandbox_per_chat() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = make_manager(dir.path(), 0);

        let a = manager.ensure("u1", "c1", None).await.unwrap();
        let b = manager.ensure("u1", "c1", None).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(manager.get_active("c1").as_deref(), Some(a.as_str()));
        assert!(manager.get_active("c2").is_none());
    }

    #[tokio::test]
    async fn write_order_preserved_across_flush() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = make_manager(dir.path(), 0);
        let id = manager.ensure("u1", "c1", None).await.unwrap();

        manager.prepare_file(&id, "src/app/page.tsx").await.unwrap();
        for chunk in ["first ", "second ", "third"] {
            manager.write_file(&id, "src/app/page.tsx", chunk).await.unwrap();
        }
        manager.flush(&id, true).await.unwrap();

        assert_eq!(read_file(&manager, &id, "src/app/page.tsx").await, "first second third");
    }

    #[tokio::test]
    async fn prepare_truncates_and_empty_write_leaves_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = make_manager(dir.path(), 0);
        let id = manager.ensure("u1", "c1", None).await.unwrap();

        manager.prepare_file(&id, "a.txt").await.unwrap();
        manager.write_file(&id, "a.txt", "stale").await.unwrap();
        manager.flush(&id, false).await.unwrap();

        // Re-prepare truncates both the file and any buffered content.
        manager.prepare_file(&id, "a.txt").await.unwrap();
        manager.write_file(&id, "a.txt", "").await.unwrap();
        manager.flush(&id, true).await.unwrap();

        assert_eq!(read_file(&manager, &id, "a.txt").await, "");
    }

    #[tokio::test]
    async fn debounced_flush_fires_without_explicit_flush() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = make_manager(dir.path(), 0);
        let id = manager.ensure("u1", "c1", None).await.unwrap();

        manager.prepare_file(&id, "x.txt").await.unwrap();
        manager.write_file(&id, "x.txt", "debounced").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(read_file(&manager, &id, "x.txt").await, "debounced");
    }

    #[tokio::test]
    async fn concurrent_flushes_share_one_write_pass() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, runtime) = make_manager(dir.path(), 0);
        let id = manager.ensure("u1", "c1", None).await.unwrap();

        manager.prepare_file(&id, "y.txt").await.unwrap();
        runtime.write_execs.store(0, Ordering::SeqCst);
        manager.write_file(&id, "y.txt", "payload").await.unwrap();

        let m1 = manager.clone();
        let m2 = manager.clone();
        let id1 = id.clone();
        let id2 = id.clone();
        let f1 = tokio::spawn(async move { m1.flush(&id1, false).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let f2 = tokio::spawn(async move { m2.flush(&id2, false).await });

        f1.await.unwrap().unwrap();
        f2.await.unwrap().unwrap();
        assert_eq!(runtime.write_execs.load(Ordering::SeqCst), 1);

        // A third flush after both returned performs no extra container
        // write because nothing is buffered.
        manager.flush(&id, false).await.unwrap();
        assert_eq!(runtime.write_execs.load(Ordering::SeqCst), 1);
        assert_eq!(read_file(&manager, &id, "y.txt").await, "payload");
    }

    #[tokio::test]
    async fn buffer_cap_forces_synchronous_flush() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(CountingRuntime {
            inner: ProcessRuntime::new(dir.path()),
            write_execs: AtomicUsize::new(0),
        });
        let mut config = test_config(0);
        config.max_buffered_bytes = 8;
        let manager = SandboxManager::new(
            runtime,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryKv::new()),
            config,
        );
        let id = manager.ensure("u1", "c1", None).await.unwrap();

        manager.prepare_file(&id, "big.txt").await.unwrap();
        manager.write_file(&id, "big.txt", "0123456789").await.unwrap();

        // Over the cap: content is on disk without any explicit flush.
        assert_eq!(read_file(&manager, &id, "big.txt").await, "0123456789");
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = make_manager(dir.path(), 0);
        let id = manager.ensure("u1", "c1", None).await.unwrap();

        for bad in ["../../etc/passwd", "/etc/passwd", "a/../../b", "nul\0byte"] {
            let err = manager.prepare_file(&id, bad).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{bad} should be rejected");
        }
    }

    #[tokio::test]
    async fn cleanup_destroys_and_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = make_manager(dir.path(), 0);
        let id = manager.ensure("u1", "c1", None).await.unwrap();

        manager.cleanup(&id).await.unwrap();
        assert!(manager.get_active("c1").is_none());
        assert!(manager.flush(&id, false).await.is_err());

        // The chat can be provisioned again afterwards.
        let id2 = manager.ensure("u1", "c1", None).await.unwrap();
        assert_ne!(id, id2);
    }

    #[tokio::test]
    async fn backup_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = make_manager(dir.path(), 0);
        let id = manager.ensure("u1", "c1", None).await.unwrap();

        manager.prepare_file(&id, "src/a.ts").await.unwrap();
        manager.write_file(&id, "src/a.ts", "export const a = 1;\n").await.unwrap();
        manager.flush(&id, true).await.unwrap();
        manager
            .exec(&id, "mkdir -p node_modules && echo junk > node_modules/x", None, Duration::from_secs(5))
            .await
            .unwrap();

        manager.backup(&id).await.unwrap();
        manager.cleanup(&id).await.unwrap();

        // Fresh sandbox for the same chat gets the files back, minus the
        // excluded directories.
        let id2 = manager.ensure("u1", "c1", None).await.unwrap();
        assert!(manager.restore(&id2).await.unwrap());
        assert_eq!(read_file(&manager, &id2, "src/a.ts").await, "export const a = 1;\n");
        let out = manager
            .exec(&id2, "ls node_modules 2>/dev/null || echo absent", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "absent");
    }

    #[tokio::test]
    async fn restore_without_backup_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = make_manager(dir.path(), 0);
        let id = manager.ensure("u1", "c1", None).await.unwrap();
        assert!(!manager.restore(&id).await.unwrap());
    }

    #[tokio::test]
    async fn pool_is_used_and_refilled() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = make_manager(dir.path(), 2);
        manager.init().await.unwrap();

        let id = manager.ensure("u1", "c1", None).await.unwrap();
        assert!(manager.instance(&id).is_some());

        // Give the async refill a beat; the pool returns to target.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pool_len = manager.shared.registry.lock().pool.len();
        assert_eq!(pool_len, 2);
    }

    #[tokio::test]
    async fn reconcile_adopts_orphans_up_to_pool_size() {
        let dir = tempfile::tempdir().unwrap();
        let orphan_runtime = ProcessRuntime::new(dir.path());
        let opts = CreateOpts {
            label: SandboxConfig::default().label,
            workspace_root: "/home/node/edward".into(),
            memory_bytes: 0,
            cpus: 1,
            pids_limit: 100,
            network: false,
        };
        for _ in 0..3 {
            orphan_runtime.create(&opts).await.unwrap();
        }

        let (manager, _) = make_manager(dir.path(), 2);
        manager.init().await.unwrap();
        let pool_len = manager.shared.registry.lock().pool.len();
        assert_eq!(pool_len, 2);
    }

    #[tokio::test]
    async fn expired_sandboxes_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(CountingRuntime {
            inner: ProcessRuntime::new(dir.path()),
            write_execs: AtomicUsize::new(0),
        });
        let mut config = test_config(0);
        config.ttl_secs = 0;
        let manager = SandboxManager::new(
            runtime,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryKv::new()),
            config,
        );
        let id = manager.ensure("u1", "c1", None).await.unwrap();

        manager.sweep_expired().await;
        assert!(manager.get_active("c1").is_none());
        assert!(manager.instance(&id).is_none());
    }
}
