//! Service wiring and lifecycle.
//!
//! Builds the [`AppState`] from config, runs sandbox reconciliation,
//! starts the TTL sweeper, and serves the API with graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use ed_domain::config::Config;
use ed_providers::{DisabledSearch, HttpLlmClient, HttpSearchClient, WebSearchClient};
use ed_sandbox::{ProcessRuntime, SandboxManager};
use ed_storage::{FsObjectStore, KvStore, MemoryKv, ObjectStore};

use crate::api;
use crate::runtime::cancel::CancelMap;
use crate::runtime::gate::ConcurrencyGate;
use crate::runtime::runs::RunStore;
use crate::runtime::tools::COMMAND_ALLOWLIST;
use crate::state::AppState;

/// Interval between sandbox TTL sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn build_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let objects: Arc<dyn ObjectStore> =
        Arc::new(FsObjectStore::new(config.storage.state_dir.join("objects")));

    let runtime = Arc::new(ProcessRuntime::new(config.sandbox.base_dir.clone()));
    let sandboxes = SandboxManager::new(
        runtime,
        objects.clone(),
        kv.clone(),
        config.sandbox.clone(),
    );

    let llm = Arc::new(
        HttpLlmClient::new(
            &config.llm.base_url,
            &config.llm.default_model,
            Duration::from_secs(config.llm.request_timeout_secs),
        )
        .context("LLM client init")?,
    );

    let search: Arc<dyn WebSearchClient> = match config.search.endpoint.as_deref() {
        Some(endpoint) => Arc::new(
            HttpSearchClient::new(
                endpoint,
                config.search.max_results_cap,
                Duration::from_secs(config.search.timeout_secs),
            )
            .context("search client init")?,
        ),
        None => Arc::new(DisabledSearch),
    };

    let runs = Arc::new(RunStore::new(&config.storage.state_dir));
    let gate = Arc::new(ConcurrencyGate::new(
        kv.clone(),
        config.limits.max_concurrent_per_user,
        Duration::from_secs(config.limits.concurrency_ttl_secs),
    ));

    Ok(AppState {
        config,
        kv,
        objects,
        llm,
        search,
        sandboxes,
        runs,
        gate,
        cancels: Arc::new(CancelMap::new()),
        command_allowlist: Arc::new(
            regex::RegexSet::new(COMMAND_ALLOWLIST).context("command allowlist")?,
        ),
    })
}

pub async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    let state = build_state(config.clone())?;

    // Reconcile labeled containers from a previous process and warm the
    // pool before accepting traffic.
    state
        .sandboxes
        .init()
        .await
        .context("sandbox reconciliation")?;

    // Background TTL sweep for idle sandboxes.
    let sweeper = {
        let sandboxes = state.sandboxes.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                sandboxes.sweep_expired().await;
            }
        })
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(addr = %addr, "edward listening");

    let router = api::router(state.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server")?;

    // Drain: destroy active sandboxes; pool containers stay on disk for
    // the next boot's reconciler.
    sweeper.abort();
    state.sandboxes.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler failed");
    }
    tracing::info!("shutdown signal received");
}
