//! Stream session orchestrator.
//!
//! Drives one request end to end: calls the LLM, feeds the chunk stream
//! through the tag parser, applies sandbox and workflow side effects in
//! parser order, re-emits every event to the SSE channel, and finalizes
//! with a single terminal meta frame. Sandbox errors are reported and
//! the stream continues; LLM errors tear the stream down.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ed_domain::error::{Error, Result};
use ed_domain::event::{LoopStopReason, MetaPhase, StreamEvent, TerminationReason};
use ed_domain::workflow::{Workflow, WorkflowStep};
use ed_parser::Parser;
use ed_providers::{LlmClient, LlmMessage, StreamOpts};
use ed_sandbox::normalize_workspace_path;
use ed_workflow::WorkflowEngine;

use crate::state::AppState;

use super::loopdetect::ProgressDetector;
use super::phase_runner::GatewayPhaseRunner;
use super::prompt::build_system_prompt;
use super::runs::{Run, RunState, RunStatus};
use super::tools;
use super::truncate_str;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Generate,
    Fix,
    Edit,
}

pub struct SessionInput {
    pub user_id: String,
    pub chat_id: String,
    pub api_key: String,
    pub user_content: String,
    pub mode: SessionMode,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub is_new_chat: bool,
    pub history: Vec<LlmMessage>,
    pub project_context: Option<String>,
    /// Resume an existing workflow instead of creating one.
    pub workflow_id: Option<Uuid>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Emitter — every frame goes to the run log and the client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Emitter {
    state: AppState,
    run_id: Uuid,
    tx: mpsc::Sender<StreamEvent>,
    client_gone: bool,
}

impl Emitter {
    async fn emit(&mut self, event: StreamEvent) {
        self.state.runs.emit(&self.run_id, event.clone());
        if !self.client_gone && self.tx.send(event).await.is_err() {
            self.client_gone = true;
        }
    }
}

/// Mutable per-session bookkeeping for file side effects.
#[derive(Default)]
struct SideState {
    current_file: Option<String>,
    /// Set while an invalid or failed file block is being swallowed.
    skip_file: bool,
    sandbox_tag_seen: bool,
    done_seen: bool,
    file_ends: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_session — entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spawn the session loop. Returns the run id and the event channel the
/// SSE layer drains. Client disconnects are observed as a dropped
/// receiver or a cancelled chat token.
pub fn run_session(state: AppState, input: SessionInput) -> (Uuid, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel::<StreamEvent>(256);

    let run = Run::new(
        input.chat_id.clone(),
        input.user_id.clone(),
        input.user_message_id.clone(),
        input.assistant_message_id.clone(),
    );
    let run_id = run.id;
    state.runs.insert(run);
    state.runs.update(&run_id, |r| {
        r.status = RunStatus::Running;
        r.state = RunState::Init;
    });

    let cancel = state.cancels.register(&input.chat_id);
    let chat_id = input.chat_id.clone();
    let spawn_state = state;

    tokio::spawn(async move {
        let mut emitter = Emitter {
            state: spawn_state.clone(),
            run_id,
            tx,
            client_gone: false,
        };
        let result = run_session_inner(&spawn_state, input, &mut emitter, &cancel, run_id).await;
        spawn_state.cancels.remove(&chat_id);

        if let Err(error) = result {
            finalize_failure(&spawn_state, &mut emitter, run_id, &chat_id, error).await;
        }

        if let Some(run) = spawn_state.runs.get(&run_id) {
            spawn_state.runs.persist(&run);
        }
        spawn_state.runs.cleanup_channel(&run_id);
    });

    (run_id, rx)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_session_inner — the protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_session_inner(
    state: &AppState,
    input: SessionInput,
    emitter: &mut Emitter,
    cancel: &CancellationToken,
    run_id: Uuid,
) -> Result<()> {
    // ── 1. Session-start meta ───────────────────────────────────────
    emitter
        .emit(StreamEvent::Meta {
            phase: MetaPhase::SessionStart,
            chat_id: Some(input.chat_id.clone()),
            user_message_id: Some(input.user_message_id.clone()),
            assistant_message_id: Some(input.assistant_message_id.clone()),
            run_id: Some(run_id.to_string()),
            is_new_chat: Some(input.is_new_chat),
            turn: None,
            termination_reason: None,
            loop_stop_reason: None,
        })
        .await;

    // ── Workflow + engine (per session, so LLM phases use the caller
    //    key) ──────────────────────────────────────────────────────────
    let runner = GatewayPhaseRunner::new(
        state.sandboxes.clone(),
        state.llm.clone(),
        state.objects.clone(),
        state.config.clone(),
        input.api_key.clone(),
    );
    let engine = Arc::new(WorkflowEngine::new(
        state.kv.clone(),
        Arc::new(runner),
        state.config.workflow.clone(),
    ));

    let mut workflow = match input.workflow_id {
        Some(id) => match engine.load(&id).await? {
            Some(wf) => wf,
            None => engine.create(&input.user_id, &input.chat_id).await?,
        },
        None => engine.create(&input.user_id, &input.chat_id).await?,
    };
    if workflow.context.intent.is_none() {
        workflow.context.intent = Some(truncate_str(&input.user_content, 500));
    }

    state.runs.update(&run_id, |r| {
        r.metadata = json!({ "workflow": { "id": workflow.id } });
    });

    // ── 2. Fix/edit: reattach the project state ─────────────────────
    if matches!(input.mode, SessionMode::Fix | SessionMode::Edit)
        && state.sandboxes.get_active(&input.chat_id).is_none()
    {
        match state
            .sandboxes
            .ensure(&input.user_id, &input.chat_id, workflow.context.framework.as_deref())
            .await
        {
            Ok(sandbox_id) => {
                if let Err(e) = state.sandboxes.restore(&sandbox_id).await {
                    emitter
                        .emit(StreamEvent::error(
                            format!("could not restore project state: {e}"),
                            Some(e.code()),
                        ))
                        .await;
                }
                workflow.sandbox_id = Some(sandbox_id);
                engine.persist(&workflow).await?;
            }
            Err(e) => {
                // Degrade to pure generation.
                emitter
                    .emit(StreamEvent::error(
                        format!("sandbox unavailable: {e}"),
                        Some(e.code()),
                    ))
                    .await;
            }
        }
    }

    // ── 3. Assemble messages ────────────────────────────────────────
    let mut messages = vec![build_system_prompt(
        input.mode,
        workflow.context.framework.as_deref(),
        input.project_context.as_deref(),
    )];
    messages.extend(input.history.iter().cloned());
    messages.push(LlmMessage::user(&input.user_content));

    // ── 4. Turn loop ────────────────────────────────────────────────
    let limits = &state.config.limits;
    let deadline = Instant::now() + Duration::from_secs(limits.stream_timeout_secs);
    let opts = StreamOpts {
        model: Some(state.config.llm.default_model.clone()),
        temperature: Some(0.2),
        ..Default::default()
    };

    let mut parser = Parser::new();
    let mut flags = SideState::default();
    let mut detector = ProgressDetector::new();
    let mut full_raw = String::new();
    let mut total_tool_calls: u32 = 0;
    let mut loop_stop: Option<LoopStopReason> = None;
    let mut finished = false;
    let mut last_turn: u32 = 0;
    let mut checkpointed_file_ends: u32 = 0;

    'turns: for turn in 0..limits.max_turns {
        last_turn = turn;
        state.runs.update(&run_id, |r| {
            r.current_turn = turn;
            r.state = RunState::LlmStream;
        });

        let mut stream = state
            .llm
            .stream(&input.api_key, &messages, cancel.child_token(), &opts)
            .await?;
        let mut turn_raw = String::new();
        let mut pending_tool: Option<StreamEvent> = None;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    drop(stream);
                    finalize_disconnect(state, &engine, &mut workflow, &input, &mut parser, emitter, &mut flags, run_id, turn).await;
                    return Ok(());
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout(format!(
                        "stream exceeded {}s wall clock",
                        limits.stream_timeout_secs
                    )));
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?; // LLM stream errors tear the session down

            full_raw.push_str(&chunk);
            turn_raw.push_str(&chunk);
            if full_raw.len() > limits.max_raw_response_bytes {
                return Err(Error::Validation(format!(
                    "response exceeded {} bytes",
                    limits.max_raw_response_bytes
                )));
            }

            for event in parser.process(&chunk) {
                let is_tool = matches!(
                    event,
                    StreamEvent::Command { .. } | StreamEvent::WebSearch { .. }
                );
                if is_tool {
                    emitter.emit(event.clone()).await;
                    pending_tool = Some(event);
                } else {
                    apply_event(state, &engine, &mut workflow, emitter, &mut flags, &input, run_id, event)
                        .await;
                }
            }

            // Checkpoint every N closed files so a detached worker can
            // resume without replaying side effects.
            let interval = limits.checkpoint_file_interval.max(1);
            if flags.file_ends >= checkpointed_file_ends + interval {
                checkpointed_file_ends = flags.file_ends;
                checkpoint(state, run_id, turn, &full_raw, &messages, &flags, total_tool_calls);
            }

            if pending_tool.is_some() {
                break;
            }
            if emitter.client_gone {
                drop(stream);
                finalize_disconnect(state, &engine, &mut workflow, &input, &mut parser, emitter, &mut flags, run_id, turn).await;
                return Ok(());
            }
        }
        drop(stream);

        let Some(tool_event) = pending_tool else {
            // Clean end of the model's output.
            for event in parser.flush() {
                apply_event(state, &engine, &mut workflow, emitter, &mut flags, &input, run_id, event)
                    .await;
            }
            if !flags.done_seen {
                tracing::debug!(turn, "stream ended without an explicit done tag");
            }
            finished = true;
            break 'turns;
        };

        // ── Tool dispatch (pause the stream, run, inject, next turn) ─
        total_tool_calls += 1;
        if total_tool_calls > limits.max_tool_calls {
            loop_stop = Some(LoopStopReason::ToolLimit);
            break 'turns;
        }

        let (signature, tool_name, outcome) = match &tool_event {
            StreamEvent::Command { name, args } => (
                format!("command:{name}:{}", args.join("\u{1}")),
                name.clone(),
                tools::dispatch_command(state, workflow.sandbox_id.as_deref(), name, args).await,
            ),
            StreamEvent::WebSearch { query, max_results } => (
                format!("search:{query}:{max_results}"),
                "web_search".to_string(),
                tools::dispatch_web_search(state, query, *max_results).await,
            ),
            _ => unreachable!("only tool events reach dispatch"),
        };

        if detector.observe(&[signature]) {
            loop_stop = Some(LoopStopReason::NoProgress);
            break 'turns;
        }

        state.runs.update(&run_id, |r| r.state = RunState::ToolExec);
        let (result_text, is_error) = outcome;
        tracing::debug!(tool = %tool_name, is_error, turn, "tool dispatched");

        messages.push(LlmMessage::assistant(&turn_raw));
        messages.push(LlmMessage::system(format!(
            "Tool result ({tool_name}){}:\n{result_text}",
            if is_error { " [error]" } else { "" }
        )));

        state.runs.update(&run_id, |r| r.state = RunState::NextTurn);
        checkpoint(state, run_id, turn + 1, &full_raw, &messages, &flags, total_tool_calls);
    }

    if !finished && loop_stop.is_none() {
        // Ran out of turns while the model was still asking for tools.
        loop_stop = Some(LoopStopReason::ToolLimit);
    }
    if !finished {
        for event in parser.flush() {
            apply_event(state, &engine, &mut workflow, emitter, &mut flags, &input, run_id, event)
                .await;
        }
    }

    // ── 5. Clean end ────────────────────────────────────────────────
    finalize_normal(
        state, &engine, workflow, emitter, run_id, &full_raw, last_turn, loop_stop,
    )
    .await;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event side effects
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Apply one parser event's side effect, then re-emit it downstream.
/// Side effects are awaited before the SSE write so client-observed
/// order matches container-observed order. Sandbox problems become
/// `error` frames; the stream keeps going.
#[allow(clippy::too_many_arguments)]
async fn apply_event(
    state: &AppState,
    engine: &Arc<WorkflowEngine>,
    workflow: &mut Workflow,
    emitter: &mut Emitter,
    flags: &mut SideState,
    input: &SessionInput,
    run_id: Uuid,
    event: StreamEvent,
) {
    match &event {
        StreamEvent::SandboxStart => {
            flags.sandbox_tag_seen = true;
            if workflow.sandbox_id.is_none() {
                match state
                    .sandboxes
                    .ensure(&input.user_id, &input.chat_id, workflow.context.framework.as_deref())
                    .await
                {
                    Ok(sandbox_id) => {
                        workflow.sandbox_id = Some(sandbox_id);
                        if let Err(e) = engine.persist(workflow).await {
                            tracing::warn!(error = %e, "workflow persist failed");
                        }
                    }
                    Err(e) => {
                        emitter
                            .emit(StreamEvent::error(
                                format!("sandbox acquisition failed: {e}"),
                                Some(e.code()),
                            ))
                            .await;
                    }
                }
            }
            state.runs.update(&run_id, |r| r.state = RunState::Apply);
            emitter.emit(event).await;
        }

        StreamEvent::FileStart { path } => {
            let Some(sandbox_id) = workflow.sandbox_id.clone() else {
                flags.skip_file = true;
                emitter
                    .emit(StreamEvent::error(
                        format!("no sandbox available for {path}"),
                        Some("sandbox"),
                    ))
                    .await;
                return;
            };
            if normalize_workspace_path(path).is_err() {
                flags.skip_file = true;
                emitter
                    .emit(StreamEvent::error(
                        format!("rejected path {path:?}"),
                        Some("invalid_path"),
                    ))
                    .await;
                return;
            }
            match state.sandboxes.prepare_file(&sandbox_id, path).await {
                Ok(()) => {
                    flags.current_file = Some(path.clone());
                    flags.skip_file = false;
                    emitter.emit(event).await;
                }
                Err(e) => {
                    flags.skip_file = true;
                    emitter
                        .emit(StreamEvent::error(
                            format!("could not prepare {path}: {e}"),
                            Some(e.code()),
                        ))
                        .await;
                }
            }
        }

        StreamEvent::FileContent { delta } => {
            if flags.skip_file {
                return;
            }
            let (Some(sandbox_id), Some(path)) =
                (workflow.sandbox_id.clone(), flags.current_file.clone())
            else {
                return;
            };
            if let Err(e) = state.sandboxes.write_file(&sandbox_id, &path, delta).await {
                flags.skip_file = true;
                emitter
                    .emit(StreamEvent::error(
                        format!("write to {path} failed: {e}"),
                        Some(e.code()),
                    ))
                    .await;
                return;
            }
            emitter.emit(event).await;
        }

        StreamEvent::FileEnd => {
            if flags.skip_file {
                // The matching file_start was suppressed; swallow the close.
                flags.skip_file = false;
                return;
            }
            flags.current_file = None;
            flags.file_ends += 1;
            emitter.emit(event).await;
        }

        StreamEvent::InstallContent {
            dependencies,
            framework,
        } => {
            drive_install(engine, workflow, emitter, dependencies, framework.as_deref()).await;
            emitter.emit(event).await;
        }

        StreamEvent::SandboxEnd => {
            if let Some(sandbox_id) = workflow.sandbox_id.clone() {
                if let Err(e) = state.sandboxes.flush(&sandbox_id, false).await {
                    emitter
                        .emit(StreamEvent::error(
                            format!("flush failed: {e}"),
                            Some(e.code()),
                        ))
                        .await;
                }
                // Backup is fire-and-forget; it may land after [DONE].
                let sandboxes = state.sandboxes.clone();
                tokio::spawn(async move {
                    if let Err(e) = sandboxes.backup(&sandbox_id).await {
                        tracing::warn!(error = %e, "background backup failed");
                    }
                });
            }
            flags.current_file = None;
            flags.skip_file = false;
            emitter.emit(event).await;
        }

        StreamEvent::Meta {
            phase: MetaPhase::SessionEnd,
            ..
        } => {
            flags.done_seen = true;
            emitter.emit(event).await;
        }

        // Text, parser errors, install start/end: no side effect.
        _ => emitter.emit(event).await,
    }
}

/// Drive RESOLVE_PACKAGES and INSTALL_PACKAGES off an install block,
/// advancing through PLAN/ANALYZE first when the workflow is still at
/// the top. Failures are soft: reported and the stream continues.
async fn drive_install(
    engine: &Arc<WorkflowEngine>,
    workflow: &mut Workflow,
    emitter: &mut Emitter,
    dependencies: &[String],
    framework: Option<&str>,
) {
    if workflow.context.framework.is_none() {
        if let Some(framework) = framework {
            workflow.context.framework = Some(framework.to_string());
        }
    }

    let deps_input = json!({ "packages": dependencies });
    while matches!(
        workflow.current_step,
        WorkflowStep::Plan | WorkflowStep::Analyze
    ) && !workflow.status.is_terminal()
    {
        if !advance_soft(engine, workflow, None, emitter).await {
            return;
        }
    }
    if workflow.current_step == WorkflowStep::ResolvePackages
        && !workflow.status.is_terminal()
        && !advance_soft(engine, workflow, Some(deps_input.clone()), emitter).await
    {
        return;
    }
    if workflow.current_step == WorkflowStep::InstallPackages && !workflow.status.is_terminal() {
        advance_soft(engine, workflow, Some(deps_input), emitter).await;
    }
}

/// One engine advance, reporting failure as an error frame. Returns
/// whether the phase succeeded.
async fn advance_soft(
    engine: &Arc<WorkflowEngine>,
    workflow: &mut Workflow,
    input: Option<Value>,
    emitter: &mut Emitter,
) -> bool {
    match engine.advance(workflow, input).await {
        Ok(result) if result.success => true,
        Ok(result) => {
            emitter
                .emit(StreamEvent::error(
                    result
                        .error
                        .unwrap_or_else(|| format!("{:?} failed", result.step)),
                    Some("workflow"),
                ))
                .await;
            false
        }
        Err(e) => {
            emitter
                .emit(StreamEvent::error(e.to_string(), Some(e.code())))
                .await;
            false
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Finalization paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn terminal_meta(
    turn: u32,
    reason: TerminationReason,
    loop_stop: Option<LoopStopReason>,
) -> StreamEvent {
    StreamEvent::Meta {
        phase: MetaPhase::SessionComplete,
        chat_id: None,
        user_message_id: None,
        assistant_message_id: None,
        run_id: None,
        is_new_chat: None,
        turn: Some(turn),
        termination_reason: Some(reason),
        loop_stop_reason: loop_stop,
    }
}

/// Clean end: final flush, kick the detached build/deploy advance, and
/// emit the terminal meta. The build is fire-and-forget and may land
/// after `[DONE]`.
async fn finalize_normal(
    state: &AppState,
    engine: &Arc<WorkflowEngine>,
    workflow: Workflow,
    emitter: &mut Emitter,
    run_id: Uuid,
    full_raw: &str,
    turn: u32,
    loop_stop: Option<LoopStopReason>,
) {
    state.runs.update(&run_id, |r| r.state = RunState::Apply);
    if let Some(sandbox_id) = workflow.sandbox_id.clone() {
        if let Err(e) = state.sandboxes.flush(&sandbox_id, true).await {
            tracing::warn!(error = %e, "final flush failed");
        }
    }

    let build_state = state.clone();
    let build_engine = engine.clone();
    tokio::spawn(drive_completion(build_state, build_engine, workflow, run_id));

    state.runs.set_output_preview(&run_id, full_raw);
    state.runs.update(&run_id, |r| {
        r.termination_reason = Some(TerminationReason::Normal);
        r.loop_stop_reason = loop_stop;
        r.finish(RunStatus::Completed, RunState::Complete);
    });
    emitter
        .emit(terminal_meta(turn, TerminationReason::Normal, loop_stop))
        .await;
}

/// Drive the workflow through its remaining phases (GENERATE check,
/// BUILD, DEPLOY, with the engine's RECOVER loop in between). Build and
/// deploy outcomes are appended to the run's event log.
async fn drive_completion(
    state: AppState,
    engine: Arc<WorkflowEngine>,
    mut workflow: Workflow,
    run_id: Uuid,
) {
    let mut advances = 0;
    while !workflow.status.is_terminal() && advances < 16 {
        advances += 1;
        let step = workflow.current_step;
        match engine.advance(&mut workflow, None).await {
            Ok(result) => {
                if step == WorkflowStep::Build {
                    state.runs.emit(
                        &run_id,
                        StreamEvent::BuildStatus {
                            status: if result.success { "passed" } else { "failed" }.into(),
                            preview_url: None,
                            error_report: result
                                .data
                                .as_ref()
                                .and_then(|d| d.get("retry_prompt"))
                                .and_then(Value::as_str)
                                .map(str::to_owned),
                        },
                    );
                }
                if !result.success && result.error.as_deref() == Some("workflow advance already in progress")
                {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, workflow_id = %workflow.id, "completion advance failed");
                break;
            }
        }
    }

    if workflow.status == ed_domain::workflow::WorkflowStatus::Completed {
        if let Some(url) = workflow.context.preview_url.clone() {
            state.runs.emit(&run_id, StreamEvent::PreviewUrl { url: url.clone() });
            state.runs.emit(
                &run_id,
                StreamEvent::BuildStatus {
                    status: "deployed".into(),
                    preview_url: Some(url),
                    error_report: None,
                },
            );
        }
    }
}

/// Client went away: close open side effects, keep the sandbox for a
/// future resume, record the run as cancelled.
#[allow(clippy::too_many_arguments)]
async fn finalize_disconnect(
    state: &AppState,
    engine: &Arc<WorkflowEngine>,
    workflow: &mut Workflow,
    input: &SessionInput,
    parser: &mut Parser,
    emitter: &mut Emitter,
    flags: &mut SideState,
    run_id: Uuid,
    turn: u32,
) {
    // Synthetic closes from the parser drain buffered file content and
    // reset the current-file bookkeeping.
    for event in parser.flush() {
        apply_event(state, engine, workflow, emitter, flags, input, run_id, event).await;
    }
    if let Some(sandbox_id) = workflow.sandbox_id.clone() {
        if let Err(e) = state.sandboxes.flush(&sandbox_id, false).await {
            tracing::warn!(error = %e, "flush on disconnect failed");
        }
    }
    if let Err(e) = engine.persist(workflow).await {
        tracing::warn!(error = %e, "workflow persist on disconnect failed");
    }

    state.runs.update(&run_id, |r| {
        r.termination_reason = Some(TerminationReason::ClientDisconnect);
        r.finish(RunStatus::Cancelled, RunState::Cancelled);
    });
    emitter
        .emit(terminal_meta(turn, TerminationReason::ClientDisconnect, None))
        .await;
    tracing::info!(run_id = %run_id, "client disconnected, sandbox kept for resume");
}

/// Hard failure (LLM error, oversized response, wall-clock timeout):
/// best-effort sandbox cleanup, error frame, terminal meta.
async fn finalize_failure(
    state: &AppState,
    emitter: &mut Emitter,
    run_id: Uuid,
    chat_id: &str,
    error: Error,
) {
    if let Some(sandbox_id) = state.sandboxes.get_active(chat_id) {
        if let Err(e) = state.sandboxes.cleanup(&sandbox_id).await {
            tracing::warn!(error = %e, "cleanup after failure failed");
        }
    }

    let reason = match &error {
        Error::Timeout(_) => TerminationReason::StreamTimeout,
        _ => TerminationReason::StreamFailed,
    };
    emitter
        .emit(StreamEvent::error(error.to_string(), Some(error.code())))
        .await;

    let turn = state.runs.get(&run_id).map(|r| r.current_turn).unwrap_or(0);
    state.runs.update(&run_id, |r| {
        r.error_message = Some(error.to_string());
        r.termination_reason = Some(reason);
        r.finish(RunStatus::Failed, RunState::Failed);
    });
    emitter.emit(terminal_meta(turn, reason, None)).await;
}

/// Record the resume checkpoint on the run (turn boundaries and every
/// N file closes).
fn checkpoint(
    state: &AppState,
    run_id: Uuid,
    turn: u32,
    full_raw: &str,
    messages: &[LlmMessage],
    flags: &SideState,
    total_tool_calls: u32,
) {
    let agent_messages: Vec<Value> = messages
        .iter()
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect();
    state.runs.update(&run_id, |r| {
        if !r.metadata.is_object() {
            r.metadata = json!({});
        }
        r.metadata["resume_checkpoint"] = json!({
            "turn": turn,
            "full_raw_response": full_raw,
            "agent_messages": agent_messages,
            "sandbox_tag_detected": flags.sandbox_tag_seen,
            "total_tool_calls_in_run": total_tool_calls,
        });
    });
    if let Some(run) = state.runs.get(&run_id) {
        state.runs.persist(&run);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use ed_storage::KvStore as _;

    const INSTALL_BLOCK: &str =
        "<edward_install>\nframework: next\npackages: \n</edward_install>\n";

    fn input(chat_id: &str) -> SessionInput {
        SessionInput {
            user_id: "u1".into(),
            chat_id: chat_id.into(),
            api_key: "key".into(),
            user_content: "Build a landing page".into(),
            mode: SessionMode::Generate,
            user_message_id: "um-1".into(),
            assistant_message_id: "am-1".into(),
            is_new_chat: true,
            history: Vec::new(),
            project_context: None,
            workflow_id: None,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        tokio::time::timeout(Duration::from_secs(20), async {
            let mut out = Vec::new();
            while let Some(event) = rx.recv().await {
                out.push(event);
            }
            out
        })
        .await
        .expect("session did not terminate")
    }

    fn kinds(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::kind).collect()
    }

    fn terminal(events: &[StreamEvent]) -> (TerminationReason, Option<LoopStopReason>) {
        match events.last() {
            Some(StreamEvent::Meta {
                phase: MetaPhase::SessionComplete,
                termination_reason: Some(reason),
                loop_stop_reason,
                ..
            }) => (*reason, *loop_stop_reason),
            other => panic!("last event is not a terminal meta: {other:?}"),
        }
    }

    async fn read_sandbox_file(state: &AppState, chat_id: &str, path: &str) -> String {
        let sandbox_id = state.sandboxes.get_active(chat_id).expect("active sandbox");
        state
            .sandboxes
            .exec(&sandbox_id, &format!("cat '{path}'"), None, Duration::from_secs(5))
            .await
            .expect("cat")
            .stdout
    }

    async fn wait_for_terminal_workflow(state: &AppState, run_id: Uuid) -> Workflow {
        let run = state.runs.get(&run_id).expect("run");
        let wf_id: Uuid = run.metadata["workflow"]["id"]
            .as_str()
            .expect("workflow id in run metadata")
            .parse()
            .expect("uuid");
        for _ in 0..200 {
            if let Ok(Some(raw)) = state.kv.get(&format!("workflow:{wf_id}")).await {
                let workflow: Workflow = serde_json::from_str(&raw).expect("workflow json");
                if workflow.status.is_terminal() {
                    return workflow;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("workflow never reached a terminal status");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn happy_path_streams_files_and_completes_workflow() {
        let response = format!(
            "Here is your landing page.\n{INSTALL_BLOCK}\
             <edward_sandbox>\n\
             <file path=\"src/components/ui.tsx\">export const UI = () => null;\n</file>\n\
             <file path=\"src/app/page.tsx\">export default function Page() {{ return null; }}\n</file>\n\
             </edward_sandbox>\nAll done.<edward_done/>"
        );
        let (state, _dir) = test_state(vec![response], |_| {});

        let (run_id, rx) = run_session(state.clone(), input("c1"));
        let events = collect(rx).await;

        // Session-start first, with identity fields.
        match &events[0] {
            StreamEvent::Meta {
                phase: MetaPhase::SessionStart,
                chat_id,
                is_new_chat,
                run_id: meta_run,
                ..
            } => {
                assert_eq!(chat_id.as_deref(), Some("c1"));
                assert_eq!(*is_new_chat, Some(true));
                assert_eq!(meta_run.as_deref(), Some(run_id.to_string().as_str()));
            }
            other => panic!("first event: {other:?}"),
        }

        // Frame ordering: install block, then sandbox with both files, in
        // parser order.
        let ks = kinds(&events);
        let pos = |k: &str| ks.iter().position(|x| *x == k).unwrap_or_else(|| panic!("{k} missing"));
        assert!(pos("install_start") < pos("install_content"));
        assert!(pos("install_content") < pos("install_end"));
        assert!(pos("install_end") < pos("sandbox_start"));
        assert!(pos("sandbox_start") < pos("file_start"));
        assert!(pos("file_end") < pos("sandbox_end"));
        assert_eq!(ks.iter().filter(|k| **k == "file_start").count(), 2);
        assert_eq!(ks.iter().filter(|k| **k == "file_end").count(), 2);
        assert!(!ks.contains(&"error"));

        assert_eq!(terminal(&events), (TerminationReason::Normal, None));

        // Both files landed in the sandbox.
        let ui = read_sandbox_file(&state, "c1", "src/components/ui.tsx").await;
        assert_eq!(ui, "export const UI = () => null;\n");
        let page = read_sandbox_file(&state, "c1", "src/app/page.tsx").await;
        assert!(page.contains("export default function Page"));

        // The detached pipeline drives the workflow to completion with a
        // preview URL.
        let workflow = wait_for_terminal_workflow(&state, run_id).await;
        assert_eq!(workflow.status, ed_domain::workflow::WorkflowStatus::Completed);
        assert!(workflow
            .context
            .preview_url
            .as_deref()
            .unwrap()
            .contains("/u1/c1"));
        assert_eq!(workflow.context.framework.as_deref(), Some("next"));

        // Run record is terminal and persisted.
        let run = state.runs.get(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.termination_reason, Some(TerminationReason::Normal));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_path_is_rejected_and_stream_continues() {
        let response = format!(
            "{INSTALL_BLOCK}<edward_sandbox>\
             <file path=\"../../etc/passwd\">root:x:0:0\n</file>\
             <file path=\"src/ok.ts\">export const ok = 1;\n</file>\
             </edward_sandbox><edward_done/>"
        );
        let (state, _dir) = test_state(vec![response], |_| {});

        let (_run_id, rx) = run_session(state.clone(), input("c2"));
        let events = collect(rx).await;

        // The traversal path produced an error frame and no file_start.
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::Error { code: Some(c), .. } if c == "invalid_path"
        )));
        let file_starts: Vec<&StreamEvent> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::FileStart { .. }))
            .collect();
        assert_eq!(file_starts.len(), 1);
        assert!(matches!(
            file_starts[0],
            StreamEvent::FileStart { path } if path == "src/ok.ts"
        ));

        assert_eq!(terminal(&events).0, TerminationReason::Normal);
        assert_eq!(
            read_sandbox_file(&state, "c2", "src/ok.ts").await,
            "export const ok = 1;\n"
        );
        // Nothing escaped the workspace.
        let sandbox_id = state.sandboxes.get_active("c2").unwrap();
        let out = state
            .sandboxes
            .exec(&sandbox_id, "ls", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!out.stdout.contains("passwd"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_response_aborts_the_stream() {
        let long_text = "x".repeat(4096);
        let (state, _dir) = test_state(vec![long_text], |c| {
            c.limits.max_raw_response_bytes = 64;
        });

        let (run_id, rx) = run_session(state.clone(), input("c3"));
        let events = collect(rx).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Error { message, .. } if message.contains("64 bytes"))));
        assert_eq!(terminal(&events).0, TerminationReason::StreamFailed);
        assert_eq!(state.runs.get(&run_id).unwrap().status, RunStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wall_clock_timeout_aborts_the_stream() {
        let long_text = "y".repeat(65_536);
        let (state, _dir) = test_state(vec![long_text], |c| {
            c.limits.stream_timeout_secs = 0;
        });

        let (run_id, rx) = run_session(state.clone(), input("c4"));
        let events = collect(rx).await;

        assert_eq!(terminal(&events).0, TerminationReason::StreamTimeout);
        let run = state.runs.get(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.as_deref().unwrap().contains("wall clock"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_disconnect_keeps_the_sandbox() {
        let big_body = "const line = 1;\n".repeat(4096);
        let response = format!(
            "{INSTALL_BLOCK}<edward_sandbox><file path=\"src/app/page.tsx\">{big_body}</file></edward_sandbox>"
        );
        let (state, _dir) = test_state(vec![response], |_| {});

        let (run_id, mut rx) = run_session(state.clone(), input("c5"));
        let events = tokio::time::timeout(Duration::from_secs(20), async {
            let mut out = Vec::new();
            while let Some(event) = rx.recv().await {
                // Hang up as soon as file content starts flowing.
                if matches!(event, StreamEvent::FileContent { .. }) && out.len() < 64 {
                    state.cancels.cancel("c5");
                }
                out.push(event);
            }
            out
        })
        .await
        .expect("session did not terminate");

        assert_eq!(terminal(&events).0, TerminationReason::ClientDisconnect);
        // The parser's synthetic closes balanced the file block.
        let ks = kinds(&events);
        assert_eq!(
            ks.iter().filter(|k| **k == "file_start").count(),
            ks.iter().filter(|k| **k == "file_end").count()
        );

        // Sandbox survives for a future resume; run is cancelled.
        assert!(state.sandboxes.get_active("c5").is_some());
        let run = state.runs.get(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.state, RunState::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tool_call_pauses_and_resumes_with_result() {
        let turn1 = "Let me check the workspace.\
                     <edward_command command=\"ls\" args='[\".\"]'/>"
            .to_string();
        let turn2 = format!(
            "{INSTALL_BLOCK}<edward_sandbox><file path=\"a.txt\">hi\n</file></edward_sandbox><edward_done/>"
        );
        let (state, _dir) = test_state(vec![turn1, turn2], |_| {});

        let (run_id, rx) = run_session(state.clone(), input("c6"));
        let events = collect(rx).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Command { name, .. } if name == "ls")));
        assert_eq!(terminal(&events).0, TerminationReason::Normal);
        assert_eq!(read_sandbox_file(&state, "c6", "a.txt").await, "hi\n");

        let run = state.runs.get(&run_id).unwrap();
        assert_eq!(run.current_turn, 1);
        // The turn boundary wrote a resume checkpoint.
        let checkpoint = &run.metadata["resume_checkpoint"];
        assert_eq!(checkpoint["turn"], 1);
        assert_eq!(checkpoint["total_tool_calls_in_run"], 1);
        assert!(checkpoint["agent_messages"].as_array().unwrap().len() >= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tool_budget_terminates_with_tool_limit() {
        let cmd_a = "<edward_command command=\"ls\" args='[\"src\"]'/>".to_string();
        let cmd_b = "<edward_command command=\"wc\" args='[\"a.txt\"]'/>".to_string();
        let (state, _dir) = test_state(vec![cmd_a, cmd_b, "unused".into()], |c| {
            c.limits.max_tool_calls = 1;
        });

        let (_run_id, rx) = run_session(state.clone(), input("c7"));
        let events = collect(rx).await;

        let (reason, loop_stop) = terminal(&events);
        assert_eq!(reason, TerminationReason::Normal);
        assert_eq!(loop_stop, Some(LoopStopReason::ToolLimit));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn repeated_tool_batch_stops_as_no_progress() {
        let cmd = "<edward_command command=\"ls\" args='[\"src\"]'/>".to_string();
        let (state, _dir) = test_state(vec![cmd.clone(), cmd, "unused".into()], |_| {});

        let (_run_id, rx) = run_session(state.clone(), input("c8"));
        let events = collect(rx).await;

        let (reason, loop_stop) = terminal(&events);
        assert_eq!(reason, TerminationReason::Normal);
        assert_eq!(loop_stop, Some(LoopStopReason::NoProgress));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn llm_failure_tears_the_session_down() {
        let (state, _dir) = test_state(Vec::new(), |_| {});

        let (run_id, rx) = run_session(state.clone(), input("c9"));
        let events = collect(rx).await;

        let ks = kinds(&events);
        assert_eq!(ks.first(), Some(&"meta"));
        assert!(ks.contains(&"error"));
        assert_eq!(terminal(&events).0, TerminationReason::StreamFailed);
        assert_eq!(state.runs.get(&run_id).unwrap().status, RunStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fix_mode_restores_the_backed_up_project() {
        let (state, _dir) = test_state(
            vec!["Reviewed, nothing to change.<edward_done/>".to_string()],
            |_| {},
        );

        // Seed a prior project: files, backup, then destroy the sandbox.
        let seeded = state.sandboxes.ensure("u1", "c10", None).await.unwrap();
        state.sandboxes.prepare_file(&seeded, "src/app.tsx").await.unwrap();
        state
            .sandboxes
            .write_file(&seeded, "src/app.tsx", "export const App = 1;\n")
            .await
            .unwrap();
        state.sandboxes.flush(&seeded, true).await.unwrap();
        state.sandboxes.backup(&seeded).await.unwrap();
        state.sandboxes.cleanup(&seeded).await.unwrap();

        let mut session_input = input("c10");
        session_input.mode = SessionMode::Fix;
        session_input.is_new_chat = false;
        let (_run_id, rx) = run_session(state.clone(), session_input);
        let events = collect(rx).await;

        assert_eq!(terminal(&events).0, TerminationReason::Normal);
        // The workspace was reattached from the backup before streaming.
        assert_eq!(
            read_sandbox_file(&state, "c10", "src/app.tsx").await,
            "export const App = 1;\n"
        );
    }
}
