//! The engine: durable phase sequencing with locks and bounded retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use uuid::Uuid;

use ed_domain::config::WorkflowConfig;
use ed_domain::error::{Error, Result};
use ed_domain::workflow::{PlanStepStatus, StepResult, Workflow, WorkflowStatus, WorkflowStep};
use ed_storage::KvStore;

use crate::lock::LockGuard;
use crate::phases;
use crate::runner::PhaseRunner;

/// Backoff before retry `n` (1-based): `min(10s, 2^(n-1) · 1s)`.
fn backoff(retry: u32) -> Duration {
    let secs = 1u64 << (retry.saturating_sub(1)).min(4);
    Duration::from_secs(secs.min(10))
}

fn state_key(id: &Uuid) -> String {
    format!("workflow:{id}")
}

pub struct WorkflowEngine {
    kv: Arc<dyn KvStore>,
    runner: Arc<dyn PhaseRunner>,
    config: WorkflowConfig,
    /// Identifies this process as a lock holder.
    holder_id: String,
}

impl WorkflowEngine {
    pub fn new(kv: Arc<dyn KvStore>, runner: Arc<dyn PhaseRunner>, config: WorkflowConfig) -> Self {
        Self {
            kv,
            runner,
            config,
            holder_id: Uuid::new_v4().to_string(),
        }
    }

    // ── Persistence ──────────────────────────────────────────────────

    pub async fn create(&self, user_id: &str, chat_id: &str) -> Result<Workflow> {
        let workflow = Workflow::new(user_id, chat_id);
        self.persist(&workflow).await?;
        tracing::info!(workflow_id = %workflow.id, chat_id, "workflow created");
        Ok(workflow)
    }

    pub async fn load(&self, id: &Uuid) -> Result<Option<Workflow>> {
        match self.kv.get(&state_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn persist(&self, workflow: &Workflow) -> Result<()> {
        self.kv
            .set(
                &state_key(&workflow.id),
                &serde_json::to_string(workflow)?,
                Some(Duration::from_secs(self.config.state_ttl_secs)),
            )
            .await
    }

    /// Freeze the workflow as cancelled and delete its durable record.
    pub async fn cancel(&self, workflow: &mut Workflow) -> Result<()> {
        if workflow.status.is_terminal() {
            return Ok(());
        }
        workflow.status = WorkflowStatus::Cancelled;
        workflow.touch();
        self.kv.delete(&state_key(&workflow.id)).await?;
        tracing::info!(workflow_id = %workflow.id, "workflow cancelled");
        Ok(())
    }

    // ── Advance ──────────────────────────────────────────────────────

    /// Execute the current phase and move the state machine.
    ///
    /// Exactly one advance proceeds per workflow at a time; a concurrent
    /// caller gets a non-fatal "already in progress" result. Terminal
    /// workflows refuse with an error.
    pub async fn advance(
        &self,
        workflow: &mut Workflow,
        input: Option<Value>,
    ) -> Result<StepResult> {
        if workflow.status.is_terminal() {
            return Err(Error::Validation(format!(
                "workflow {} is {:?} and frozen",
                workflow.id, workflow.status
            )));
        }

        let step = workflow.current_step;
        let prev_status = workflow.status;
        workflow.status = WorkflowStatus::Running;
        if let Some(key) = phases::plan_key(step) {
            if let Some(plan) = workflow.context.plan.as_mut() {
                plan.set_status(key, PlanStepStatus::InProgress);
            }
        }
        workflow.touch();
        self.persist(workflow).await?;

        // ── Locks: per-workflow always, per-phase where applicable ──
        let lock_ttl = Duration::from_secs(self.config.lock_ttl_secs);
        let Some(workflow_lock) = LockGuard::acquire(
            self.kv.clone(),
            &format!("workflow:{}", workflow.id),
            &self.holder_id,
            lock_ttl,
        )
        .await?
        else {
            workflow.status = prev_status;
            return Ok(busy_result(step));
        };

        let phase_lock_name = match step {
            WorkflowStep::Build => workflow
                .sandbox_id
                .as_ref()
                .map(|sid| format!("build:{sid}")),
            WorkflowStep::ResolvePackages => Some(format!("resolve:{}", workflow.id)),
            _ => None,
        };
        let phase_lock = match phase_lock_name {
            None => None,
            Some(name) => {
                match LockGuard::acquire(self.kv.clone(), &name, &self.holder_id, lock_ttl).await? {
                    Some(guard) => Some(guard),
                    None => {
                        workflow_lock.release().await;
                        workflow.status = prev_status;
                        return Ok(busy_result(step));
                    }
                }
            }
        };

        // ── Attempts with exponential backoff ───────────────────────
        let policy = phases::policy(step);
        let started = Instant::now();
        tracing::debug!(workflow_id = %workflow.id, step = ?step, "phase started");

        let mut retry_count = 0u32;
        let mut success = false;
        let mut data: Option<Value> = None;
        let mut last_error: Option<Error> = None;

        for attempt in 1..=policy.max_retries.max(1) {
            if attempt > 1 {
                retry_count = attempt - 1;
                tokio::time::sleep(backoff(retry_count)).await;
                tracing::debug!(attempt, "retrying phase");
            }
            match tokio::time::timeout(
                policy.timeout,
                self.runner.run_phase(step, workflow, input.as_ref()),
            )
            .await
            {
                Ok(Ok(d)) => {
                    success = true;
                    data = d;
                    break;
                }
                Ok(Err(e)) => {
                    let retryable = !matches!(e, Error::Auth(_) | Error::Validation(_));
                    tracing::warn!(error = %e, attempt, "phase attempt failed");
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
                Err(_) => {
                    tracing::warn!(attempt, timeout_secs = policy.timeout.as_secs(), "phase attempt timed out");
                    last_error = Some(Error::Timeout(format!(
                        "{step:?} exceeded {}s",
                        policy.timeout.as_secs()
                    )));
                }
            }
        }

        // Validation-pipeline failures carry the retry prompt forward so
        // the orchestrator can feed it into the next LLM turn.
        if !success {
            if let Some(Error::ValidationPipeline {
                stage,
                errors,
                retry_prompt,
            }) = last_error.as_ref()
            {
                data = Some(serde_json::json!({
                    "stage": stage,
                    "errors": errors,
                    "retry_prompt": retry_prompt,
                }));
            }
        }

        let result = StepResult {
            step,
            success,
            error: last_error.as_ref().map(ToString::to_string).filter(|_| !success),
            data,
            duration_ms: started.elapsed().as_millis() as u64,
            retry_count,
        };
        workflow.history.push(result.clone());

        if let Some(key) = phases::plan_key(step) {
            if let Some(plan) = workflow.context.plan.as_mut() {
                plan.set_status(
                    key,
                    if success {
                        PlanStepStatus::Done
                    } else {
                        PlanStepStatus::Failed
                    },
                );
            }
        }

        // ── Transition ──────────────────────────────────────────────
        if success {
            if step == WorkflowStep::Recover {
                // Redo the phase that drove us into recovery.
                workflow.current_step = workflow.last_non_recover_step();
            } else if step == WorkflowStep::Deploy {
                workflow.status = WorkflowStatus::Completed;
            } else if let Some(next) = step.next() {
                workflow.current_step = next;
            }
        } else {
            let recover_budget = phases::policy(WorkflowStep::Recover).max_retries;
            let recover_used = workflow
                .history
                .iter()
                .filter(|r| r.step == WorkflowStep::Recover)
                .count() as u32;
            if step != WorkflowStep::Recover && recover_used < recover_budget {
                workflow.current_step = WorkflowStep::Recover;
            } else {
                workflow.status = WorkflowStatus::Failed;
            }
        }
        workflow.touch();

        if let Some(guard) = phase_lock {
            guard.release().await;
        }
        workflow_lock.release().await;
        self.persist(workflow).await?;

        Ok(result)
    }
}

fn busy_result(step: WorkflowStep) -> StepResult {
    StepResult {
        step,
        success: false,
        error: Some("workflow advance already in progress".into()),
        data: None,
        duration_ms: 0,
        retry_count: 0,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
