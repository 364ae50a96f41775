//! Durable workflow records — one per generate/fix/edit request moving
//! through the fixed pipeline phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status & steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses are frozen: the engine refuses further advances.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Pipeline phases in their fixed execution order. RECOVER sits outside
/// the order and is entered only on phase failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStep {
    Plan,
    Analyze,
    ResolvePackages,
    InstallPackages,
    Generate,
    Build,
    Deploy,
    Recover,
}

impl WorkflowStep {
    /// The fixed forward order; `Recover` has no successor here.
    pub fn next(self) -> Option<WorkflowStep> {
        match self {
            Self::Plan => Some(Self::Analyze),
            Self::Analyze => Some(Self::ResolvePackages),
            Self::ResolvePackages => Some(Self::InstallPackages),
            Self::InstallPackages => Some(Self::Generate),
            Self::Generate => Some(Self::Build),
            Self::Build => Some(Self::Deploy),
            Self::Deploy | Self::Recover => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStepKey {
    Analyze,
    ResolveDeps,
    Generate,
    ValidateBuild,
    Deploy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub title: String,
    pub key: PlanStepKey,
    pub status: PlanStepStatus,
}

/// Structured checklist attached to a workflow's context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// A plan is complete iff every step is done or failed.
    pub fn is_complete(&self) -> bool {
        !self.steps.is_empty()
            && self
                .steps
                .iter()
                .all(|s| matches!(s.status, PlanStepStatus::Done | PlanStepStatus::Failed))
    }

    /// A critical failure is a failed GENERATE or VALIDATE_BUILD step.
    pub fn has_critical_failure(&self) -> bool {
        self.steps.iter().any(|s| {
            s.status == PlanStepStatus::Failed
                && matches!(s.key, PlanStepKey::Generate | PlanStepKey::ValidateBuild)
        })
    }

    /// Flip the status of every step with the given key.
    pub fn set_status(&mut self, key: PlanStepKey, status: PlanStepStatus) {
        for step in self.steps.iter_mut().filter(|s| s.key == key) {
            step.status = status;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step results & context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: WorkflowStep,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Phase-specific payload. Validation failures carry a `retry_prompt`
    /// here for the orchestrator to feed into the next LLM turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub duration_ms: u64,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default)]
    pub resolved_packages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub user_id: String,
    pub chat_id: String,
    pub status: WorkflowStatus,
    pub current_step: WorkflowStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub context: WorkflowContext,
    #[serde(default)]
    pub history: Vec<StepResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(user_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            chat_id: chat_id.into(),
            status: WorkflowStatus::Pending,
            current_step: WorkflowStep::Plan,
            sandbox_id: None,
            context: WorkflowContext::default(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// The invariant behind `status = completed`: current step is DEPLOY
    /// and a preview URL is recorded.
    pub fn can_complete(&self) -> bool {
        self.current_step == WorkflowStep::Deploy && self.context.preview_url.is_some()
    }

    /// The last phase reached before entering RECOVER, i.e. the phase the
    /// engine redoes when recovery succeeds.
    pub fn last_non_recover_step(&self) -> WorkflowStep {
        self.history
            .iter()
            .rev()
            .map(|r| r.step)
            .find(|s| *s != WorkflowStep::Recover)
            .unwrap_or(WorkflowStep::Plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_order_is_fixed() {
        let mut step = WorkflowStep::Plan;
        let mut order = vec![step];
        while let Some(next) = step.next() {
            order.push(next);
            step = next;
        }
        assert_eq!(
            order,
            vec![
                WorkflowStep::Plan,
                WorkflowStep::Analyze,
                WorkflowStep::ResolvePackages,
                WorkflowStep::InstallPackages,
                WorkflowStep::Generate,
                WorkflowStep::Build,
                WorkflowStep::Deploy,
            ]
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Pending.is_terminal());
    }

    #[test]
    fn plan_completeness() {
        let mut plan = Plan {
            steps: vec![
                PlanStep {
                    id: "1".into(),
                    title: "Analyze the request".into(),
                    key: PlanStepKey::Analyze,
                    status: PlanStepStatus::Done,
                },
                PlanStep {
                    id: "2".into(),
                    title: "Generate sources".into(),
                    key: PlanStepKey::Generate,
                    status: PlanStepStatus::InProgress,
                },
            ],
        };
        assert!(!plan.is_complete());
        plan.set_status(PlanStepKey::Generate, PlanStepStatus::Failed);
        assert!(plan.is_complete());
        assert!(plan.has_critical_failure());
    }

    #[test]
    fn non_critical_failure() {
        let plan = Plan {
            steps: vec![PlanStep {
                id: "1".into(),
                title: "Resolve deps".into(),
                key: PlanStepKey::ResolveDeps,
                status: PlanStepStatus::Failed,
            }],
        };
        assert!(!plan.has_critical_failure());
    }

    #[test]
    fn last_non_recover_step_skips_recover_entries() {
        let mut wf = Workflow::new("u1", "c1");
        for (step, success) in [
            (WorkflowStep::Plan, true),
            (WorkflowStep::Build, false),
            (WorkflowStep::Recover, true),
        ] {
            wf.history.push(StepResult {
                step,
                success,
                error: None,
                data: None,
                duration_ms: 1,
                retry_count: 0,
            });
        }
        assert_eq!(wf.last_non_recover_step(), WorkflowStep::Build);
    }

    #[test]
    fn completion_requires_deploy_and_preview() {
        let mut wf = Workflow::new("u1", "c1");
        wf.current_step = WorkflowStep::Deploy;
        assert!(!wf.can_complete());
        wf.context.preview_url = Some("https://preview.example/abc".into());
        assert!(wf.can_complete());
    }
}
