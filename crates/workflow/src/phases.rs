//! Per-phase execution policy: who runs it, how often it may retry, and
//! how long one attempt may take.

use std::time::Duration;

use ed_domain::workflow::{Plan, PlanStep, PlanStepKey, PlanStepStatus, WorkflowStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// Pure in-process computation.
    Local,
    /// A single-shot LLM call.
    Llm,
    /// Container work (installs, builds, deploys).
    Worker,
    /// Streamed generation plus container verification.
    Hybrid,
}

#[derive(Debug, Clone, Copy)]
pub struct PhasePolicy {
    pub executor: ExecutorKind,
    /// Total attempts for one `advance` of this phase.
    pub max_retries: u32,
    /// Per-attempt wall clock.
    pub timeout: Duration,
}

/// The fixed policy table.
pub fn policy(step: WorkflowStep) -> PhasePolicy {
    use ExecutorKind::*;
    let (executor, max_retries, timeout_secs) = match step {
        WorkflowStep::Plan => (Local, 1, 5),
        WorkflowStep::Analyze => (Llm, 2, 30),
        WorkflowStep::ResolvePackages => (Worker, 3, 60),
        WorkflowStep::InstallPackages => (Worker, 3, 120),
        WorkflowStep::Generate => (Hybrid, 2, 120),
        WorkflowStep::Build => (Worker, 3, 180),
        WorkflowStep::Deploy => (Worker, 2, 60),
        WorkflowStep::Recover => (Llm, 2, 60),
    };
    PhasePolicy {
        executor,
        max_retries,
        timeout: Duration::from_secs(timeout_secs),
    }
}

/// The plan-step entry a pipeline phase reports progress against.
pub fn plan_key(step: WorkflowStep) -> Option<PlanStepKey> {
    match step {
        WorkflowStep::Analyze => Some(PlanStepKey::Analyze),
        WorkflowStep::ResolvePackages | WorkflowStep::InstallPackages => {
            Some(PlanStepKey::ResolveDeps)
        }
        WorkflowStep::Generate => Some(PlanStepKey::Generate),
        WorkflowStep::Build => Some(PlanStepKey::ValidateBuild),
        WorkflowStep::Deploy => Some(PlanStepKey::Deploy),
        WorkflowStep::Plan | WorkflowStep::Recover => None,
    }
}

/// The standard checklist attached by the PLAN phase.
pub fn default_plan() -> Plan {
    let steps = [
        (PlanStepKey::Analyze, "Analyze the request"),
        (PlanStepKey::ResolveDeps, "Resolve dependencies"),
        (PlanStepKey::Generate, "Generate project files"),
        (PlanStepKey::ValidateBuild, "Validate the build"),
        (PlanStepKey::Deploy, "Publish the preview"),
    ];
    Plan {
        steps: steps
            .iter()
            .enumerate()
            .map(|(i, (key, title))| PlanStep {
                id: (i + 1).to_string(),
                title: (*title).to_string(),
                key: *key,
                status: PlanStepStatus::Pending,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_table_matches_spec() {
        assert_eq!(policy(WorkflowStep::Plan).max_retries, 1);
        assert_eq!(policy(WorkflowStep::Build).max_retries, 3);
        assert_eq!(policy(WorkflowStep::Build).timeout, Duration::from_secs(180));
        assert_eq!(policy(WorkflowStep::Deploy).timeout, Duration::from_secs(60));
        assert_eq!(policy(WorkflowStep::Generate).executor, ExecutorKind::Hybrid);
        assert_eq!(policy(WorkflowStep::Recover).executor, ExecutorKind::Llm);
    }

    #[test]
    fn default_plan_covers_all_keys() {
        let plan = default_plan();
        assert_eq!(plan.steps.len(), 5);
        assert!(!plan.is_complete());
        assert!(plan.steps.iter().all(|s| s.status == PlanStepStatus::Pending));
    }

    #[test]
    fn install_reports_against_resolve_deps() {
        assert_eq!(
            plan_key(WorkflowStep::InstallPackages),
            Some(PlanStepKey::ResolveDeps)
        );
        assert_eq!(plan_key(WorkflowStep::Recover), None);
    }
}
