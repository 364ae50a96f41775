//! The seam between the engine and phase side effects.
//!
//! The engine owns sequencing, locking, retries, and persistence; the
//! runner owns what a phase actually does (LLM analysis, container
//! installs and builds, preview publishing). The gateway wires the real
//! runner; tests script one.

use serde_json::Value;

use ed_domain::error::Result;
use ed_domain::workflow::{Workflow, WorkflowStep};

#[async_trait::async_trait]
pub trait PhaseRunner: Send + Sync {
    /// Execute one attempt of `step`.
    ///
    /// Mutates the workflow context (resolved packages, plan revisions,
    /// preview URL, …) and may return phase data recorded in the step
    /// history — validation failures surface a `retry_prompt` there for
    /// the orchestrator's next LLM turn.
    async fn run_phase(
        &self,
        step: WorkflowStep,
        workflow: &mut Workflow,
        input: Option<&Value>,
    ) -> Result<Option<Value>>;
}
