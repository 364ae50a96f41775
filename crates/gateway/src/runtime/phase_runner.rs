//! The real [`PhaseRunner`]: wires workflow phases to the sandbox
//! manager, the LLM client, and the object store.
//!
//! One runner is built per session so LLM phases can use the caller's
//! API key. The engine owns retries and timeouts around each call.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use serde_json::Value;

use ed_domain::config::Config;
use ed_domain::error::{Error, PipelineFinding, Result};
use ed_domain::workflow::{Workflow, WorkflowStep};
use ed_providers::{LlmClient, LlmMessage, StreamOpts};
use ed_sandbox::SandboxManager;
use ed_storage::ObjectStore;
use ed_workflow::{default_plan, PhaseRunner};

pub struct GatewayPhaseRunner {
    sandboxes: SandboxManager,
    llm: Arc<dyn LlmClient>,
    objects: Arc<dyn ObjectStore>,
    config: Arc<Config>,
    api_key: String,
}

impl GatewayPhaseRunner {
    pub fn new(
        sandboxes: SandboxManager,
        llm: Arc<dyn LlmClient>,
        objects: Arc<dyn ObjectStore>,
        config: Arc<Config>,
        api_key: String,
    ) -> Self {
        Self {
            sandboxes,
            llm,
            objects,
            config,
            api_key,
        }
    }

    fn sandbox_id<'a>(&self, workflow: &'a Workflow) -> Result<&'a str> {
        workflow
            .sandbox_id
            .as_deref()
            .ok_or_else(|| Error::Sandbox("workflow has no sandbox attached".into()))
    }

    async fn generate_json(&self, system: &str, user: &str) -> Result<Value> {
        let messages = [LlmMessage::system(system), LlmMessage::user(user)];
        let opts = StreamOpts {
            json_mode: true,
            temperature: Some(0.0),
            ..Default::default()
        };
        let raw = self.llm.generate(&self.api_key, &messages, &opts).await?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Validation(format!("model returned invalid JSON: {e}")))
    }

    // ── Phases ───────────────────────────────────────────────────────

    fn run_plan(&self, workflow: &mut Workflow) -> Result<Option<Value>> {
        if workflow.context.plan.is_none() {
            workflow.context.plan = Some(default_plan());
        }
        Ok(None)
    }

    async fn run_analyze(&self, workflow: &mut Workflow) -> Result<Option<Value>> {
        if workflow.context.framework.is_some() {
            return Ok(None);
        }
        let intent = workflow
            .context
            .intent
            .clone()
            .unwrap_or_else(|| "build a small web app".into());
        let parsed = self
            .generate_json(
                "Classify a web-app request. Respond with JSON: \
                 {\"framework\": \"next\"|\"vite\", \"intent\": \"<one sentence>\"}",
                &intent,
            )
            .await?;
        let framework = parsed
            .get("framework")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("analysis result has no framework".into()))?;
        workflow.context.framework = Some(framework.to_string());
        if let Some(summary) = parsed.get("intent").and_then(Value::as_str) {
            workflow.context.intent = Some(summary.to_string());
        }
        Ok(Some(parsed))
    }

    fn run_resolve(&self, workflow: &mut Workflow, input: Option<&Value>) -> Result<Option<Value>> {
        let mut requested: Vec<String> = input
            .and_then(|v| v.get("packages"))
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_else(|| workflow.context.resolved_packages.clone());

        requested.sort();
        requested.dedup();

        let invalid: Vec<&String> = requested
            .iter()
            .filter(|name| !valid_package_name(name))
            .collect();
        if !invalid.is_empty() {
            return Err(Error::Validation(format!(
                "invalid package names: {}",
                invalid
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        workflow.context.resolved_packages = requested.clone();
        Ok(Some(serde_json::json!({ "resolved": requested })))
    }

    async fn run_install(&self, workflow: &mut Workflow) -> Result<Option<Value>> {
        if workflow.context.resolved_packages.is_empty() {
            return Ok(None);
        }
        // Install blocks arrive before the sandbox tag; provision here so
        // the later sandbox block reuses the same instance.
        if workflow.sandbox_id.is_none() {
            let sandbox_id = self
                .sandboxes
                .ensure(
                    &workflow.user_id,
                    &workflow.chat_id,
                    workflow.context.framework.as_deref(),
                )
                .await?;
            workflow.sandbox_id = Some(sandbox_id);
        }
        let sandbox_id = self.sandbox_id(workflow)?.to_string();
        let packages = workflow.context.resolved_packages.join(" ");
        let timeout = Duration::from_secs(self.config.sandbox.install_timeout_secs);

        // Network comes up only for the install itself.
        self.sandboxes.set_network(&sandbox_id, true).await?;
        let result = self
            .sandboxes
            .exec(
                &sandbox_id,
                &format!("npm install --no-audit --no-fund {packages}"),
                None,
                timeout,
            )
            .await;
        if let Err(e) = self.sandboxes.set_network(&sandbox_id, false).await {
            tracing::warn!(error = %e, "failed to drop sandbox network after install");
        }

        let out = result?;
        if !out.success() {
            return Err(Error::Sandbox(format!(
                "npm install failed: {}",
                tail(&out.stderr, 2000)
            )));
        }
        Ok(Some(serde_json::json!({ "installed": workflow.context.resolved_packages })))
    }

    async fn run_generate(&self, workflow: &mut Workflow) -> Result<Option<Value>> {
        let sandbox_id = self.sandbox_id(workflow)?;
        let out = self
            .sandboxes
            .exec(
                sandbox_id,
                "find . -type f -not -path './node_modules/*' | wc -l",
                None,
                Duration::from_secs(self.config.sandbox.exec_timeout_secs),
            )
            .await?;
        let files: u64 = out.stdout.trim().parse().unwrap_or(0);
        if files == 0 {
            return Err(Error::ValidationPipeline {
                stage: "generate".into(),
                errors: vec![PipelineFinding {
                    message: "no files were written to the workspace".into(),
                    file: None,
                    line: None,
                }],
                retry_prompt: "The sandbox is empty. Re-emit the project files inside an \
                               <edward_sandbox> block."
                    .into(),
            });
        }
        Ok(Some(serde_json::json!({ "files": files })))
    }

    async fn run_build(&self, workflow: &mut Workflow) -> Result<Option<Value>> {
        let sandbox_id = self.sandbox_id(workflow)?.to_string();
        let quick = Duration::from_secs(self.config.sandbox.exec_timeout_secs);

        let has_build = self
            .sandboxes
            .exec(
                &sandbox_id,
                "[ -f package.json ] && grep -q '\"build\"' package.json && echo yes || echo no",
                None,
                quick,
            )
            .await?;
        if has_build.stdout.trim() != "yes" {
            return Ok(Some(serde_json::json!({ "status": "skipped" })));
        }

        let out = self
            .sandboxes
            .exec(
                &sandbox_id,
                "npm run build",
                None,
                Duration::from_secs(self.config.sandbox.build_timeout_secs),
            )
            .await?;
        if !out.success() {
            let findings = parse_build_errors(&out.stderr);
            let summary = findings
                .first()
                .map(|f| f.message.clone())
                .unwrap_or_else(|| tail(&out.stderr, 400));
            return Err(Error::ValidationPipeline {
                stage: "build".into(),
                errors: findings,
                retry_prompt: format!(
                    "The build failed: {summary}. Rewrite the affected files completely."
                ),
            });
        }

        // Record the build output directory when one appeared.
        for dir in [".next", "dist", "build"] {
            let check = self
                .sandboxes
                .exec(&sandbox_id, &format!("[ -d {dir} ] && echo yes || echo no"), None, quick)
                .await?;
            if check.stdout.trim() == "yes" {
                workflow.context.build_directory = Some(dir.to_string());
                break;
            }
        }
        Ok(Some(serde_json::json!({ "status": "passed" })))
    }

    async fn run_deploy(&self, workflow: &mut Workflow) -> Result<Option<Value>> {
        let sandbox_id = self.sandbox_id(workflow)?.to_string();
        self.sandboxes.backup(&sandbox_id).await?;

        let preview_url = format!(
            "{}/{}/{}",
            self.config.storage.preview_base_url.trim_end_matches('/'),
            workflow.user_id,
            workflow.chat_id
        );
        let manifest = serde_json::json!({
            "preview_url": preview_url,
            "build_directory": workflow.context.build_directory,
            "deployed_at": chrono::Utc::now().to_rfc3339(),
        });
        self.objects
            .put(
                &format!("{}/{}/preview/manifest.json", workflow.user_id, workflow.chat_id),
                serde_json::to_vec(&manifest)?,
            )
            .await?;

        workflow.context.preview_url = Some(preview_url.clone());
        Ok(Some(serde_json::json!({ "preview_url": preview_url })))
    }

    async fn run_recover(&self, workflow: &mut Workflow) -> Result<Option<Value>> {
        // The failing step's data carries the pipeline findings.
        let last_failure = workflow
            .history
            .iter()
            .rev()
            .find(|r| !r.success)
            .and_then(|r| r.data.clone())
            .unwrap_or(Value::Null);

        let parsed = self
            .generate_json(
                "A web-app build pipeline failed. Propose a correction as JSON: \
                 {\"packages\": [\"<replacement package list>\"], \
                 \"advice\": \"<one instruction for the generator>\"}. \
                 Keep the package list empty to leave dependencies unchanged.",
                &serde_json::json!({
                    "failure": last_failure,
                    "packages": workflow.context.resolved_packages,
                    "errors": workflow.context.errors,
                })
                .to_string(),
            )
            .await?;

        if let Some(packages) = parsed.get("packages").and_then(Value::as_array) {
            let proposed: Vec<String> = packages
                .iter()
                .filter_map(Value::as_str)
                .filter(|p| valid_package_name(p))
                .map(str::to_owned)
                .collect();
            if !proposed.is_empty() {
                workflow.context.resolved_packages = proposed;
            }
        }
        if let Some(advice) = parsed.get("advice").and_then(Value::as_str) {
            workflow.context.errors.push(format!("recovery: {advice}"));
        }

        // Give the redone phases a clean slate on the plan.
        if let Some(plan) = workflow.context.plan.as_mut() {
            for step in plan.steps.iter_mut() {
                if step.status == ed_domain::workflow::PlanStepStatus::Failed {
                    step.status = ed_domain::workflow::PlanStepStatus::Pending;
                }
            }
        }
        Ok(Some(parsed))
    }
}

#[async_trait::async_trait]
impl PhaseRunner for GatewayPhaseRunner {
    async fn run_phase(
        &self,
        step: WorkflowStep,
        workflow: &mut Workflow,
        input: Option<&Value>,
    ) -> Result<Option<Value>> {
        match step {
            WorkflowStep::Plan => self.run_plan(workflow),
            WorkflowStep::Analyze => self.run_analyze(workflow).await,
            WorkflowStep::ResolvePackages => self.run_resolve(workflow, input),
            WorkflowStep::InstallPackages => self.run_install(workflow).await,
            WorkflowStep::Generate => self.run_generate(workflow).await,
            WorkflowStep::Build => self.run_build(workflow).await,
            WorkflowStep::Deploy => self.run_deploy(workflow).await,
            WorkflowStep::Recover => self.run_recover(workflow).await,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// npm package name shape, optionally scoped, optionally versioned.
fn valid_package_name(name: &str) -> bool {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(
            r"^(@[a-z0-9][a-z0-9._-]*/)?[a-z0-9][a-z0-9._-]*(@[0-9a-zA-Z.^~<>=*-]+)?$",
        )
        .expect("static regex")
    });
    name.len() <= 214 && re.is_match(name)
}

/// Pull `file(line,col): error ...`-shaped findings out of build output.
fn parse_build_errors(stderr: &str) -> Vec<PipelineFinding> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"(?m)^(?P<file>[\w./-]+)[:(](?P<line>\d+)[,:)].*?(?P<msg>(error|Error)\s.*)$")
            .expect("static regex")
    });
    let mut findings: Vec<PipelineFinding> = re
        .captures_iter(stderr)
        .take(20)
        .map(|c| PipelineFinding {
            message: c["msg"].trim().to_string(),
            file: Some(c["file"].to_string()),
            line: c["line"].parse().ok(),
        })
        .collect();
    if findings.is_empty() {
        // Fall back to bare `error ...` lines.
        findings = stderr
            .lines()
            .filter(|l| l.to_ascii_lowercase().contains("error"))
            .take(10)
            .map(|l| PipelineFinding {
                message: l.trim().to_string(),
                file: None,
                line: None,
            })
            .collect();
    }
    findings
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.trim().to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_name_validation() {
        for ok in [
            "clsx",
            "lucide-react",
            "tailwind-merge",
            "class-variance-authority",
            "@radix-ui/react-slot",
            "zod@3.23.8",
        ] {
            assert!(valid_package_name(ok), "{ok} should be valid");
        }
        for bad in [
            "../evil",
            "UPPER",
            "name with spaces",
            "",
            "@/react-slot",
            "rm -rf /",
            "pkg;curl",
        ] {
            assert!(!valid_package_name(bad), "{bad} should be invalid");
        }
    }

    #[test]
    fn build_error_parsing_extracts_locations() {
        let stderr = "\
src/app/page.tsx(12,5): error TS2304: Cannot find name 'Button'.\n\
src/lib/util.ts(3,1): error TS1005: ';' expected.\n";
        let findings = parse_build_errors(stderr);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].file.as_deref(), Some("src/app/page.tsx"));
        assert_eq!(findings[0].line, Some(12));
        assert!(findings[0].message.contains("TS2304"));
    }

    #[test]
    fn build_error_parsing_falls_back_to_error_lines() {
        let findings = parse_build_errors("Error: Command failed with exit code 1\n");
        assert_eq!(findings.len(), 1);
        assert!(findings[0].file.is_none());
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let text = format!("{}é", "x".repeat(10));
        let t = tail(&text, 3);
        assert!(t.ends_with('é'));
    }
}
