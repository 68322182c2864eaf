use std::{fmt, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::{
    evidence::extract_logs_from_text,
    llm::ChatModel,
    sandbox::{ReproScripts, SandboxOutput, SandboxRunner},
};

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ReproIssue {
    pub title: String,
    pub body: String,
    pub comments: Vec<String>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct ParsedIssue {
    pub logs: Vec<String>,
    pub repro_steps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WorkflowStep {
    ParseIssue,
    GenerateScripts,
    RunContainer,
    GenerateReport,
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ParseIssue => "parse_issue",
            Self::GenerateScripts => "generate_scripts",
            Self::RunContainer => "run_container",
            Self::GenerateReport => "generate_report",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Reproduction workflow failed at {step}")]
pub struct WorkflowFailed {
    pub step: WorkflowStep,
    #[source]
    pub source: anyhow::Error,
}

trait StepContext<T> {
    fn step(self, step: WorkflowStep) -> Result<T, WorkflowFailed>;
}

impl<T> StepContext<T> for Result<T> {
    fn step(self, step: WorkflowStep) -> Result<T, WorkflowFailed> {
        self.map_err(|source| WorkflowFailed { step, source })
    }
}

/// Reproduces a reported bug and returns a report for the issue thread.
#[async_trait]
pub trait ReproWorkflow: Send + Sync {
    async fn run(&self, issue: &ReproIssue) -> Result<String, WorkflowFailed>;
}

/// The four-step reproduction workflow, driven by a chat model and a sandbox.
pub struct AgentReproWorkflow {
    chat: Arc<dyn ChatModel>,
    sandbox: Arc<dyn SandboxRunner>,
}

impl AgentReproWorkflow {
    pub fn new(chat: Arc<dyn ChatModel>, sandbox: Arc<dyn SandboxRunner>) -> Self {
        Self { chat, sandbox }
    }

    async fn ask(&self, prompt: &str) -> Result<String> {
        let parts = self.chat.complete(None, prompt).await?;
        Ok(parts.join("\n"))
    }

    async fn parse_issue(&self, issue: &ReproIssue) -> Result<ParsedIssue> {
        let prompt = format!(
            "You are an expert at analyzing bug reports and extracting key information.\n\
             Given the following issue details, extract:\n\
             1. Relevant logs\n\
             2. Reproduction steps\n\
             3. Stack trace (if present)\n\n\
             Issue Title: {}\nIssue Body: {}\nComments: {}\n\n\
             Return the information in this format:\n\
             LOGS:\n<extracted logs>\n\n\
             REPRODUCTION STEPS:\n<numbered steps>\n\n\
             STACK TRACE:\n<stack trace if present>\n",
            issue.title,
            issue.body,
            issue.comments.join("\n")
        );
        Ok(parse_issue_reply(&self.ask(&prompt).await?))
    }

    async fn generate_scripts(&self, parsed: &ParsedIssue) -> Result<ReproScripts> {
        let prompt = format!(
            "You are an expert at creating reproduction scripts and Dockerfiles.\n\
             Given the following parsed issue details, create:\n\
             1. A shell script (repro.sh) to reproduce the issue\n\
             2. A Dockerfile to set up the environment\n\n\
             Parsed Issue:\n{}\n\n\
             Return the files in this format:\n\
             REPRO_SCRIPT:\n```bash\n<shell script content>\n```\n\n\
             DOCKERFILE:\n```dockerfile\n<Dockerfile content>\n```\n",
            serde_json::to_string(parsed)?
        );
        parse_scripts_reply(&self.ask(&prompt).await?)
    }

    async fn generate_report(
        &self,
        issue: &ReproIssue,
        results: &SandboxOutput,
    ) -> Result<String> {
        let prompt = format!(
            "You are an expert at analyzing test results and creating clear reports.\n\
             Given the following test results, create a comprehensive report:\n\n\
             Test Results:\n{}\n\n\
             Issue Report:\n{}\n\n\
             Return a well-formatted report that includes:\n\
             1. Summary of findings\n\
             2. Confirmation of reproduction\n\
             3. Additional insights\n\
             4. Recommendations\n",
            serde_json::to_string(results)?,
            serde_json::to_string(issue)?
        );
        self.ask(&prompt).await
    }
}

#[async_trait]
impl ReproWorkflow for AgentReproWorkflow {
    async fn run(&self, issue: &ReproIssue) -> Result<String, WorkflowFailed> {
        tracing::info!("Reproducing issue \"{}\"", issue.title);
        let parsed = self.parse_issue(issue).await.step(WorkflowStep::ParseIssue)?;
        tracing::debug!("Parsed issue: {} repro steps", parsed.repro_steps.len());
        let scripts = self.generate_scripts(&parsed).await.step(WorkflowStep::GenerateScripts)?;
        let results = self.sandbox.run(&scripts).await.step(WorkflowStep::RunContainer)?;
        tracing::info!("Sandbox run finished with exit code {:?}", results.exit_code);
        self.generate_report(issue, &results).await.step(WorkflowStep::GenerateReport)
    }
}

/// Text after `start`, up to `end` if present.
fn section<'a>(content: &'a str, start: &str, end: Option<&str>) -> Option<&'a str> {
    let (_, rest) = content.split_once(start)?;
    let rest = match end.and_then(|end| rest.split_once(end)) {
        Some((body, _)) => body,
        None => rest,
    };
    Some(rest.trim())
}

/// Strips a surrounding Markdown code fence, including its info string.
fn unfence(text: &str) -> &str {
    let text = text.trim();
    let Some(inner) = text.strip_prefix("```") else {
        return text;
    };
    let inner = match inner.split_once('\n') {
        Some((_, rest)) => rest,
        None => inner,
    };
    match inner.rfind("```") {
        Some(end) => inner[..end].trim(),
        None => inner.trim(),
    }
}

/// Reads the LOGS / REPRODUCTION STEPS / STACK TRACE reply of the parse step.
pub fn parse_issue_reply(content: &str) -> ParsedIssue {
    let repro_steps = section(content, "REPRODUCTION STEPS:", Some("STACK TRACE:"))
        .map(|steps| {
            steps.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect()
        })
        .unwrap_or_default();
    let stack_trace = section(content, "STACK TRACE:", None)
        .filter(|trace| !trace.is_empty())
        .map(str::to_string);
    ParsedIssue { logs: extract_logs_from_text(content), repro_steps, stack_trace }
}

/// Reads the REPRO_SCRIPT / DOCKERFILE reply of the script generation step.
pub fn parse_scripts_reply(content: &str) -> Result<ReproScripts> {
    let repro_script = section(content, "REPRO_SCRIPT:", Some("DOCKERFILE:"))
        .map(unfence)
        .filter(|s| !s.is_empty())
        .context("Reply has no REPRO_SCRIPT section")?;
    let dockerfile = section(content, "DOCKERFILE:", None)
        .map(unfence)
        .filter(|s| !s.is_empty())
        .context("Reply has no DOCKERFILE section")?;
    Ok(ReproScripts { repro_script: repro_script.to_string(), dockerfile: dockerfile.to_string() })
}
