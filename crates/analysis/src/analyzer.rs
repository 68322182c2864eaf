use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use bug_agent_core::models::{AnalysisReport, ContentPart, EvidenceBundle};

use crate::llm::ChatModel;

const SYSTEM_PROMPT: &str = "You are an expert software engineer performing root cause analysis \
on a bug report. Using the logs, code changes, source code and discussion provided, identify the \
most likely root cause, point to the responsible code where possible, and suggest a fix. Be \
concise and use Markdown.";

/// Produces a root-cause report from an evidence bundle.
#[async_trait]
pub trait RootCauseAnalyzer: Send + Sync {
    async fn analyze(&self, evidence: &EvidenceBundle) -> Result<AnalysisReport>;
}

/// Root-cause analysis backed by a chat model.
pub struct LlmAnalyzer {
    chat: Arc<dyn ChatModel>,
}

impl LlmAnalyzer {
    pub fn new(chat: Arc<dyn ChatModel>) -> Self { Self { chat } }
}

/// Renders the non-empty evidence fields as titled sections.
pub fn render_evidence(evidence: &EvidenceBundle) -> String {
    [
        ("LOGS", &evidence.logs),
        ("DIFFS", &evidence.diffs),
        ("CODE", &evidence.code),
        ("COMMENTED LINES", &evidence.commented_lines),
        ("COMMENTS", &evidence.comments),
    ]
    .into_iter()
    .filter(|(_, text)| !text.trim().is_empty())
    .map(|(title, text)| format!("{title}:\n{}", text.trim_end()))
    .collect::<Vec<_>>()
    .join("\n\n")
}

#[async_trait]
impl RootCauseAnalyzer for LlmAnalyzer {
    async fn analyze(&self, evidence: &EvidenceBundle) -> Result<AnalysisReport> {
        if !evidence.has_signal() {
            bail!("No evidence to analyze");
        }
        let mut parts = self.chat.complete(Some(SYSTEM_PROMPT), &render_evidence(evidence)).await?;
        Ok(if parts.len() == 1 {
            AnalysisReport::PlainText(parts.remove(0))
        } else {
            AnalysisReport::StructuredParts(
                parts.into_iter().map(|text| ContentPart { text }).collect(),
            )
        })
    }
}
