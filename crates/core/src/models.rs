use std::fmt;

use serde::{Deserialize, Serialize};

/// A repository identified by owner login and name.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self { owner: owner.into(), repo: repo.into() }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct PullRequestSummary {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub author: Option<String>,
    pub labels: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub state: String,
    pub url: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct IssueSummary {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub author: Option<String>,
    pub labels: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub state: String,
    pub url: String,
    /// Set when the issue is a pull request.
    pub is_pull_request: bool,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Comment {
    pub author: Option<String>,
    pub body: Option<String>,
    pub created_at: Option<String>,
}

/// A file touched by a pull request. `patch` is absent for binary or rename-only changes.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ChangedFile {
    pub filename: String,
    pub status: String,
    pub patch: Option<String>,
}

/// The artifacts handed to the root-cause analyzer. Every field may be empty.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EvidenceBundle {
    pub logs: String,
    pub diffs: String,
    pub code: String,
    pub comments: String,
    pub commented_lines: String,
}

impl EvidenceBundle {
    /// Whether any of logs, diffs, code or comments carries text.
    pub fn has_signal(&self) -> bool {
        [&self.logs, &self.diffs, &self.code, &self.comments].iter().any(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(default)]
    pub text: String,
}

/// Result of a root-cause analysis: either plain text or a list of content parts.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnalysisReport {
    PlainText(String),
    StructuredParts(Vec<ContentPart>),
}

impl AnalysisReport {
    /// Normalizes the report to the text posted to GitHub.
    pub fn to_plain_text(&self) -> String {
        match self {
            Self::PlainText(text) => text.clone(),
            Self::StructuredParts(parts) => parts
                .iter()
                .map(|p| p.text.as_str())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}
