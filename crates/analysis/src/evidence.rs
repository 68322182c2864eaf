use std::{fmt, sync::OnceLock};

use bug_agent_core::models::{ChangedFile, Comment, EvidenceBundle};
use regex::Regex;

/// Extracts likely log output from free text: the trimmed contents of every fenced code
/// block, followed by every line mentioning an error, exception or trace.
pub fn extract_logs_from_text(text: &str) -> Vec<String> {
    if text.is_empty() {
        return vec![];
    }
    static CODE_BLOCK: OnceLock<Regex> = OnceLock::new();
    let code_block = CODE_BLOCK.get_or_init(|| Regex::new(r"(?s)```(.*?)```").unwrap());
    static KEYWORD: OnceLock<Regex> = OnceLock::new();
    let keyword = KEYWORD.get_or_init(|| Regex::new(r"(?i)error|exception|trace").unwrap());

    let mut logs = code_block
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect::<Vec<_>>();
    logs.extend(text.split('\n').filter(|line| keyword.is_match(line)).map(str::to_string));
    logs
}

/// Renders changed files as `File: {filename}\n{patch}` blocks separated by blank lines.
pub fn assemble_diffs_text(files: &[ChangedFile]) -> String {
    files
        .iter()
        .map(|f| format!("File: {}\n{}", f.filename, f.patch.as_deref().unwrap_or_default()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renders comments as `{author}: {body}` separated by blank lines.
pub fn assemble_comments_text(comments: &[Comment]) -> String {
    comments
        .iter()
        .map(|c| {
            format!(
                "{}: {}",
                c.author.as_deref().unwrap_or("[unknown]"),
                c.body.as_deref().unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The lines a review comment is attached to. Line numbers are 1-based.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LineMarker {
    Single(u64),
    /// Inclusive on both ends.
    Range { start: u64, end: u64 },
}

impl LineMarker {
    /// Builds a marker from a review comment's `start_line` and `line` fields.
    pub fn from_review(start_line: Option<u64>, line: Option<u64>) -> Option<Self> {
        match (start_line, line) {
            (Some(start), Some(end)) if start < end => Some(Self::Range { start, end }),
            (_, Some(line)) => Some(Self::Single(line)),
            (_, None) => None,
        }
    }
}

impl fmt::Display for LineMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(line) => write!(f, "L{line}"),
            Self::Range { start, end } => write!(f, "L{start}-L{end}"),
        }
    }
}

/// Returns the commented line, or the inclusive range joined with newlines.
/// Lines past the end of the file are omitted.
pub fn slice_commented_lines(content: &str, marker: Option<LineMarker>) -> String {
    let (start, end) = match marker {
        Some(LineMarker::Single(line)) => (line, line),
        Some(LineMarker::Range { start, end }) => (start, end),
        None => return String::new(),
    };
    if start == 0 || end < start {
        return String::new();
    }
    content
        .lines()
        .skip((start - 1) as usize)
        .take((end - start + 1) as usize)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Evidence for a newly opened pull request: diffs, conversation, and logs found in the
/// description and comments.
pub fn pull_request_evidence(
    body: Option<&str>,
    files: &[ChangedFile],
    comments: &[Comment],
) -> EvidenceBundle {
    let mut logs = extract_logs_from_text(body.unwrap_or_default());
    for comment in comments {
        logs.extend(extract_logs_from_text(comment.body.as_deref().unwrap_or_default()));
    }
    EvidenceBundle {
        logs: logs.join("\n"),
        diffs: assemble_diffs_text(files),
        code: String::new(),
        comments: assemble_comments_text(comments),
        commented_lines: String::new(),
    }
}
