use anyhow::Context;
use axum::{Json, extract::State};
use bug_agent_analysis::evidence::extract_logs_from_text;
use bug_agent_core::{
    AppError, AppJson,
    models::{EvidenceBundle, RepoRef},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CollectorRequest {
    owner: String,
    repo: String,
    action: String,
    pull_number: Option<u64>,
    issue_number: Option<u64>,
}

pub async fn collector(
    State(state): State<AppState>,
    AppJson(request): AppJson<CollectorRequest>,
) -> Result<Json<Value>, AppError> {
    if request.owner.is_empty() || request.repo.is_empty() {
        return Err(AppError::bad_request("Invalid action or missing parameters"));
    }
    let client = state.github.default_client();
    let repo = RepoRef::new(request.owner, request.repo);
    tracing::info!("Collector action {} on {}", request.action, repo);
    let response = match (request.action.as_str(), request.pull_number, request.issue_number) {
        ("list_prs", _, _) => json!({ "prs": client.list_pull_requests(&repo).await? }),
        ("pr_details", Some(number), _) => {
            let (summary, files, comments) = tokio::try_join!(
                client.get_pull_request(&repo, number),
                client.list_pull_request_files(&repo, number),
                client.list_issue_comments(&repo, number)
            )
            .with_context(|| format!("Failed to fetch pull request {repo}#{number}"))?;
            let mut logs = extract_logs_from_text(summary.body.as_deref().unwrap_or_default());
            for comment in &comments {
                logs.extend(extract_logs_from_text(comment.body.as_deref().unwrap_or_default()));
            }
            json!({
                "details": {
                    "summary": summary,
                    "diffs": files,
                    "logs": logs,
                    "comments": comments,
                }
            })
        }
        ("list_issues", _, _) => json!({ "issues": client.list_issues(&repo).await? }),
        ("issue_details", _, Some(number)) => {
            json!({ "issue": client.get_issue(&repo, number).await? })
        }
        ("issue_comments", _, Some(number)) => {
            json!({ "comments": client.list_issue_comments(&repo, number).await? })
        }
        _ => return Err(AppError::bad_request("Invalid action or missing parameters")),
    };
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AnalyzerRequest {
    logs: Option<String>,
    diffs: Option<String>,
    code: Option<String>,
    comments: Option<String>,
}

pub async fn analyzer(
    State(state): State<AppState>,
    AppJson(request): AppJson<AnalyzerRequest>,
) -> Result<Json<Value>, AppError> {
    let evidence = EvidenceBundle {
        logs: request.logs.unwrap_or_default(),
        diffs: request.diffs.unwrap_or_default(),
        code: request.code.unwrap_or_default(),
        comments: request.comments.unwrap_or_default(),
        commented_lines: String::new(),
    };
    if !evidence.has_signal() {
        return Err(AppError::bad_request(
            "At least one of logs, diffs, code or comments must be provided",
        ));
    }
    let report = state.jobs.analyzer.analyze(&evidence).await?;
    Ok(Json(json!({ "analysis": report.to_plain_text() })))
}

#[derive(Debug, Deserialize)]
pub struct PipelineRequest {
    owner: String,
    repo: String,
}

/// Analyzes the description of the most recent open pull request.
pub async fn pipeline(
    State(state): State<AppState>,
    AppJson(request): AppJson<PipelineRequest>,
) -> Result<Json<Value>, AppError> {
    let repo = RepoRef::new(request.owner, request.repo);
    let prs = state.github.default_client().list_pull_requests(&repo).await?;
    let Some(latest) = prs.into_iter().next() else {
        return Err(AppError::not_found(format!("No open pull requests in {repo}")));
    };
    tracing::info!("Pipeline analyzing {}#{}", repo, latest.number);
    let evidence = EvidenceBundle { logs: latest.body.unwrap_or_default(), ..Default::default() };
    if !evidence.has_signal() {
        return Err(AppError::bad_request(format!(
            "Pull request {}#{} has no description",
            repo, latest.number
        )));
    }
    let report = state.jobs.analyzer.analyze(&evidence).await?;
    Ok(Json(json!({ "analysis": report.to_plain_text() })))
}
