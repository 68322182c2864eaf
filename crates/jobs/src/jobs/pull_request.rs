use bug_agent_analysis::evidence::pull_request_evidence;
use bug_agent_core::models::RepoRef;
use bug_agent_github::{GitHubClient, events::PullRequestOpened};

use crate::{JobContext, TriageError};

/// Gathers diffs and discussion for a newly opened pull request and returns the analysis text.
pub async fn analyze_pull_request(
    ctx: &JobContext,
    client: &dyn GitHubClient,
    repo: &RepoRef,
    pr: &PullRequestOpened,
) -> Result<String, TriageError> {
    tracing::info!("Analyzing pull request {}#{}", repo, pr.number);
    let (files, comments) = tokio::try_join!(
        client.list_pull_request_files(repo, pr.number),
        client.list_issue_comments(repo, pr.number)
    )
    .map_err(TriageError::Gather)?;
    tracing::debug!(
        "Gathered {} files and {} comments for {}#{}",
        files.len(),
        comments.len(),
        repo,
        pr.number
    );
    let evidence = pull_request_evidence(pr.body.as_deref(), &files, &comments);
    let report = ctx.analyzer.analyze(&evidence).await.map_err(TriageError::Analyze)?;
    Ok(report.to_plain_text())
}

/// Analyzes a pull request and posts the result as a comment on it.
pub async fn comment_on_pull_request(
    ctx: &JobContext,
    client: &dyn GitHubClient,
    repo: &RepoRef,
    pr: &PullRequestOpened,
) -> Result<(), TriageError> {
    let analysis = analyze_pull_request(ctx, client, repo, pr).await?;
    client.create_issue_comment(repo, pr.number, &analysis).await.map_err(TriageError::Post)?;
    tracing::info!("Posted analysis on {}#{}", repo, pr.number);
    Ok(())
}
