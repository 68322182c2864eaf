use bug_agent_analysis::{evidence::assemble_comments_text, repro::ReproIssue};
use bug_agent_core::models::RepoRef;
use bug_agent_github::{GitHubClient, events::IssueOpened};

use crate::{JobContext, TriageError};

/// Runs the reproduction workflow for a newly opened issue and posts the report on it.
pub async fn reproduce_issue(
    ctx: &JobContext,
    client: &dyn GitHubClient,
    repo: &RepoRef,
    issue: &IssueOpened,
) -> Result<(), TriageError> {
    tracing::info!("Reproducing issue {}#{}", repo, issue.number);
    let comments =
        client.list_issue_comments(repo, issue.number).await.map_err(TriageError::Gather)?;
    let repro_issue = ReproIssue {
        title: issue.title.clone(),
        body: issue.body.clone().unwrap_or_default(),
        // The discussion is passed as a single block.
        comments: if comments.is_empty() {
            vec![]
        } else {
            vec![assemble_comments_text(&comments)]
        },
    };
    let report = ctx.repro.run(&repro_issue).await?;
    client.create_issue_comment(repo, issue.number, &report).await.map_err(TriageError::Post)?;
    tracing::info!("Posted reproduction report on {}#{}", repo, issue.number);
    Ok(())
}
