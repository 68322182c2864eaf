use bug_agent_analysis::evidence::{LineMarker, slice_commented_lines};
use bug_agent_core::models::{EvidenceBundle, RepoRef};
use bug_agent_github::{GitHubClient, ReviewReply, events::ReviewCommentCreated};

use crate::{JobContext, TriageError};

/// Analyzes the code a review comment points at and replies in the comment's thread.
pub async fn reply_to_review_comment(
    ctx: &JobContext,
    client: &dyn GitHubClient,
    repo: &RepoRef,
    created: &ReviewCommentCreated,
) -> Result<(), TriageError> {
    let comment = &created.comment;
    tracing::info!(
        "Analyzing review comment {} on {}#{} ({})",
        comment.id,
        repo,
        created.pull_number,
        comment.path
    );
    let marker = LineMarker::from_review(comment.start_line, comment.line);
    // Outdated comments have no line; there is nothing to slice.
    let (code, commented_lines) = match marker {
        Some(marker) => {
            let content = client
                .get_file_content(repo, &comment.path, &comment.commit_id)
                .await
                .map_err(TriageError::Gather)?;
            let code = slice_commented_lines(&content, Some(marker));
            (code, format!("{}:{}", comment.path, marker))
        }
        None => (String::new(), comment.path.clone()),
    };
    let evidence = EvidenceBundle {
        code,
        comments: comment.body.clone(),
        commented_lines,
        ..Default::default()
    };
    let analysis = ctx.analyzer.analyze(&evidence).await.map_err(TriageError::Analyze)?;
    let body = analysis.to_plain_text();
    let reply = ReviewReply {
        pull_number: created.pull_number,
        comment_id: comment.id,
        commit_id: &comment.commit_id,
        path: &comment.path,
        body: &body,
    };
    client.reply_to_review_comment(repo, &reply).await.map_err(TriageError::Post)?;
    tracing::info!("Replied to review comment {} on {}#{}", comment.id, repo, created.pull_number);
    Ok(())
}
