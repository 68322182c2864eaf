use std::{future::Future, sync::Arc};

use bug_agent_analysis::repro::WorkflowFailed;
use bug_agent_core::config::DispatchMode;
use bug_agent_github::{
    GitHubClient,
    events::{Event, EventKind},
};

use crate::{
    JobContext,
    jobs::{issue, pull_request, review_comment},
    queue::{Job, JobQueue},
};

#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("Failed to gather evidence")]
    Gather(#[source] anyhow::Error),
    #[error("Failed to analyze evidence")]
    Analyze(#[source] anyhow::Error),
    #[error("Failed to post analysis comment")]
    Post(#[source] anyhow::Error),
    #[error(transparent)]
    Workflow(#[from] WorkflowFailed),
}

/// What the webhook caller is told.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// Pull request analysis, returned inline in synchronous mode.
    Analysis(String),
    /// Work was done or queued.
    Accepted,
    Ignored(&'static str),
}

/// Routes a verified event to its job. In deferred mode the job is queued and the call returns
/// immediately; in synchronous mode it runs to completion first.
pub async fn dispatch(
    ctx: &Arc<JobContext>,
    queue: &JobQueue,
    client: Arc<dyn GitHubClient>,
    event: Event,
) -> Result<DispatchOutcome, TriageError> {
    let Event { name, action, repository, kind, .. } = &event;
    if matches!(kind, EventKind::Other) {
        tracing::debug!("Ignoring {} event (action {:?})", name, action);
        return Ok(DispatchOutcome::Ignored("Event ignored"));
    }
    if event.is_from_bot(&ctx.bot_login) {
        tracing::info!("Ignoring {} event from {}", name, ctx.bot_login);
        return Ok(DispatchOutcome::Ignored("Bot comment ignored"));
    }
    let Some(repo) = repository.clone() else {
        return Ok(DispatchOutcome::Ignored("Event ignored"));
    };

    match event.kind {
        EventKind::PullRequestOpened(pr) => match ctx.mode {
            DispatchMode::Synchronous => {
                let analysis =
                    pull_request::analyze_pull_request(ctx, client.as_ref(), &repo, &pr).await?;
                Ok(DispatchOutcome::Analysis(analysis))
            }
            DispatchMode::Deferred => {
                let name = format!("analyze pull request {}#{}", repo, pr.number);
                run_or_defer(ctx, queue, name, move |ctx| async move {
                    pull_request::comment_on_pull_request(&ctx, client.as_ref(), &repo, &pr).await
                })
                .await
            }
        },
        EventKind::IssueOpened(issue) => {
            let name = format!("reproduce issue {}#{}", repo, issue.number);
            run_or_defer(ctx, queue, name, move |ctx| async move {
                issue::reproduce_issue(&ctx, client.as_ref(), &repo, &issue).await
            })
            .await
        }
        EventKind::ReviewCommentCreated(created) => {
            let name = format!("reply to review comment {} on {}", created.comment.id, repo);
            run_or_defer(ctx, queue, name, move |ctx| async move {
                review_comment::reply_to_review_comment(&ctx, client.as_ref(), &repo, &created)
                    .await
            })
            .await
        }
        EventKind::Other => Ok(DispatchOutcome::Ignored("Event ignored")),
    }
}

async fn run_or_defer<F, Fut>(
    ctx: &Arc<JobContext>,
    queue: &JobQueue,
    name: String,
    work: F,
) -> Result<DispatchOutcome, TriageError>
where
    F: FnOnce(Arc<JobContext>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TriageError>> + Send + 'static,
{
    match ctx.mode {
        DispatchMode::Synchronous => {
            work(ctx.clone()).await?;
        }
        DispatchMode::Deferred => {
            let ctx = ctx.clone();
            let id = queue.enqueue(Job::new(name.clone(), move || async move {
                work(ctx).await?;
                Ok(())
            }));
            tracing::info!("Queued job {} ({})", id, name);
        }
    }
    Ok(DispatchOutcome::Accepted)
}
