use std::borrow::Cow;

use anyhow::Context;
use axum::{Json, extract::State, http::StatusCode};
use bug_agent_core::AppError;
use bug_agent_github::webhook::GitHubEvent;
use bug_agent_jobs::{DispatchOutcome, TriageError, dispatch};
use serde_json::{Value, json};

use crate::AppState;

/// Verifies, classifies and dispatches a GitHub webhook delivery.
pub async fn webhook(
    State(state): State<AppState>,
    GitHubEvent { event }: GitHubEvent,
) -> Result<Json<Value>, AppError> {
    let action = event.action.as_deref().unwrap_or("[none]");
    if let Some(repository) = &event.repository {
        tracing::info!(
            "Received webhook event {} ({}) from repository {}",
            event.name,
            action,
            repository
        );
    } else if let Some(sender) = &event.sender {
        tracing::info!("Received webhook event {} ({}) from @{}", event.name, action, sender.login);
    } else {
        tracing::info!("Received webhook event {} ({}) from unknown source", event.name, action);
    }

    let client = state
        .github
        .for_installation(event.installation_id)
        .await
        .context("Failed to get GitHub client")?;
    let outcome = dispatch(&state.jobs, &state.queue, client, event).await.map_err(|e| match e {
        TriageError::Post(_) => {
            tracing::error!("{:?}", anyhow::Error::from(e));
            AppError::Status(
                StatusCode::INTERNAL_SERVER_ERROR,
                Cow::Borrowed("Failed to post analysis comment"),
            )
        }
        e => AppError::Internal(e.into()),
    })?;
    Ok(Json(match outcome {
        DispatchOutcome::Analysis(analysis) => json!({ "analysis": analysis }),
        DispatchOutcome::Accepted => json!({ "ok": true }),
        DispatchOutcome::Ignored(message) => json!({ "message": message }),
    }))
}
