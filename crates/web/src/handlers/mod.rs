use axum::{Router, routing::post};

use crate::AppState;

mod agents;
#[cfg(test)]
mod tests;
mod webhook;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/webhook", post(webhook::webhook))
        .route("/agents/collector", post(agents::collector))
        .route("/agents/analyzer", post(agents::analyzer))
        .route("/agents/pipeline", post(agents::pipeline))
}
