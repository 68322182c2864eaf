mod dispatch;
mod jobs;
pub mod queue;

use std::sync::Arc;

use bug_agent_analysis::{analyzer::RootCauseAnalyzer, repro::ReproWorkflow};
use bug_agent_core::config::{Config, DispatchMode};
pub use dispatch::{DispatchOutcome, TriageError, dispatch};
pub use queue::{Job, JobOutcome, JobQueue, JobResult};

/// Shared context available to all job handlers.
pub struct JobContext {
    pub analyzer: Arc<dyn RootCauseAnalyzer>,
    pub repro: Arc<dyn ReproWorkflow>,
    /// Events from this login are never acted upon.
    pub bot_login: String,
    pub mode: DispatchMode,
}

impl JobContext {
    pub fn new(
        config: &Config,
        analyzer: Arc<dyn RootCauseAnalyzer>,
        repro: Arc<dyn ReproWorkflow>,
    ) -> Self {
        Self {
            analyzer,
            repro,
            bot_login: config.github.bot_login.clone(),
            mode: config.worker.mode,
        }
    }
}
