use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub github: GitHubConfig,
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl Config {
    /// HTTP request deadline. Synchronous dispatch runs jobs inside the request, so the deadline
    /// is raised to the job timeout when that is longer.
    pub fn request_timeout(&self) -> Duration {
        let timeout = Duration::from_secs(self.server.request_timeout_secs);
        match (self.worker.mode, self.worker.job_timeout()) {
            (DispatchMode::Synchronous, Some(job_timeout)) => timeout.max(job_timeout),
            _ => timeout,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 { 120 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    pub token: Option<String>,
    pub webhook_secret: String,
    /// Login of the account this service posts as. Events authored by it are never acted upon.
    #[serde(default = "default_bot_login")]
    pub bot_login: String,
    pub app: Option<GitHubAppConfig>,
}

fn default_bot_login() -> String { "bug-agent[bot]".to_string() }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubAppConfig {
    pub id: u64,
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub api_base: Option<String>,
    /// Model used for root-cause analysis.
    #[serde(default = "default_model")]
    pub model: String,
    /// Model used by the reproduction workflow steps.
    #[serde(default = "default_workflow_model")]
    pub workflow_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_model() -> String { "gpt-4o".to_string() }

fn default_workflow_model() -> String { "gpt-4-turbo-preview".to_string() }

fn default_max_tokens() -> u32 { 500 }

/// How recognized webhook events are executed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Enqueue the work and acknowledge the webhook immediately.
    #[default]
    Deferred,
    /// Run the work inline and respond once it has finished.
    Synchronous,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub mode: DispatchMode,
    pub job_timeout_secs: Option<u64>,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_shutdown_timeout_secs() -> u64 { 30 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            job_timeout_secs: None,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.filter(|&s| s > 0).map(Duration::from_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration { Duration::from_secs(self.shutdown_timeout_secs) }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxConfig {
    #[serde(default = "default_docker")]
    pub docker: String,
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,
    pub work_dir: Option<PathBuf>,
}

fn default_docker() -> String { "docker".to_string() }

fn default_image_prefix() -> String { "bug-repro".to_string() }

impl Default for SandboxConfig {
    fn default() -> Self {
        Self { docker: default_docker(), image_prefix: default_image_prefix(), work_dir: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
server:
  port: 3000
github:
  webhook_secret: hunter2
openai:
  api_key: sk-test
"#,
        )
        .unwrap();
        assert_eq!(config.github.bot_login, "bug-agent[bot]");
        assert!(config.github.token.is_none());
        assert!(config.github.app.is_none());
        assert_eq!(config.openai.model, "gpt-4o");
        assert_eq!(config.openai.max_tokens, 500);
        assert_eq!(config.worker.mode, DispatchMode::Deferred);
        assert_eq!(config.worker.job_timeout(), None);
        assert_eq!(config.worker.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.sandbox.docker, "docker");
    }

    #[test]
    fn worker_section_parses() {
        let worker: WorkerConfig =
            serde_yaml::from_str("mode: synchronous\njob_timeout_secs: 600\n").unwrap();
        assert_eq!(worker.mode, DispatchMode::Synchronous);
        assert_eq!(worker.job_timeout(), Some(Duration::from_secs(600)));

        let worker: WorkerConfig = serde_yaml::from_str("job_timeout_secs: 0\n").unwrap();
        assert_eq!(worker.job_timeout(), None);
    }

    #[test]
    fn request_timeout_covers_synchronous_jobs() {
        let cases = [
            ("", 120),
            ("worker:\n  job_timeout_secs: 600\n", 120),
            ("worker:\n  mode: synchronous\n", 120),
            ("worker:\n  mode: synchronous\n  job_timeout_secs: 600\n", 600),
            ("worker:\n  mode: synchronous\n  job_timeout_secs: 30\n", 120),
        ];
        for (worker, expected) in cases {
            let config: Config = serde_yaml::from_str(&format!(
                "server:\n  port: 3000\ngithub:\n  webhook_secret: x\n\
                 openai:\n  api_key: k\n{worker}"
            ))
            .unwrap();
            assert_eq!(config.request_timeout(), Duration::from_secs(expected), "{worker:?}");
        }
    }
}
