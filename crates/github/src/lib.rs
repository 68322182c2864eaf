pub mod events;
pub mod webhook;

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bug_agent_core::{
    config::GitHubConfig,
    models::{ChangedFile, Comment, IssueSummary, PullRequestSummary, RepoRef},
};
use octocrab::{Octocrab, models::InstallationId};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;

const PER_PAGE: u8 = 100;
const MAX_PAGES: u32 = 10;

/// Characters left as-is when encoding a single path segment.
const PATH_SEGMENT: &AsciiSet =
    &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// A reply posted into an existing pull request review thread.
#[derive(Debug, Clone)]
pub struct ReviewReply<'a> {
    pub pull_number: u64,
    pub comment_id: u64,
    pub commit_id: &'a str,
    pub path: &'a str,
    pub body: &'a str,
}

/// The GitHub operations the bot needs, scoped to a repository.
#[async_trait]
pub trait GitHubClient: Send + Sync {
    async fn list_pull_requests(&self, repo: &RepoRef) -> Result<Vec<PullRequestSummary>>;

    async fn get_pull_request(&self, repo: &RepoRef, number: u64) -> Result<PullRequestSummary>;

    async fn list_pull_request_files(&self, repo: &RepoRef, number: u64)
    -> Result<Vec<ChangedFile>>;

    async fn list_issues(&self, repo: &RepoRef) -> Result<Vec<IssueSummary>>;

    async fn get_issue(&self, repo: &RepoRef, number: u64) -> Result<IssueSummary>;

    /// Conversation comments on an issue or pull request.
    async fn list_issue_comments(&self, repo: &RepoRef, number: u64) -> Result<Vec<Comment>>;

    /// Text content of `path` at `git_ref`.
    async fn get_file_content(&self, repo: &RepoRef, path: &str, git_ref: &str) -> Result<String>;

    async fn create_issue_comment(&self, repo: &RepoRef, number: u64, body: &str) -> Result<()>;

    async fn reply_to_review_comment(&self, repo: &RepoRef, reply: &ReviewReply<'_>) -> Result<()>;
}

/// Resolves the client to use for a webhook delivery.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Client authenticated with the personal token (or anonymous).
    fn default_client(&self) -> Arc<dyn GitHubClient>;

    async fn for_installation(&self, installation_id: Option<u64>)
    -> Result<Arc<dyn GitHubClient>>;
}

pub struct GitHub {
    pub client: Octocrab,
    installations: Option<Mutex<Installations>>,
}

struct Installations {
    app_client: Octocrab,
    clients: HashMap<InstallationId, Octocrab>,
}

impl Installations {
    fn client_for_installation(&mut self, installation_id: InstallationId) -> Result<Octocrab> {
        match self.clients.entry(installation_id) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let client = self
                    .app_client
                    .installation(installation_id)
                    .context("Failed to create installation client")?;
                tracing::info!("Created client for installation {}", installation_id);
                Ok(entry.insert(client).clone())
            }
        }
    }
}

impl GitHub {
    pub async fn new(config: &GitHubConfig) -> Result<Arc<Self>> {
        let client = match &config.token {
            Some(token) => Octocrab::builder()
                .personal_token(token.clone())
                .build()
                .context("Failed to create GitHub client")?,
            None => Octocrab::default(),
        };
        if config.token.is_some() {
            let profile = client.current().user().await.context("Failed to fetch current user")?;
            tracing::info!("Logged in as {}", profile.login);
        } else {
            tracing::warn!("No GitHub token configured, using anonymous client");
        }

        let installations = if let Some(app_config) = &config.app {
            let app_client = Octocrab::builder()
                .app(
                    app_config.id.into(),
                    jsonwebtoken::EncodingKey::from_rsa_pem(app_config.private_key.as_bytes())
                        .context("Failed to parse GitHub App private key")?,
                )
                .build()
                .context("Failed to create GitHub App client")?;
            tracing::info!("Using GitHub App {}", app_config.id);
            Some(Mutex::new(Installations { app_client, clients: HashMap::new() }))
        } else {
            None
        };
        Ok(Arc::new(Self { client, installations }))
    }
}

#[async_trait]
impl ClientProvider for GitHub {
    fn default_client(&self) -> Arc<dyn GitHubClient> {
        Arc::new(OctocrabClient::new(self.client.clone()))
    }

    async fn for_installation(
        &self,
        installation_id: Option<u64>,
    ) -> Result<Arc<dyn GitHubClient>> {
        match (&self.installations, installation_id) {
            (Some(installations), Some(id)) => {
                let client =
                    installations.lock().await.client_for_installation(InstallationId(id))?;
                Ok(Arc::new(OctocrabClient::new(client)))
            }
            _ => Ok(self.default_client()),
        }
    }
}

/// [`GitHubClient`] backed by the REST API through octocrab.
#[derive(Clone)]
pub struct OctocrabClient {
    client: Octocrab,
}

#[derive(Serialize)]
struct PageParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    per_page: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page: Option<u32>,
}

#[derive(Serialize)]
struct RefParams<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
}

#[derive(Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Deserialize)]
struct ApiPullRequest {
    number: u64,
    #[serde(default)]
    title: String,
    body: Option<String>,
    user: Option<ApiUser>,
    #[serde(default)]
    labels: Vec<ApiLabel>,
    created_at: Option<String>,
    updated_at: Option<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    html_url: String,
}

impl From<ApiPullRequest> for PullRequestSummary {
    fn from(value: ApiPullRequest) -> Self {
        Self {
            number: value.number,
            title: value.title,
            body: value.body,
            author: value.user.map(|u| u.login),
            labels: value.labels.into_iter().map(|l| l.name).collect(),
            created_at: value.created_at,
            updated_at: value.updated_at,
            state: value.state,
            url: value.html_url,
        }
    }
}

#[derive(Deserialize)]
struct ApiIssue {
    number: u64,
    #[serde(default)]
    title: String,
    body: Option<String>,
    user: Option<ApiUser>,
    #[serde(default)]
    labels: Vec<ApiLabel>,
    created_at: Option<String>,
    updated_at: Option<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    html_url: String,
    pull_request: Option<serde_json::Value>,
}

impl From<ApiIssue> for IssueSummary {
    fn from(value: ApiIssue) -> Self {
        Self {
            number: value.number,
            title: value.title,
            body: value.body,
            author: value.user.map(|u| u.login),
            labels: value.labels.into_iter().map(|l| l.name).collect(),
            created_at: value.created_at,
            updated_at: value.updated_at,
            state: value.state,
            url: value.html_url,
            is_pull_request: value.pull_request.is_some(),
        }
    }
}

#[derive(Deserialize)]
struct ApiComment {
    user: Option<ApiUser>,
    body: Option<String>,
    created_at: Option<String>,
}

impl From<ApiComment> for Comment {
    fn from(value: ApiComment) -> Self {
        Self {
            author: value.user.map(|u| u.login),
            body: value.body,
            created_at: value.created_at,
        }
    }
}

#[derive(Deserialize)]
struct ApiFile {
    filename: String,
    #[serde(default)]
    status: String,
    patch: Option<String>,
}

#[derive(Deserialize)]
struct ApiContent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    encoding: String,
    #[serde(default)]
    content: String,
}

impl OctocrabClient {
    pub fn new(client: Octocrab) -> Self { Self { client } }

    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        route: &str,
        state: Option<&str>,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let params = PageParams { state, per_page: Some(PER_PAGE), page: Some(page) };
            let batch: Vec<T> = self
                .client
                .get(route, Some(&params))
                .await
                .with_context(|| format!("Failed to fetch {route} (page {page})"))?;
            let done = batch.len() < PER_PAGE as usize;
            items.extend(batch);
            if done {
                return Ok(items);
            }
        }
        tracing::warn!("Stopped paging {} after {} pages", route, MAX_PAGES);
        Ok(items)
    }
}

fn repo_route(repo: &RepoRef, rest: &str) -> String {
    format!(
        "/repos/{}/{}/{}",
        utf8_percent_encode(&repo.owner, PATH_SEGMENT),
        utf8_percent_encode(&repo.repo, PATH_SEGMENT),
        rest
    )
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| utf8_percent_encode(s, PATH_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn decode_content(content: ApiContent, path: &str) -> Result<String> {
    if !content.kind.is_empty() && content.kind != "file" {
        return Err(anyhow!("{path} is a {}, not a file", content.kind));
    }
    if content.encoding != "base64" {
        return Err(anyhow!("Unsupported encoding {:?} for {path}", content.encoding));
    }
    let stripped =
        content.content.chars().filter(|c| !c.is_ascii_whitespace()).collect::<String>();
    let bytes = STANDARD.decode(stripped).with_context(|| format!("Malformed content for {path}"))?;
    String::from_utf8(bytes).with_context(|| format!("{path} is not valid UTF-8"))
}

#[async_trait]
impl GitHubClient for OctocrabClient {
    async fn list_pull_requests(&self, repo: &RepoRef) -> Result<Vec<PullRequestSummary>> {
        let pulls: Vec<ApiPullRequest> =
            self.get_all_pages(&repo_route(repo, "pulls"), Some("open")).await?;
        Ok(pulls.into_iter().map(PullRequestSummary::from).collect())
    }

    async fn get_pull_request(&self, repo: &RepoRef, number: u64) -> Result<PullRequestSummary> {
        let pull: ApiPullRequest = self
            .client
            .get(repo_route(repo, &format!("pulls/{number}")), None::<&()>)
            .await
            .with_context(|| format!("Failed to fetch pull request {repo}#{number}"))?;
        Ok(pull.into())
    }

    async fn list_pull_request_files(
        &self,
        repo: &RepoRef,
        number: u64,
    ) -> Result<Vec<ChangedFile>> {
        let files: Vec<ApiFile> =
            self.get_all_pages(&repo_route(repo, &format!("pulls/{number}/files")), None).await?;
        Ok(files
            .into_iter()
            .map(|f| ChangedFile { filename: f.filename, status: f.status, patch: f.patch })
            .collect())
    }

    async fn list_issues(&self, repo: &RepoRef) -> Result<Vec<IssueSummary>> {
        let issues: Vec<ApiIssue> =
            self.get_all_pages(&repo_route(repo, "issues"), Some("open")).await?;
        Ok(issues.into_iter().map(IssueSummary::from).collect())
    }

    async fn get_issue(&self, repo: &RepoRef, number: u64) -> Result<IssueSummary> {
        let issue: ApiIssue = self
            .client
            .get(repo_route(repo, &format!("issues/{number}")), None::<&()>)
            .await
            .with_context(|| format!("Failed to fetch issue {repo}#{number}"))?;
        Ok(issue.into())
    }

    async fn list_issue_comments(&self, repo: &RepoRef, number: u64) -> Result<Vec<Comment>> {
        let comments: Vec<ApiComment> =
            self.get_all_pages(&repo_route(repo, &format!("issues/{number}/comments")), None)
                .await?;
        Ok(comments.into_iter().map(Comment::from).collect())
    }

    async fn get_file_content(&self, repo: &RepoRef, path: &str, git_ref: &str) -> Result<String> {
        let content: ApiContent = self
            .client
            .get(
                repo_route(repo, &format!("contents/{}", encode_path(path))),
                Some(&RefParams { git_ref }),
            )
            .await
            .with_context(|| format!("Failed to fetch {path} at {git_ref} in {repo}"))?;
        decode_content(content, path)
    }

    async fn create_issue_comment(&self, repo: &RepoRef, number: u64, body: &str) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .post(
                repo_route(repo, &format!("issues/{number}/comments")),
                Some(&serde_json::json!({ "body": body })),
            )
            .await
            .with_context(|| format!("Failed to comment on {repo}#{number}"))?;
        Ok(())
    }

    async fn reply_to_review_comment(&self, repo: &RepoRef, reply: &ReviewReply<'_>) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .post(
                repo_route(repo, &format!("pulls/{}/comments", reply.pull_number)),
                Some(&serde_json::json!({
                    "body": reply.body,
                    "commit_id": reply.commit_id,
                    "path": reply.path,
                    "in_reply_to": reply.comment_id,
                })),
            )
            .await
            .with_context(|| {
                format!("Failed to reply to review comment {} on {repo}", reply.comment_id)
            })?;
        Ok(())
    }
}
