use bug_agent_core::models::RepoRef;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Invalid {event} payload: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Missing repository in {0} payload")]
    MissingRepository(String),
}

/// The account that triggered a delivery (`sender`) or authored a comment (`user`).
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct Actor {
    pub login: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl Actor {
    /// Whether this is the bot account identified by `bot_login`.
    pub fn is_bot(&self, bot_login: &str) -> bool {
        self.kind == "Bot" && self.login.eq_ignore_ascii_case(bot_login)
    }
}

#[derive(Debug, Clone)]
pub struct PullRequestOpened {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IssueOpened {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewComment {
    pub id: u64,
    #[serde(default)]
    pub body: String,
    pub path: String,
    pub commit_id: String,
    /// Last (or only) line of the commented range.
    pub line: Option<u64>,
    /// First line of a multi-line comment.
    pub start_line: Option<u64>,
    pub user: Option<Actor>,
}

#[derive(Debug, Clone)]
pub struct ReviewCommentCreated {
    pub pull_number: u64,
    pub comment: ReviewComment,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    PullRequestOpened(PullRequestOpened),
    IssueOpened(IssueOpened),
    ReviewCommentCreated(ReviewCommentCreated),
    /// Any other event/action pair. Acknowledged without side effects.
    Other,
}

/// A verified, classified webhook delivery.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub action: Option<String>,
    pub repository: Option<RepoRef>,
    pub sender: Option<Actor>,
    pub installation_id: Option<u64>,
    pub kind: EventKind,
}

#[derive(Deserialize)]
struct Envelope {
    action: Option<String>,
    repository: Option<RepositoryPayload>,
    sender: Option<Actor>,
    installation: Option<InstallationPayload>,
}

#[derive(Deserialize)]
struct RepositoryPayload {
    name: String,
    owner: OwnerPayload,
}

#[derive(Deserialize)]
struct OwnerPayload {
    login: String,
}

#[derive(Deserialize)]
struct InstallationPayload {
    id: u64,
}

#[derive(Deserialize)]
struct NumberedPayload {
    number: u64,
    #[serde(default)]
    title: String,
    body: Option<String>,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    pull_request: NumberedPayload,
}

#[derive(Deserialize)]
struct IssuePayload {
    issue: NumberedPayload,
}

#[derive(Deserialize)]
struct ReviewCommentPayload {
    pull_request: NumberedPayload,
    comment: ReviewComment,
}

fn parse<T: DeserializeOwned>(name: &str, payload: &Value) -> Result<T, EventError> {
    T::deserialize(payload)
        .map_err(|source| EventError::InvalidPayload { event: name.to_string(), source })
}

impl Event {
    /// Classifies a payload given the `X-GitHub-Event` header value.
    pub fn parse(name: &str, payload: &Value) -> Result<Self, EventError> {
        let envelope: Envelope = parse(name, payload)?;
        let repository =
            envelope.repository.map(|r| RepoRef { owner: r.owner.login, repo: r.name });
        let kind = match (name, envelope.action.as_deref()) {
            ("pull_request", Some("opened")) => {
                let PullRequestPayload { pull_request } = parse(name, payload)?;
                EventKind::PullRequestOpened(PullRequestOpened {
                    number: pull_request.number,
                    title: pull_request.title,
                    body: pull_request.body,
                })
            }
            ("issues", Some("opened")) => {
                let IssuePayload { issue } = parse(name, payload)?;
                EventKind::IssueOpened(IssueOpened {
                    number: issue.number,
                    title: issue.title,
                    body: issue.body,
                })
            }
            ("pull_request_review_comment", Some("created")) => {
                let ReviewCommentPayload { pull_request, comment } = parse(name, payload)?;
                EventKind::ReviewCommentCreated(ReviewCommentCreated {
                    pull_number: pull_request.number,
                    comment,
                })
            }
            _ => EventKind::Other,
        };
        if !matches!(kind, EventKind::Other) && repository.is_none() {
            return Err(EventError::MissingRepository(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            action: envelope.action,
            repository,
            sender: envelope.sender,
            installation_id: envelope.installation.map(|i| i.id),
            kind,
        })
    }

    /// Whether the delivery was triggered by, or concerns a comment written by, the bot itself.
    pub fn is_from_bot(&self, bot_login: &str) -> bool {
        if self.sender.as_ref().is_some_and(|s| s.is_bot(bot_login)) {
            return true;
        }
        match &self.kind {
            EventKind::ReviewCommentCreated(created) => {
                created.comment.user.as_ref().is_some_and(|u| u.is_bot(bot_login))
            }
            _ => false,
        }
    }
}
