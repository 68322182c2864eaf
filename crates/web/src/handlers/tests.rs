use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use bug_agent_analysis::{
    analyzer::RootCauseAnalyzer,
    repro::{ReproIssue, ReproWorkflow, WorkflowFailed},
};
use bug_agent_core::{
    config::Config,
    models::{
        AnalysisReport, ChangedFile, Comment, EvidenceBundle, IssueSummary, PullRequestSummary,
        RepoRef,
    },
};
use bug_agent_github::{ClientProvider, GitHubClient, ReviewReply, webhook::sign};
use bug_agent_jobs::{JobContext, JobQueue};
use serde_json::{Value, json};
use tower::ServiceExt;

use super::build_router;
use crate::AppState;

const SECRET: &str = "s3cret";

#[derive(Default)]
struct MockGitHub {
    pull_requests: Vec<PullRequestSummary>,
    fail_posts: bool,
    posts: Mutex<Vec<(u64, String)>>,
}

#[async_trait]
impl GitHubClient for MockGitHub {
    async fn list_pull_requests(&self, _repo: &RepoRef) -> Result<Vec<PullRequestSummary>> {
        Ok(self.pull_requests.clone())
    }

    async fn get_pull_request(&self, _repo: &RepoRef, number: u64) -> Result<PullRequestSummary> {
        Ok(pull_request(number, Some("error: boom")))
    }

    async fn list_pull_request_files(&self, _repo: &RepoRef, _n: u64) -> Result<Vec<ChangedFile>> {
        Ok(vec![ChangedFile { filename: "a.rs".into(), status: "added".into(), patch: None }])
    }

    async fn list_issues(&self, _repo: &RepoRef) -> Result<Vec<IssueSummary>> { Ok(vec![]) }

    async fn get_issue(&self, _repo: &RepoRef, _number: u64) -> Result<IssueSummary> {
        bail!("Not Found")
    }

    async fn list_issue_comments(&self, _repo: &RepoRef, _n: u64) -> Result<Vec<Comment>> {
        Ok(vec![Comment {
            author: Some("bob".into()),
            body: Some("```Traceback (most recent call last)```".into()),
            created_at: None,
        }])
    }

    async fn get_file_content(&self, _repo: &RepoRef, _path: &str, _ref: &str) -> Result<String> {
        Ok("fn main() {}\n".into())
    }

    async fn create_issue_comment(&self, _repo: &RepoRef, number: u64, body: &str) -> Result<()> {
        if self.fail_posts {
            bail!("GitHub returned 500");
        }
        self.posts.lock().unwrap().push((number, body.to_string()));
        Ok(())
    }

    async fn reply_to_review_comment(&self, repo: &RepoRef, reply: &ReviewReply<'_>) -> Result<()> {
        self.create_issue_comment(repo, reply.comment_id, reply.body).await
    }
}

struct MockProvider {
    client: Arc<MockGitHub>,
    installations: Mutex<Vec<Option<u64>>>,
}

#[async_trait]
impl ClientProvider for MockProvider {
    fn default_client(&self) -> Arc<dyn GitHubClient> { self.client.clone() }

    async fn for_installation(&self, id: Option<u64>) -> Result<Arc<dyn GitHubClient>> {
        self.installations.lock().unwrap().push(id);
        Ok(self.client.clone())
    }
}

struct EchoAnalyzer;

#[async_trait]
impl RootCauseAnalyzer for EchoAnalyzer {
    async fn analyze(&self, evidence: &EvidenceBundle) -> Result<AnalysisReport> {
        if !evidence.has_signal() {
            bail!("No evidence to analyze");
        }
        Ok(AnalysisReport::PlainText(format!("analyzed: {}", evidence.logs)))
    }
}

struct FixedRepro;

#[async_trait]
impl ReproWorkflow for FixedRepro {
    async fn run(&self, issue: &ReproIssue) -> Result<String, WorkflowFailed> {
        Ok(format!("Reproduced {}", issue.title))
    }
}

struct TestApp {
    router: Router,
    github: Arc<MockGitHub>,
    provider: Arc<MockProvider>,
    queue: JobQueue,
}

fn test_app(extra_config: &str, github: MockGitHub) -> TestApp {
    let yaml = format!(
        "server:\n  port: 0\nopenai:\n  api_key: sk-test\ngithub:\n  webhook_secret: {SECRET}\n\
         {extra_config}"
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    let github = Arc::new(github);
    let provider =
        Arc::new(MockProvider { client: github.clone(), installations: Mutex::default() });
    let queue = JobQueue::new(None);
    let jobs = JobContext::new(&config, Arc::new(EchoAnalyzer), Arc::new(FixedRepro));
    let state = AppState {
        config: Arc::new(config),
        github: provider.clone(),
        jobs: Arc::new(jobs),
        queue: queue.clone(),
    };
    TestApp { router: build_router().with_state(state), github, provider, queue }
}

fn synchronous() -> TestApp { test_app("worker:\n  mode: synchronous\n", MockGitHub::default()) }

fn pull_request(number: u64, body: Option<&str>) -> PullRequestSummary {
    PullRequestSummary {
        number,
        title: format!("PR {number}"),
        body: body.map(str::to_string),
        author: Some("alice".into()),
        labels: vec![],
        created_at: None,
        updated_at: None,
        state: "open".into(),
        url: format!("https://github.com/acme/widgets/pull/{number}"),
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn webhook_request(event: Option<&str>, body: &[u8], signature: Option<String>) -> Request<Body> {
    let mut builder = Request::post("/webhook").header("content-type", "application/json");
    if let Some(event) = event {
        builder = builder.header("X-GitHub-Event", event);
    }
    if let Some(signature) = signature {
        builder = builder.header("X-Hub-Signature-256", signature);
    }
    builder.body(Body::from(body.to_vec())).unwrap()
}

fn signed(event: &str, payload: &Value) -> Request<Body> {
    let body = serde_json::to_vec(payload).unwrap();
    let signature = sign(SECRET.as_bytes(), &body);
    webhook_request(Some(event), &body, Some(signature))
}

fn json_request(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn repository() -> Value { json!({ "name": "widgets", "owner": { "login": "acme" } }) }

fn pull_request_opened() -> Value {
    json!({
        "action": "opened",
        "repository": repository(),
        "sender": { "login": "alice", "type": "User" },
        "installation": { "id": 42 },
        "pull_request": { "number": 7, "title": "Fix", "body": "error: boom" },
    })
}

#[tokio::test]
async fn webhook_rejects_unverified_requests() {
    let app = synchronous();
    let body = serde_json::to_vec(&pull_request_opened()).unwrap();
    let mut mutated = body.clone();
    mutated[0] = b' ';
    let cases = [
        (webhook_request(Some("pull_request"), &body, None), 401, "No signature"),
        (
            webhook_request(Some("pull_request"), &mutated, Some(sign(SECRET.as_bytes(), &body))),
            401,
            "Invalid signature",
        ),
        (webhook_request(None, &body, Some(sign(SECRET.as_bytes(), &body))), 400, "No event type"),
        (
            webhook_request(
                Some("pull_request"),
                b"{not json",
                Some(sign(SECRET.as_bytes(), b"{not json")),
            ),
            400,
            "Invalid JSON",
        ),
    ];
    for (request, status, error) in cases {
        let (actual_status, body) = send(&app.router, request).await;
        assert_eq!(actual_status.as_u16(), status, "{error}");
        assert_eq!(body, json!({ "error": error }));
    }
    assert!(app.provider.installations.lock().unwrap().is_empty());
}

#[tokio::test]
async fn webhook_requires_installation_for_apps() {
    // Indented lines extend the github section.
    let app = test_app("  app:\n    id: 1\n    private_key: unused\n", MockGitHub::default());
    let mut payload = pull_request_opened();
    payload.as_object_mut().unwrap().remove("installation");
    let (status, body) = send(&app.router, signed("pull_request", &payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "No installation ID" }));
}

#[tokio::test]
async fn webhook_returns_synchronous_analysis() {
    let app = synchronous();
    let (status, body) = send(&app.router, signed("pull_request", &pull_request_opened())).await;
    assert_eq!(status, StatusCode::OK);
    let logs = "error: boom\nTraceback (most recent call last)\n\
                ```Traceback (most recent call last)```";
    assert_eq!(body, json!({ "analysis": format!("analyzed: {logs}") }));
    assert_eq!(*app.provider.installations.lock().unwrap(), [Some(42)]);
    assert!(app.github.posts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn webhook_ignores_bots_and_unknown_events() {
    let app = synchronous();
    let bot_comment = json!({
        "action": "created",
        "repository": repository(),
        "sender": { "login": "bug-agent[bot]", "type": "Bot" },
        "pull_request": { "number": 7, "title": "Fix" },
        "comment": {
            "id": 5,
            "body": "Root cause: ...",
            "path": "src/main.rs",
            "commit_id": "abc",
            "line": 1,
            "user": { "login": "bug-agent[bot]", "type": "Bot" },
        },
    });
    let request = signed("pull_request_review_comment", &bot_comment);
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "message": "Bot comment ignored" }));

    let ping = json!({ "zen": "Keep it logically awesome." });
    let (status, body) = send(&app.router, signed("ping", &ping)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "message": "Event ignored" }));
    assert!(app.github.posts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn webhook_reports_post_failures() {
    let app = test_app(
        "worker:\n  mode: synchronous\n",
        MockGitHub { fail_posts: true, ..Default::default() },
    );
    let issue = json!({
        "action": "opened",
        "repository": repository(),
        "issue": { "number": 3, "title": "Crash", "body": "It crashes" },
    });
    let (status, body) = send(&app.router, signed("issues", &issue)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "error": "Failed to post analysis comment" }));
}

#[tokio::test]
async fn webhook_defers_work_by_default() {
    let app = test_app("", MockGitHub::default());
    let issue = json!({
        "action": "opened",
        "repository": repository(),
        "issue": { "number": 3, "title": "Crash", "body": "It crashes" },
    });
    let (status, body) = send(&app.router, signed("issues", &issue)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true }));
    app.queue.wait_idle().await;
    assert_eq!(*app.github.posts.lock().unwrap(), [(3, "Reproduced Crash".to_string())]);
}

#[tokio::test]
async fn collector_actions() {
    let app = test_app("", MockGitHub {
        pull_requests: vec![pull_request(9, None)],
        ..Default::default()
    });
    let request = json!({ "owner": "acme", "repo": "widgets", "action": "list_prs" });
    let (status, body) = send(&app.router, json_request("/agents/collector", request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["prs"][0]["number"], 9);

    let request =
        json!({ "owner": "acme", "repo": "widgets", "action": "pr_details", "pull_number": 4 });
    let (status, body) = send(&app.router, json_request("/agents/collector", request)).await;
    assert_eq!(status, StatusCode::OK);
    let details = &body["details"];
    assert_eq!(details["summary"]["number"], 4);
    assert_eq!(details["diffs"][0]["filename"], "a.rs");
    assert_eq!(
        details["logs"],
        json!([
            "error: boom",
            "Traceback (most recent call last)",
            "```Traceback (most recent call last)```"
        ])
    );
    assert_eq!(details["comments"][0]["author"], "bob");

    for request in [
        json!({ "owner": "acme", "repo": "widgets", "action": "pr_details" }),
        json!({ "owner": "acme", "repo": "widgets", "action": "issue_comments" }),
        json!({ "owner": "acme", "repo": "widgets", "action": "delete_repo" }),
        json!({ "owner": "acme", "repo": "widgets" }),
        json!({ "repo": "widgets", "action": "list_prs" }),
    ] {
        let (status, body) = send(&app.router, json_request("/agents/collector", request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Invalid action or missing parameters" }));
    }

    let request =
        json!({ "owner": "acme", "repo": "widgets", "action": "issue_details", "issue_number": 1 });
    let (status, body) = send(&app.router, json_request("/agents/collector", request)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "error": "Internal server error" }));
}

#[tokio::test]
async fn analyzer_requires_evidence() {
    let app = synchronous();
    for request in [json!({}), json!({ "logs": "", "diffs": null })] {
        let (status, _) = send(&app.router, json_request("/agents/analyzer", request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
    let request = json!({ "logs": "NullPointerException" });
    let (status, body) = send(&app.router, json_request("/agents/analyzer", request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "analysis": "analyzed: NullPointerException" }));
}

#[tokio::test]
async fn pipeline_analyzes_latest_pull_request() {
    let app = synchronous();
    let request = json!({ "owner": "acme", "repo": "widgets" });
    let (status, body) = send(&app.router, json_request("/agents/pipeline", request.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "error": "No open pull requests in acme/widgets" }));

    let app = test_app("", MockGitHub {
        pull_requests: vec![pull_request(12, Some("panic at main.rs:3")), pull_request(11, None)],
        ..Default::default()
    });
    let (status, body) = send(&app.router, json_request("/agents/pipeline", request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "analysis": "analyzed: panic at main.rs:3" }));
}

#[tokio::test]
async fn malformed_agent_bodies_are_bad_requests() {
    let app = synchronous();
    let cases = [
        ("/agents/collector", json!({ "owner": "acme", "repo": "widgets", "pull_number": "4" })),
        ("/agents/analyzer", json!({ "logs": 5 })),
        ("/agents/pipeline", json!({ "owner": "acme" })),
    ];
    for (uri, request) in cases {
        let (status, body) = send(&app.router, json_request(uri, request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert!(body["error"].is_string(), "{uri}: {body}");
    }
    let request = Request::post("/agents/analyzer").body(Body::from("{}")).unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some_and(|e| e.contains("Content-Type")), "{body}");
}
