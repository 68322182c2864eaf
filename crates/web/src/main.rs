mod handlers;

use std::{
    fs::File,
    io::BufReader,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    extract::{ConnectInfo, FromRef},
    http::{HeaderName, Request, StatusCode, header},
};
use bug_agent_analysis::{
    analyzer::LlmAnalyzer, llm::OpenAiChat, repro::AgentReproWorkflow, sandbox::DockerSandbox,
};
use bug_agent_core::config::Config;
use bug_agent_github::{ClientProvider, GitHub};
use bug_agent_jobs::{JobContext, JobQueue};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    normalize_path::NormalizePathLayer,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
};
use tracing::{Level, Span};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::handlers::build_router;

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    github: Arc<dyn ClientProvider>,
    jobs: Arc<JobContext>,
    queue: JobQueue,
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config: Arc<Config> = {
        let path = std::env::var("BUG_AGENT_CONFIG").unwrap_or_else(|_| "config.yml".to_string());
        let file = BufReader::new(File::open(&path).expect("Failed to open config file"));
        Arc::new(serde_yaml::from_reader(file).expect("Failed to parse config file"))
    };
    let github = GitHub::new(&config.github).await.expect("Failed to create GitHub client");

    let analyzer =
        LlmAnalyzer::new(Arc::new(OpenAiChat::new(&config.openai, &config.openai.model)));
    let repro = AgentReproWorkflow::new(
        Arc::new(OpenAiChat::new(&config.openai, &config.openai.workflow_model)),
        Arc::new(DockerSandbox::new(&config.sandbox)),
    );
    let jobs = Arc::new(JobContext::new(&config, Arc::new(analyzer), Arc::new(repro)));
    let queue = JobQueue::new(config.worker.job_timeout());
    tracing::info!(
        "Dispatch mode: {:?}, request timeout {}s",
        config.worker.mode,
        config.request_timeout().as_secs()
    );

    let state = AppState { config: config.clone(), github, jobs, queue: queue.clone() };
    let router = app(state, config.request_timeout())
        .into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server.port));
    tracing::info!("Web server: Listening on {}", addr);
    let listener = TcpListener::bind(addr).await.expect("bind error");

    if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await {
        tracing::error!("Web server error: {e}");
    }
    tracing::info!("Web server stopped");

    // Deferred work still in the queue gets a bounded grace period.
    queue.shutdown(config.worker.shutdown_timeout()).await;
    tracing::info!("Shut down gracefully");
}

fn app(state: AppState, request_timeout: Duration) -> Router {
    let sensitive_headers: Arc<[_]> =
        vec![header::AUTHORIZATION, HeaderName::from_static("x-hub-signature-256")].into();
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers.clone())
        .sensitive_response_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(RequestSpan { level: Level::INFO })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
        .layer(NormalizePathLayer::trim_trailing_slash())
        .compression();
    build_router().with_state(state).layer(middleware)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            result = signal::ctrl_c() => result.expect("Failed to listen for ctrl-c"),
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.expect("Failed to listen for ctrl-c");
    }
}

#[derive(Debug, Clone)]
pub struct RequestSpan {
    level: Level,
}

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let forwarded_for = request
            .headers()
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .and_then(|s| IpAddr::from_str(s.trim()).ok());
        let ip = forwarded_for
            .or_else(|| {
                request.extensions().get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(a)| a.ip())
            })
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let delivery = request
            .headers()
            .get("X-GitHub-Delivery")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("[none]");
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("[unknown]");
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    ip = %ip,
                    user_agent = %user_agent,
                    delivery = %delivery,
                )
            }
        }
        match self.level {
            Level::ERROR => make_span!(Level::ERROR),
            Level::WARN => make_span!(Level::WARN),
            Level::INFO => make_span!(Level::INFO),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::TRACE => make_span!(Level::TRACE),
        }
    }
}
