mod handlers;

use std::{
    fs::File,
    io::BufReader,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use axum::{
    Router,
    extract::{ConnectInfo, FromRef},
    http::{Request, StatusCode, header},
};
use prgate_core::config::Config;
use prgate_github::{context::Context, dispatch::EventRouter, event_router};
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
    events: Arc<EventRouter>,
    /// Parent of every delivery context; cancelled on shutdown.
    context: Context,
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

    let config_path = std::env::var("PRGATE_CONFIG").unwrap_or_else(|_| "config.yml".to_string());
    let config = Arc::new(load_config(&config_path).expect("Failed to load config"));
    let events = event_router(&config).expect("Failed to create event router");
    let (canceller, context) = Context::cancellable();
    let state = AppState { config: config.clone(), events: Arc::new(events), context };

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server.port));
    let router = app(state).into_make_service_with_connect_info::<SocketAddr>();
    tracing::info!("Web server: Listening on {}", addr);
    let listener = TcpListener::bind(addr).await.expect("bind error");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutting down, cancelling in-flight deliveries");
            canceller.cancel();
        })
        .await
        .context("Web server error");
    if let Err(e) = result {
        tracing::error!("{e}");
    }
    tracing::info!("Shut down gracefully");
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    let file = File::open(path).with_context(|| format!("Failed to open config file {path}"))?;
    serde_yaml::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse config file {path}"))
}

fn app(state: AppState) -> Router {
    let sensitive_headers: Arc<[_]> = vec![
        header::AUTHORIZATION,
        header::COOKIE,
        header::HeaderName::from_static("x-hub-signature-256"),
    ]
    .into();
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers.clone())
        .sensitive_response_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(MyMakeSpan { level: Level::INFO })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
        .layer(NormalizePathLayer::trim_trailing_slash());
    build_router().with_state(state).layer(middleware)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            result = signal::ctrl_c() => result.expect("Failed to listen for ctrl-c"),
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.expect("Failed to listen for ctrl-c")
    }
}

#[derive(Debug, Clone)]
pub struct MyMakeSpan {
    level: Level,
}

impl<B> MakeSpan<B> for MyMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let cf_connecting_ip = request.headers().get("CF-Connecting-IP");
        let ip = if let Some(v) = cf_connecting_ip {
            std::str::from_utf8(v.as_bytes()).ok().and_then(|s| IpAddr::from_str(s).ok())
        } else if let Some(ConnectInfo(socket_addr)) =
            request.extensions().get::<ConnectInfo<SocketAddr>>()
        {
            Some(socket_addr.ip())
        } else {
            None
        };
        let ip = ip.unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("[unknown]");
        let event = request
            .headers()
            .get("X-GitHub-Event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    ip = %ip,
                    user_agent = %user_agent,
                    github_event = %event,
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

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use octocrab::models::InstallationId;
    use prgate_core::{
        config::{DispatchConfig, EvaluatorConfig, GitHubConfig, ServerConfig},
        models::{PullRequestLocator, TriggerKind},
    };
    use prgate_github::{
        check_run::CheckRunHandler,
        evaluate::{EvaluationError, Evaluator},
        installation::{AppInstallations, RepoContext},
    };
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    #[derive(Default)]
    struct FakeEvaluator {
        numbers: Mutex<Vec<u64>>,
        fail: bool,
    }

    #[async_trait]
    impl Evaluator for FakeEvaluator {
        async fn evaluate(
            &self,
            _ctx: &RepoContext,
            _installation_id: Option<InstallationId>,
            _trigger: TriggerKind,
            target: PullRequestLocator,
        ) -> Result<(), EvaluationError> {
            self.numbers.lock().unwrap().push(target.number);
            if self.fail {
                return Err(anyhow::anyhow!("evaluation failed").into());
            }
            Ok(())
        }
    }

    fn test_app(evaluator: Arc<FakeEvaluator>) -> Router {
        let config = Arc::new(Config {
            server: ServerConfig { port: 0, request_timeout_secs: 5 },
            github: GitHubConfig::default(),
            evaluator: EvaluatorConfig { url: "http://localhost".to_string(), timeout_secs: 1 },
            dispatch: DispatchConfig::default(),
        });
        let handler =
            CheckRunHandler::new(Arc::new(AppInstallations::unauthenticated()), evaluator);
        let events = EventRouter::new().register(Arc::new(handler)).unwrap();
        app(AppState { config, events: Arc::new(events), context: Context::background() })
    }

    fn delivery(event_type: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/github/webhook")
            .header("X-GitHub-Event", event_type)
            .header("X-GitHub-Delivery", "d-1")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn check_run(conclusion: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "action": "completed",
            "check_run": {
                "head_sha": "ce587453ced02b1526dfb4cb910479d431683101",
                "conclusion": conclusion,
                "pull_requests": [
                    {
                        "number": 5,
                        "base": {
                            "repo": { "id": 1, "url": "https://api.github.com/repos/acme/widgets" }
                        }
                    },
                    {
                        "number": 9,
                        "base": {
                            "repo": { "id": 2, "url": "https://api.github.com/repos/fork/widgets" }
                        }
                    }
                ]
            },
            "repository": { "id": 1, "name": "widgets", "owner": { "login": "acme" } },
            "installation": { "id": 3 }
        }))
        .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_check_run_success() {
        let evaluator = Arc::new(FakeEvaluator::default());
        let response = test_app(evaluator.clone())
            .oneshot(delivery("check_run", check_run("success")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Event processed");
        assert_eq!(*evaluator.numbers.lock().unwrap(), [5]);
    }

    #[tokio::test]
    async fn test_check_run_evaluation_failure() {
        let evaluator = Arc::new(FakeEvaluator { fail: true, ..Default::default() });
        let response = test_app(evaluator.clone())
            .oneshot(delivery("check_run", check_run("success")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, "failed to evaluate 1 pull requests");
    }

    #[tokio::test]
    async fn test_check_run_not_actionable() {
        let evaluator = Arc::new(FakeEvaluator::default());
        let response = test_app(evaluator.clone())
            .oneshot(delivery("check_run", check_run("failure")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(evaluator.numbers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_check_run() {
        let evaluator = Arc::new(FakeEvaluator::default());
        let response = test_app(evaluator.clone())
            .oneshot(delivery("check_run", b"{\"action\":".to_vec()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "failed to parse check_run event payload");
        assert!(evaluator.numbers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sparse_check_run_is_processed() {
        let evaluator = Arc::new(FakeEvaluator::default());
        let response = test_app(evaluator.clone())
            .oneshot(delivery("check_run", br#"{"action":"created"}"#.to_vec()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Event processed");
        assert!(evaluator.numbers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_events_ignored() {
        let evaluator = Arc::new(FakeEvaluator::default());
        let response = test_app(evaluator.clone())
            .oneshot(delivery("pull_request", b"{}".to_vec()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Event ignored");
        assert!(evaluator.numbers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_load_example_config() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config.example.yml");
        let config = load_config(path).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.github.app.map(|app| app.id), Some(123456));
        assert_eq!(config.dispatch.max_concurrent_evaluations, 1);

        let err = load_config("does-not-exist.yml").unwrap_err();
        assert!(err.to_string().starts_with("Failed to open config file"));
    }

    #[tokio::test]
    async fn test_healthz() {
        let response = test_app(Arc::new(FakeEvaluator::default()))
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
