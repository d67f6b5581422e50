use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use modelrelay::router_client::{
    HttpRouterClient, HttpRouterConfig, RecommendRequest, RouteError, RouteFeedback,
    RouterClient,
};

#[derive(Clone, Default)]
struct OracleState {
    status: u16,
    delay_ms: u64,
    seen: Arc<AsyncMutex<Vec<Value>>>,
    feedback: Arc<AsyncMutex<Vec<Value>>>,
}

async fn recommend(State(state): State<OracleState>, Json(body): Json<Value>) -> impl IntoResponse {
    state.seen.lock().await.push(body);
    if state.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(state.delay_ms)).await;
    }
    if state.status != 200 {
        let status = StatusCode::from_u16(state.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, "oracle overloaded").into_response();
    }
    Json(json!({
        "primary": {"id": "gpt-4.1", "name": "GPT-4.1", "vendor": "openai", "score": 0.92, "reasoning_summary": "strong general model"},
        "backups": [
            {"id": "claude-3-5-sonnet", "vendor": "anthropic", "score": 0.88}
        ],
        "analysis": "general question",
        "confidence": 0.8
    }))
    .into_response()
}

async fn feedback(State(state): State<OracleState>, Json(body): Json<Value>) -> StatusCode {
    state.feedback.lock().await.push(body);
    StatusCode::NO_CONTENT
}

struct MockOracle {
    url: String,
    state: OracleState,
    join: JoinHandle<()>,
}

impl MockOracle {
    async fn start(status: u16, delay_ms: u64) -> Self {
        let state = OracleState {
            status,
            delay_ms,
            ..Default::default()
        };
        let app = Router::new()
            .route("/recommend", post(recommend))
            .route("/feedback", post(feedback))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind oracle");
        let addr = listener.local_addr().expect("local addr");
        let join = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("oracle server error");
        });
        Self {
            url: format!("http://{}", addr),
            state,
            join,
        }
    }
}

impl Drop for MockOracle {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn client(url: &str, timeout_ms: u64) -> HttpRouterClient {
    HttpRouterClient::new(HttpRouterConfig {
        url: url.to_string(),
        timeout_ms,
        client: None,
    })
    .expect("router client")
}

fn request() -> RecommendRequest {
    RecommendRequest {
        available_providers: vec!["anthropic".into(), "openai".into()],
        previous_model: Some("gpt-4.1".into()),
        ..RecommendRequest::new("Summarize the plot of Hamlet")
    }
}

#[tokio::test]
async fn recommend_parses_oracle_response() {
    let oracle = MockOracle::start(200, 0).await;
    let rec = client(&format!("{}/", oracle.url), 2_000)
        .recommend(&request())
        .await
        .expect("recommendation");

    assert_eq!(rec.primary.id, "gpt-4.1");
    assert_eq!(rec.primary.name, "GPT-4.1");
    assert_eq!(rec.primary.reasoning, "strong general model");
    assert_eq!(rec.backups.len(), 1);
    assert_eq!(rec.backups[0].vendor, "anthropic");
    assert!(rec.unsupported.is_none());

    let seen = oracle.state.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["prompt"], "Summarize the plot of Hamlet");
    assert_eq!(seen[0]["available_providers"], json!(["anthropic", "openai"]));
    assert_eq!(seen[0]["previous_model"], "gpt-4.1");
    assert_eq!(seen[0]["modality"], "text");
}

#[tokio::test]
async fn recommend_surfaces_oracle_failure() {
    let oracle = MockOracle::start(503, 0).await;
    let err = client(&oracle.url, 2_000)
        .recommend(&request())
        .await
        .expect_err("oracle failure");
    match err {
        RouteError::RouterError(msg) => assert!(msg.contains("oracle overloaded"), "{}", msg),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn recommend_times_out() {
    let oracle = MockOracle::start(200, 500).await;
    let err = client(&oracle.url, 50)
        .recommend(&request())
        .await
        .expect_err("timeout");
    assert!(matches!(err, RouteError::Timeout(_)), "{:?}", err);
}

#[tokio::test]
async fn recommend_reports_unreachable_oracle() {
    // Bind then drop to get a port nobody listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(&format!("http://{}", addr), 1_000)
        .recommend(&request())
        .await
        .expect_err("unreachable");
    assert!(
        matches!(err, RouteError::Unavailable(_) | RouteError::Timeout(_)),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn feedback_is_delivered_in_background() {
    let oracle = MockOracle::start(200, 0).await;
    let client = client(&oracle.url, 2_000);
    client
        .feedback(&RouteFeedback {
            request_id: "req_1".into(),
            model_id: "gpt-4.1".into(),
            vendor: "openai".into(),
            success: true,
            duration_ms: Some(120),
            usage: None,
            cost_usd: Some(0.001),
            errors: Vec::new(),
        })
        .expect("feedback accepted");

    for _ in 0..50 {
        if !oracle.state.feedback.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let delivered = oracle.state.feedback.lock().await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["model_id"], "gpt-4.1");
    assert!(delivered[0].get("usage").is_none());
}
