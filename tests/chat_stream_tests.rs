use actix_web::{test, web, App};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use modelrelay::chat_history_manager::ChatHistoryManager;
use modelrelay::chat_service::{ChatService, RelayConfig};
use modelrelay::pricing::PricingConfig;
use modelrelay::protocol::{parse_lines, ErrorCode, OutboundEvent};
use modelrelay::provider::Vendor;
use modelrelay::provider_registry::{FixedCredentials, ProviderEndpoints, ProviderRegistry};
use modelrelay::router_client::{CatalogModel, LocalPolicyRouter, ModelCatalog, UserTier};
use modelrelay::server::config_routes;
use modelrelay::util::AppState;

/// Canned reply for one vendor route.
#[derive(Clone)]
struct Reply {
    status: u16,
    body: String,
}

#[derive(Clone)]
struct UpstreamState {
    openai: Arc<AsyncMutex<Reply>>,
    anthropic: Arc<AsyncMutex<Reply>>,
    requests: Arc<AsyncMutex<Vec<(String, Value)>>>,
}

fn sse(reply: Reply) -> impl IntoResponse {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
    (status, [("content-type", "text/event-stream")], reply.body)
}

async fn handle_openai(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.requests.lock().await.push((auth, payload));
    sse(state.openai.lock().await.clone())
}

async fn handle_anthropic(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.requests.lock().await.push((key, payload));
    sse(state.anthropic.lock().await.clone())
}

struct MockVendors {
    base_url: String,
    state: UpstreamState,
    join: JoinHandle<()>,
}

impl MockVendors {
    async fn start(openai: Reply, anthropic: Reply) -> Self {
        let state = UpstreamState {
            openai: Arc::new(AsyncMutex::new(openai)),
            anthropic: Arc::new(AsyncMutex::new(anthropic)),
            requests: Arc::new(AsyncMutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(handle_openai))
            .route("/v1/messages", post(handle_anthropic))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("upstream server error");
        });

        Self {
            base_url: format!("http://{}/v1", addr),
            state,
            join,
        }
    }

    async fn requests(&self) -> Vec<(String, Value)> {
        self.state.requests.lock().await.clone()
    }
}

impl Drop for MockVendors {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn openai_ok() -> Reply {
    let frames = [
        json!({"choices": [{"delta": {"role": "assistant", "content": "Hi"}}]}),
        json!({"choices": [{"delta": {"content": " there"}, "finish_reason": "stop"}]}),
        json!({"choices": [], "usage": {"prompt_tokens": 10, "completion_tokens": 2}}),
    ];
    let mut body: String = frames
        .iter()
        .map(|f| format!("data: {}\n\n", f))
        .collect();
    body.push_str("data: [DONE]\n\n");
    Reply { status: 200, body }
}

fn anthropic_ok() -> Reply {
    let events = [
        ("message_start", json!({"type": "message_start", "message": {"usage": {"input_tokens": 7, "output_tokens": 1}}})),
        ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Backup"}})),
        ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": " answer"}})),
        ("message_delta", json!({"type": "message_delta", "usage": {"output_tokens": 3}})),
        ("message_stop", json!({"type": "message_stop"})),
    ];
    let body = events
        .iter()
        .map(|(name, data)| format!("event: {}\ndata: {}\n\n", name, data))
        .collect();
    Reply { status: 200, body }
}

fn failing() -> Reply {
    Reply {
        status: 500,
        body: json!({"error": {"message": "upstream exploded"}}).to_string(),
    }
}

fn catalog() -> ModelCatalog {
    let model = |id: &str, vendor: &str, quality: f64| CatalogModel {
        id: id.to_string(),
        name: id.to_string(),
        vendor: vendor.to_string(),
        quality,
        modalities: vec!["text".to_string()],
        min_tier: UserTier::Free,
        notes: String::new(),
    };
    ModelCatalog {
        models: vec![
            model("gpt-4.1-mini", "openai", 0.9),
            model("claude-3-5-haiku", "anthropic", 0.8),
        ],
    }
}

fn app_state(mock: &MockVendors, credentials: FixedCredentials) -> web::Data<AppState> {
    let endpoints = ProviderEndpoints {
        openai_base_url: mock.base_url.clone(),
        anthropic_base_url: mock.base_url.clone(),
        ..Default::default()
    };
    let registry = ProviderRegistry::new(Arc::new(credentials), reqwest::Client::new(), endpoints);
    let chat = ChatService::new(
        RelayConfig::default(),
        Arc::new(registry),
        Arc::new(LocalPolicyRouter::new(catalog())),
        Arc::new(ChatHistoryManager::in_memory()),
        Arc::new(PricingConfig::default()),
    );
    web::Data::new(AppState::new(Arc::new(chat), "local:test"))
}

fn both_vendors() -> FixedCredentials {
    FixedCredentials::new()
        .with(Vendor::OpenAi, "sk-openai")
        .with(Vendor::Anthropic, "sk-anthropic")
}

macro_rules! chat_app {
    ($state:expr) => {
        test::init_service(App::new().app_data($state.clone()).configure(config_routes)).await
    };
}

/// POST /v1/chat and return (conversation id, parsed records).
macro_rules! post_chat {
    ($app:expr, $body:expr) => {{
        let req = test::TestRequest::post()
            .uri("/v1/chat")
            .set_json($body)
            .to_request();
        let resp = test::call_service(&$app, req).await;
        assert!(resp.status().is_success(), "status {}", resp.status());
        let conversation_id = resp
            .headers()
            .get("x-conversation-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .expect("conversation header");
        let body = test::read_body(resp).await;
        (conversation_id, parse_lines(&body).expect("ndjson body"))
    }};
}

fn kinds(events: &[OutboundEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind()).collect()
}

#[actix_web::test]
async fn chat_streams_and_persists_primary_answer() {
    let mock = MockVendors::start(openai_ok(), anthropic_ok()).await;
    let state = app_state(&mock, both_vendors());
    let app = chat_app!(state);

    let (conversation_id, events) = post_chat!(app, json!({"message": "hello"}));
    assert_eq!(kinds(&events), vec!["routing", "delta", "delta", "done"]);

    let OutboundEvent::Routing(routing) = &events[0] else {
        panic!("expected routing first");
    };
    assert_eq!(routing.model, "gpt-4.1-mini");
    assert!(!routing.is_manual_override);
    assert_eq!(routing.backups.len(), 1);

    let OutboundEvent::Done(done) = &events[3] else {
        panic!("expected done last");
    };
    assert_eq!(done.usage.input_tokens, 10);
    assert_eq!(done.usage.output_tokens, 2);
    let expected = PricingConfig::default().cost("openai", "gpt-4.1-mini", &done.usage);
    assert!((done.cost_usd - expected).abs() < 1e-9);
    assert!(!done.fallback_used);

    let requests = mock.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "Bearer sk-openai");
    assert_eq!(requests[0].1["model"], "gpt-4.1-mini");
    assert_eq!(requests[0].1["stream"], true);

    let req = test::TestRequest::get()
        .uri(&format!("/v1/conversations/{}/messages", conversation_id))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["content"], "Hi there");
    assert_eq!(messages[1]["model"], "gpt-4.1-mini");
    assert_eq!(messages[1]["message_id"], done.message_id.as_str());
}

#[actix_web::test]
async fn chat_falls_back_to_backup_once() {
    let mock = MockVendors::start(failing(), anthropic_ok()).await;
    let state = app_state(&mock, both_vendors());
    let app = chat_app!(state);

    let (_, events) = post_chat!(app, json!({"message": "hello"}));
    assert_eq!(
        kinds(&events),
        vec!["routing", "error", "delta", "delta", "done"]
    );
    let OutboundEvent::Error(retry) = &events[1] else {
        panic!("expected retry notice");
    };
    assert_eq!(retry.code, ErrorCode::ProviderRetry);
    assert_eq!(retry.failed_model.as_deref(), Some("gpt-4.1-mini"));
    assert_eq!(retry.next_model.as_deref(), Some("claude-3-5-haiku"));
    assert!(retry.message.contains("upstream exploded"));

    let OutboundEvent::Done(done) = events.last().unwrap() else {
        panic!("expected done");
    };
    assert!(done.fallback_used);
    assert_eq!(done.model, "claude-3-5-haiku");
    assert_eq!(done.usage.input_tokens, 7);
    assert_eq!(done.usage.output_tokens, 3);
    assert_eq!(mock.requests().await.len(), 2);
}

#[actix_web::test]
async fn chat_reports_all_providers_failed_without_done() {
    let mock = MockVendors::start(failing(), failing()).await;
    let state = app_state(&mock, both_vendors());
    let app = chat_app!(state);

    let (conversation_id, events) = post_chat!(app, json!({"message": "hello"}));
    assert!(events.iter().all(|e| e.kind() != "done"));
    let OutboundEvent::Error(last) = events.last().unwrap() else {
        panic!("expected terminal error");
    };
    assert_eq!(last.code, ErrorCode::AllProvidersFailed);

    let messages = state
        .chat
        .history()
        .thread(&conversation_id, None)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    let calls = state
        .chat
        .history()
        .list_api_calls(&conversation_id)
        .await
        .unwrap();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| !c.success));
}

#[actix_web::test]
async fn unusable_primary_vendor_is_skipped() {
    let mock = MockVendors::start(openai_ok(), anthropic_ok()).await;
    let state = app_state(
        &mock,
        FixedCredentials::new().with(Vendor::Anthropic, "sk-anthropic"),
    );
    let app = chat_app!(state);

    let (_, events) = post_chat!(app, json!({"message": "hello"}));
    let OutboundEvent::Routing(routing) = &events[0] else {
        panic!("expected routing first");
    };
    assert_eq!(routing.model, "claude-3-5-haiku");
    assert!(!routing.is_manual_override);
    assert_eq!(events.last().map(|e| e.kind()), Some("done"));
}

#[actix_web::test]
async fn manual_unknown_model_uses_default_vendor() {
    let mock = MockVendors::start(openai_ok(), anthropic_ok()).await;
    let state = app_state(&mock, both_vendors());
    let app = chat_app!(state);

    let (_, events) = post_chat!(
        app,
        json!({"message": "hello", "manual_model_id": "not-a-real-model"})
    );
    let OutboundEvent::Routing(routing) = &events[0] else {
        panic!("expected routing first");
    };
    assert_eq!(routing.model, "not-a-real-model");
    assert_eq!(routing.vendor, "openai");
    assert!(routing.is_manual_override);
    assert_eq!(routing.backups.len(), 2);

    let requests = mock.requests().await;
    assert_eq!(requests[0].1["model"], "not-a-real-model");
}

#[actix_web::test]
async fn validation_errors_happen_before_the_stream() {
    let mock = MockVendors::start(openai_ok(), anthropic_ok()).await;
    let state = app_state(&mock, both_vendors());
    let app = chat_app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/chat")
        .set_json(json!({"message": "  "}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let req = test::TestRequest::post()
        .uri("/v1/chat")
        .set_json(json!({"message": "hi", "conversation_id": "conv_nope"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 404);

    assert!(mock.requests().await.is_empty());
}

#[actix_web::test]
async fn follow_up_in_a_branch_sees_parent_context() {
    let mock = MockVendors::start(openai_ok(), anthropic_ok()).await;
    let state = app_state(&mock, both_vendors());
    let app = chat_app!(state);

    let (conversation_id, _) = post_chat!(app, json!({"message": "first question"}));
    let thread = state
        .chat
        .history()
        .thread(&conversation_id, None)
        .await
        .unwrap();
    let parent_id = thread[0].message_id.clone();

    let req = test::TestRequest::post()
        .uri(&format!("/v1/conversations/{}/sub_conversations", conversation_id))
        .set_json(json!({"parent_message_id": "msg_missing"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 400);

    let req = test::TestRequest::post()
        .uri(&format!("/v1/conversations/{}/sub_conversations", conversation_id))
        .set_json(json!({"parent_message_id": parent_id, "title": "alt"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 201);
    let sub: Value = test::read_body_json(resp).await;
    let sub_id = sub["sub_conversation_id"].as_str().unwrap().to_string();

    let (_, events) = post_chat!(
        app,
        json!({
            "message": "branch question",
            "conversation_id": conversation_id,
            "sub_conversation_id": sub_id
        })
    );
    assert_eq!(events.last().map(|e| e.kind()), Some("done"));

    // the branch saw only the parent message before its own question
    let requests = mock.requests().await;
    let messages = requests[1].1["messages"].as_array().unwrap();
    let contents: Vec<&str> = messages
        .iter()
        .filter(|m| m["role"] != "system")
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["first question", "branch question"]);

    let req = test::TestRequest::get()
        .uri(&format!("/v1/conversations/{}", conversation_id))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["sub_conversations"].as_array().unwrap().len(), 1);
}

#[actix_web::test]
async fn providers_and_status_endpoints() {
    let mock = MockVendors::start(openai_ok(), anthropic_ok()).await;
    let state = app_state(&mock, FixedCredentials::new().with(Vendor::OpenAi, "k"));
    let app = chat_app!(state);

    let req = test::TestRequest::get().uri("/v1/providers").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let providers = body["providers"].as_array().unwrap();
    assert_eq!(providers.len(), 4);
    let openai = providers.iter().find(|p| p["vendor"] == "openai").unwrap();
    assert_eq!(openai["usable"], true);
    let google = providers.iter().find(|p| p["vendor"] == "google").unwrap();
    assert_eq!(google["usable"], false);

    let req = test::TestRequest::get().uri("/status").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["name"], "modelrelay");
    assert_eq!(body["usable_vendors"], json!(["openai"]));
    assert_eq!(body["history"]["healthy"], true);
}
