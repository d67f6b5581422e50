use actix_web::{web, HttpResponse, Responder};
use bytes::Bytes;
use serde::Deserialize;

use crate::chat_history::{ChatHistoryError, ConversationFilters, MessageFilters};
use crate::chat_service::ChatRequest;
use crate::error::RelayError;
use crate::orchestrator::{EventSink, EVENT_CHANNEL_CAPACITY};
use crate::protocol::NDJSON_CONTENT_TYPE;
use crate::util::{error_response, AppState};

const ROUTES: &[&str] = &[
    "/status",
    "/v1/chat",
    "/v1/providers",
    "/v1/conversations",
    "/v1/conversations/{id}",
    "/v1/conversations/{id}/messages",
    "/v1/conversations/{id}/sub_conversations",
];

/// Query parameters for conversation listings.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
}

/// Query parameters for message listings.
#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub sub_conversation_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSubConversationRequest {
    pub parent_message_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/status", web::get().to(status))
            .route("/v1/chat", web::post().to(chat))
            .route("/v1/providers", web::get().to(providers))
            .route("/v1/conversations", web::get().to(list_conversations))
            .route("/v1/conversations/{id}", web::get().to(get_conversation))
            .route(
                "/v1/conversations/{id}/messages",
                web::get().to(list_messages),
            )
            .route(
                "/v1/conversations/{id}/sub_conversations",
                web::post().to(create_sub_conversation),
            ),
    );
}

/// Error returned before the chat stream opens.
fn relay_error_response(err: &RelayError) -> HttpResponse {
    let status = actix_web::http::StatusCode::from_u16(err.status().as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(serde_json::json!({ "error": err.to_payload() }))
}

fn history_error_response(err: ChatHistoryError) -> HttpResponse {
    match err {
        ChatHistoryError::NotFound(msg) => error_response(http::StatusCode::NOT_FOUND, &msg),
        ChatHistoryError::InvalidInput(msg) => error_response(http::StatusCode::BAD_REQUEST, &msg),
        other => {
            tracing::warn!("History lookup failed: {}", other);
            error_response(http::StatusCode::INTERNAL_SERVER_ERROR, &other.to_string())
        }
    }
}

/// Service status: version, oracle, vendor usability and store health.
async fn status(state: web::Data<AppState>) -> impl Responder {
    let history = state.chat.history();
    let healthy = history.health().await.unwrap_or(false);
    let stats = history.stats().await.ok();
    let usable: Vec<String> = {
        let mut v: Vec<String> = state
            .chat
            .providers()
            .usable_vendors()
            .into_iter()
            .map(|v| v.to_string())
            .collect();
        v.sort();
        v
    };

    web::Json(serde_json::json!({
        "name": "modelrelay",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "routes": ROUTES,
        "router": state.router_description,
        "usable_vendors": usable,
        "history": {
            "enabled": history.is_enabled(),
            "healthy": healthy,
            "privacy_level": history.privacy_level(),
            "stats": stats
        }
    }))
}

/// Stream a chat exchange as NDJSON records.
async fn chat(state: web::Data<AppState>, body: web::Json<ChatRequest>) -> HttpResponse {
    let service = state.chat.clone();
    let prepared = match service.prepare(body.into_inner()).await {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!("Rejected chat request: {}", e);
            return relay_error_response(&e);
        }
    };
    let conversation_id = prepared.conversation_id.clone();

    let (sink, mut rx) = EventSink::channel(EVENT_CHANNEL_CAPACITY);
    // Runs to completion even if the client goes away.
    actix_rt::spawn(async move {
        service.execute(prepared, sink).await;
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(event.to_line()));
        }
    };

    HttpResponse::Ok()
        .content_type(NDJSON_CONTENT_TYPE)
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("X-Conversation-Id", conversation_id))
        .streaming(Box::pin(stream))
}

async fn providers(state: web::Data<AppState>) -> impl Responder {
    web::Json(serde_json::json!({
        "providers": state.chat.providers().status()
    }))
}

async fn list_conversations(
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> HttpResponse {
    let filters = ConversationFilters {
        start_time: query.start_time,
        end_time: query.end_time,
        limit: Some(query.limit.unwrap_or(50)),
    };
    match state.chat.history().list_conversations(&filters).await {
        Ok(conversations) => HttpResponse::Ok().json(serde_json::json!({
            "conversations": conversations
        })),
        Err(e) => history_error_response(e),
    }
}

async fn get_conversation(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    let history = state.chat.history();
    let conversation = match history.get_conversation(&id).await {
        Ok(c) => c,
        Err(e) => return history_error_response(e),
    };
    match history.list_sub_conversations(&id).await {
        Ok(subs) => HttpResponse::Ok().json(serde_json::json!({
            "conversation": conversation,
            "sub_conversations": subs
        })),
        Err(e) => history_error_response(e),
    }
}

async fn list_messages(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<MessagesQuery>,
) -> HttpResponse {
    let id = path.into_inner();
    let history = state.chat.history();
    if let Err(e) = history.get_conversation(&id).await {
        return history_error_response(e);
    }
    let query = query.into_inner();
    let filters = MessageFilters {
        sub_conversation_id: query.sub_conversation_id,
        limit: query.limit,
        ..MessageFilters::for_conversation(&id)
    };
    match history.list_messages(&filters).await {
        Ok(messages) => HttpResponse::Ok().json(serde_json::json!({ "messages": messages })),
        Err(e) => history_error_response(e),
    }
}

async fn create_sub_conversation(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<CreateSubConversationRequest>,
) -> HttpResponse {
    let id = path.into_inner();
    let body = body.into_inner();
    if body.parent_message_id.trim().is_empty() {
        return error_response(
            http::StatusCode::BAD_REQUEST,
            "parent_message_id must not be empty",
        );
    }
    let history = state.chat.history();
    if let Err(e) = history.get_conversation(&id).await {
        return history_error_response(e);
    }
    match history
        .create_sub_conversation(&id, body.parent_message_id.trim(), body.title)
        .await
    {
        Ok(sub) => {
            tracing::info!("Created {} in {}", sub.sub_conversation_id, id);
            HttpResponse::Created().json(sub)
        }
        Err(e) => history_error_response(e),
    }
}
