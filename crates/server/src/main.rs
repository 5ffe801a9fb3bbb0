use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use realtime::{
    ConversationService, Dispatcher, EphemeralCache, MessagePipeline, PresenceTracker,
    SessionRegistry,
};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, ConversationKind, MessageId, UserId, UserProfile},
    error::{ApiError, ChatError},
    protocol::{ConversationSummary, MessagePayload, SendMessageRequest},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use uuid::Uuid;

mod auth;
mod config;
mod ws;

use auth::TokenIssuer;
use config::{load_settings, prepare_database_url, Settings};

const MAX_BODY_BYTES: usize = 64 * 1024;

pub struct AppState {
    pub storage: Storage,
    pub registry: Arc<SessionRegistry>,
    pub cache: EphemeralCache,
    pub dispatcher: Dispatcher,
    pub conversations: ConversationService,
    pub pipeline: MessagePipeline,
    pub presence: PresenceTracker,
    pub auth: TokenIssuer,
    pub auth_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    user_id: UserId,
    username: String,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationBody {
    #[serde(rename = "type")]
    kind: ConversationKind,
    participant_ids: Vec<UserId>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
    before: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|err| {
        error!(
            %database_url,
            %err,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        err
    })?;

    let state = assemble(storage, &settings);

    // Periodic reclamation of expired cache entries.
    let sweep_cache = state.cache.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            sweep_cache.sweep();
        }
    });

    let app = build_router(state);
    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn assemble(storage: Storage, settings: &Settings) -> Arc<AppState> {
    let cache = EphemeralCache::new(
        Duration::from_secs(settings.conversation_cache_ttl_seconds),
        Duration::from_secs(settings.message_cache_ttl_seconds),
    );
    let registry = Arc::new(SessionRegistry::new());
    let dispatcher = Dispatcher::new(registry.clone(), storage.clone(), cache.clone());
    let conversations = ConversationService::new(storage.clone(), cache.clone());
    let pipeline = MessagePipeline::new(
        storage.clone(),
        cache.clone(),
        dispatcher.clone(),
        conversations.clone(),
    );
    let presence = PresenceTracker::new(
        storage.clone(),
        cache.clone(),
        dispatcher.clone(),
        registry.clone(),
        Duration::from_millis(settings.presence_debounce_ms),
    );

    Arc::new(AppState {
        storage,
        registry,
        cache,
        dispatcher,
        conversations,
        pipeline,
        presence,
        auth: TokenIssuer::new(&settings.jwt_secret, settings.token_ttl_seconds),
        auth_timeout: Duration::from_millis(settings.auth_timeout_ms),
    })
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/users/:user_id", get(get_user))
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/conversations/:conversation_id", delete(delete_conversation))
        .route(
            "/conversations/:conversation_id/messages",
            get(list_messages),
        )
        .route("/messages", post(send_message))
        .route("/messages/:message_id", delete(delete_message))
        .route("/ws", get(ws::ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

type Rejection = (StatusCode, Json<ApiError>);

fn reject(error: ChatError) -> Rejection {
    let status = StatusCode::from_u16(error.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error.into()))
}

fn bearer_user(state: &AppState, headers: &HeaderMap) -> Result<UserId, Rejection> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| reject(ChatError::AuthenticationFailed("missing bearer token".into())))?;
    state.auth.verify(token).map_err(reject)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, Rejection> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(reject(ChatError::ValidationFailed(
            "username cannot be empty".into(),
        )));
    }
    let profile = state
        .storage
        .create_user(username)
        .await
        .map_err(|e| reject(ChatError::PersistenceFailed(e.to_string())))?;
    let token = state.auth.issue(profile.user_id).map_err(reject)?;
    Ok(Json(LoginResponse {
        user_id: profile.user_id,
        username: profile.username,
        token,
    }))
}

async fn get_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UserProfile>, Rejection> {
    bearer_user(&state, &headers)?;
    let user_id = UserId(user_id);
    let mut profile = state
        .storage
        .user_profile(user_id)
        .await
        .map_err(|e| reject(ChatError::PersistenceFailed(e.to_string())))?
        .ok_or_else(|| reject(ChatError::NotFound("user not found".into())))?;
    // Live presence wins over whatever the durable row last recorded.
    profile.status = state.presence.status_of(user_id);
    Ok(Json(profile))
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateConversationBody>,
) -> Result<Json<ConversationSummary>, Rejection> {
    let user_id = bearer_user(&state, &headers)?;
    let summary = state
        .conversations
        .create(
            user_id,
            realtime::conversations::CreateConversationRequest {
                kind: body.kind,
                participant_ids: body.participant_ids,
                title: body.title,
            },
        )
        .await
        .map_err(reject)?;
    Ok(Json(summary))
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<ConversationSummary>>, Rejection> {
    let user_id = bearer_user(&state, &headers)?;
    let limit = q.limit.unwrap_or(50).clamp(1, 100);
    let summaries = state
        .conversations
        .list_for_user(user_id, limit, q.offset.unwrap_or(0))
        .await
        .map_err(reject)?;
    Ok(Json(summaries))
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
) -> Result<StatusCode, Rejection> {
    let user_id = bearer_user(&state, &headers)?;
    state
        .conversations
        .delete(ConversationId(conversation_id), user_id)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<MessagePayload>>, Rejection> {
    let user_id = bearer_user(&state, &headers)?;
    let limit = q.limit.unwrap_or(50).clamp(1, 100);
    let messages = state
        .pipeline
        .get_messages(
            user_id,
            ConversationId(conversation_id),
            limit as usize,
            q.before,
        )
        .await
        .map_err(reject)?;
    Ok(Json(messages))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessagePayload>, Rejection> {
    let user_id = bearer_user(&state, &headers)?;
    let message = state
        .pipeline
        .send_message(user_id, req)
        .await
        .map_err(reject)?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<Uuid>,
) -> Result<StatusCode, Rejection> {
    let user_id = bearer_user(&state, &headers)?;
    state
        .pipeline
        .delete_message(MessageId(message_id), user_id)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let settings = Settings {
            jwt_secret: "test-secret".into(),
            ..Settings::default()
        };
        build_router(assemble(storage, &settings))
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    async fn login_as(app: &Router, username: &str) -> (String, String) {
        let request = Request::post("/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!("{{\"username\":\"{username}\"}}")))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let value = json_body(response).await;
        (
            value["userId"].as_str().expect("userId").to_string(),
            value["token"].as_str().expect("token").to_string(),
        )
    }

    fn authed(request: axum::http::request::Builder, token: &str) -> axum::http::request::Builder {
        request.header(header::AUTHORIZATION, format!("Bearer {token}"))
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bearer_token_gates_the_api() {
        let app = test_app().await;
        let response = app
            .clone()
            .oneshot(
                Request::get("/conversations")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let (_, token) = login_as(&app, "alice").await;
        let response = app
            .oneshot(
                authed(Request::get("/conversations"), &token)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn message_flow_over_rest() {
        let app = test_app().await;
        let (_, alice_token) = login_as(&app, "alice").await;
        let (bob_id, bob_token) = login_as(&app, "bob").await;
        let (_, carol_token) = login_as(&app, "carol").await;

        let send = authed(Request::post("/messages"), &alice_token)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!(
                "{{\"receiverId\":\"{bob_id}\",\"content\":\"hello bob\",\"type\":\"text\"}}"
            )))
            .expect("request");
        let response = app.clone().oneshot(send).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let sent = json_body(response).await;
        assert_eq!(sent["status"], "sent");
        let conversation_id = sent["conversationId"].as_str().expect("conversationId");

        let history = authed(
            Request::get(format!("/conversations/{conversation_id}/messages")),
            &bob_token,
        )
        .body(Body::empty())
        .expect("request");
        let response = app.clone().oneshot(history).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let messages = json_body(response).await;
        assert_eq!(messages.as_array().expect("array").len(), 1);
        assert_eq!(messages[0]["content"], "hello bob");

        // Non-participants cannot read the conversation.
        let forbidden = authed(
            Request::get(format!("/conversations/{conversation_id}/messages")),
            &carol_token,
        )
        .body(Body::empty())
        .expect("request");
        let response = app.oneshot(forbidden).await.expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn only_the_owner_deletes_a_conversation() {
        let app = test_app().await;
        let (_, alice_token) = login_as(&app, "alice").await;
        let (bob_id, bob_token) = login_as(&app, "bob").await;

        let create = authed(Request::post("/conversations"), &alice_token)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!(
                "{{\"type\":\"group\",\"participantIds\":[\"{bob_id}\"],\"title\":\"plans\"}}"
            )))
            .expect("request");
        let response = app.clone().oneshot(create).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let summary = json_body(response).await;
        let conversation_id = summary["id"].as_str().expect("id").to_string();

        let denied = authed(
            Request::delete(format!("/conversations/{conversation_id}")),
            &bob_token,
        )
        .body(Body::empty())
        .expect("request");
        let response = app.clone().oneshot(denied).await.expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let allowed = authed(
            Request::delete(format!("/conversations/{conversation_id}")),
            &alice_token,
        )
        .body(Body::empty())
        .expect("request");
        let response = app.oneshot(allowed).await.expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let app = test_app().await;
        let (_, token) = login_as(&app, "alice").await;
        let response = app
            .oneshot(
                authed(Request::get(format!("/users/{}", Uuid::new_v4())), &token)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn login_rejects_blank_usernames() {
        let app = test_app().await;
        let request = Request::post("/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"username":"   "}"#))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
