use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    serve, Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::credentials::ApiKeySlot;
use crate::error::ChatError;
use crate::model::ImageAttachment;
use crate::orchestrator::{Orchestrator, StateUpdate, TurnInput};

// Frames pushed to WebSocket clients
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastMessage {
    message_type: String,
    payload: serde_json::Value,
}

impl BroadcastMessage {
    fn state(event: &str, update: &impl Serialize) -> Self {
        Self {
            message_type: "State".to_string(),
            payload: serde_json::json!({ "event": event, "state": update }),
        }
    }
}

/// Where the web UI's files live.
#[derive(Debug, Clone)]
pub struct WebConfig {
    pub templates_dir: String,
    pub static_dir: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            templates_dir: crate::constants::TEMPLATES_DIR.clone(),
            static_dir: crate::constants::STATIC_DIR.clone(),
        }
    }
}

#[derive(Clone)]
pub struct WebState {
    templates: Arc<AutoReloader>,
    orchestrator: Orchestrator,
    api_key: ApiKeySlot,
}

fn create_minijinja_env(templates_dir: &str) -> AutoReloader {
    let dir = templates_dir.to_string();
    AutoReloader::new(move |notifier| {
        let mut env = Environment::new();
        env.set_loader(path_loader(dir.clone()));
        notifier.watch_path(dir.as_str(), true);
        Ok(env)
    })
}

/// Maps chat errors onto HTTP statuses.
struct ApiError(ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            ChatError::EmptyInput => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Busy(_) | ChatError::NoActiveChat => StatusCode::CONFLICT,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn index_handler(State(state): State<WebState>) -> Result<Html<String>, Html<String>> {
    let snapshot = state.orchestrator.snapshot().await;
    state
        .templates
        .acquire_env()
        .and_then(|env| {
            env.get_template("index.html").and_then(|tmpl| {
                tmpl.render(minijinja::context! {
                    title => "enhaIA",
                    chats => &snapshot.chats,
                    active_chat => snapshot.active_chat(),
                })
            })
        })
        .map(Html)
        .map_err(|e| {
            error!("Failed to get or render template: {}", e);
            Html(format!("Internal Server Error: {}", e))
        })
}

async fn state_handler(State(state): State<WebState>) -> impl IntoResponse {
    Json(state.orchestrator.snapshot().await)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedChat {
    id: String,
}

async fn new_chat_handler(State(state): State<WebState>) -> impl IntoResponse {
    let id = state.orchestrator.new_chat().await;
    (StatusCode::CREATED, Json(CreatedChat { id }))
}

async fn select_chat_handler(
    State(state): State<WebState>,
    Path(chat_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.select_chat(&chat_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct RenameRequest {
    title: String,
}

async fn rename_chat_handler(
    State(state): State<WebState>,
    Path(chat_id): Path<String>,
    Json(body): Json<RenameRequest>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.rename_chat(&chat_id, &body.title).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_chat_handler(
    State(state): State<WebState>,
    Path(chat_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete_chat(&chat_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

async fn search_handler(
    State(state): State<WebState>,
    Path(chat_id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state.orchestrator.search(&chat_id, &query.q).await?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadedImage {
    mime_type: String,
    /// Base64, without the `data:` prefix.
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    #[serde(default)]
    text: String,
    image: Option<UploadedImage>,
    #[serde(default)]
    image_mode: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcceptedTurn {
    chat_id: String,
    message_id: u64,
}

async fn send_message_handler(
    State(state): State<WebState>,
    Path(chat_id): Path<String>,
    Json(body): Json<SendRequest>,
) -> Response {
    let image = match body.image {
        Some(upload) => match BASE64_STANDARD.decode(upload.data.as_bytes()) {
            Ok(data) => Some(ImageAttachment::new(upload.mime_type, data)),
            Err(e) => {
                warn!("Rejected image upload: {}", e);
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": "image data is not valid base64" })),
                )
                    .into_response();
            }
        },
        None => None,
    };

    let input = TurnInput {
        text: body.text,
        image,
        image_mode: body.image_mode,
    };
    let pending = match state.orchestrator.submit(&chat_id, input).await {
        Ok(pending) => pending,
        Err(e) => return ApiError(e).into_response(),
    };

    let accepted = AcceptedTurn {
        chat_id: pending.chat_id().to_string(),
        message_id: pending.message_id(),
    };
    // Results reach the page through the WebSocket.
    tokio::spawn(async move {
        let outcome = pending.run().await;
        info!(chat_id = %outcome.chat_id, status = ?outcome.status, "Turn finished");
    });
    (StatusCode::ACCEPTED, Json(accepted)).into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyStatus {
    selected: bool,
}

async fn key_status_handler(State(state): State<WebState>) -> impl IntoResponse {
    Json(KeyStatus {
        selected: state.api_key.get().await.is_some(),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyRequest {
    api_key: String,
}

async fn set_key_handler(
    State(state): State<WebState>,
    Json(body): Json<KeyRequest>,
) -> StatusCode {
    if body.api_key.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    state.api_key.set(body.api_key).await;
    state.orchestrator.refresh_credential().await;
    info!("API key supplied from the web UI");
    StatusCode::NO_CONTENT
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WebState>) -> impl IntoResponse {
    info!("WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode_update(update: &StateUpdate) -> Option<String> {
    let msg = BroadcastMessage::state(update.event, update.state.as_ref());
    serde_json::to_string(&msg)
        .map_err(|e| error!("Failed to serialize broadcast message: {}", e))
        .ok()
}

async fn handle_socket(mut socket: WebSocket, state: WebState) {
    info!("New WebSocket connection established");
    let mut updates = state.orchestrator.subscribe();

    // Start every client from the current state.
    let snapshot = state.orchestrator.snapshot().await;
    if let Ok(json_msg) = serde_json::to_string(&BroadcastMessage::state("snapshot", &snapshot)) {
        if socket.send(Message::Text(json_msg)).await.is_err() {
            warn!("Failed to send initial state to new WebSocket client");
            return;
        }
    }

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(update) => {
                        let Some(json_msg) = encode_update(&update) else { continue };
                        if socket.send(Message::Text(json_msg)).await.is_err() {
                            warn!("WebSocket client disconnected or send error. Closing connection.");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        // Later frames carry the full state, so skipping is harmless.
                        warn!(skipped, "WebSocket client lagging behind state updates");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        // Actions go through the REST endpoints.
                        info!("Ignoring text message from client: {}", text);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Received unexpected binary message from client");
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("Client requested WebSocket close");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                    None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                }
            }
        }
    }
    info!("WebSocket connection closed");
}

pub fn build_router(orchestrator: Orchestrator, api_key: ApiKeySlot, config: &WebConfig) -> Router {
    let state = WebState {
        templates: Arc::new(create_minijinja_env(&config.templates_dir)),
        orchestrator,
        api_key,
    };

    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .route("/api/state", get(state_handler))
        .route("/api/chats", post(new_chat_handler))
        .route(
            "/api/chats/:id",
            axum::routing::patch(rename_chat_handler).delete(delete_chat_handler),
        )
        .route("/api/chats/:id/select", post(select_chat_handler))
        .route(
            "/api/chats/:id/messages",
            get(search_handler).post(send_message_handler),
        )
        .route("/api/key", get(key_status_handler).post(set_key_handler))
        .nest_service("/static", ServeDir::new(&config.static_dir))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_web_server(
    port: u16,
    orchestrator: Orchestrator,
    api_key: ApiKeySlot,
    config: WebConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = build_router(orchestrator, api_key, &config);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Web server failed")?;

    Ok(())
}
