//! HTTP/WebSocket service around one conversation session.
//!
//! Endpoints:
//! - GET /api/tree - Tree, active node, turn state, and live view
//! - GET /api/export - Tree as a JSON attachment
//! - POST /api/import - Replace the tree
//! - POST /api/reset - Start over with a fresh root
//! - PATCH /api/nodes/{id} - Rename a node
//! - DELETE /api/nodes/{id} - Delete a leaf
//! - POST /api/nodes/{id}/toggle - Collapse or expand
//! - POST /api/nodes/{id}/activate - Make a node active
//! - POST /api/nodes/{id}/messages - Send a message on a node (202)
//! - POST /api/nodes/{id}/branches - Branch off a node (202)
//! - POST /api/nodes/{id}/batch - Batch import or batch branch
//! - POST /api/cancel - Stop the running turn
//! - GET /api/models - Models on the Ollama server
//! - WS /ws - Live turn progress and tree change notices

mod session;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::batch::{BatchError, BatchMode, DEFAULT_CHAIN_SEPARATOR, DEFAULT_SIBLING_SEPARATOR};
use crate::generation::{GenerationError, LiveView, Orchestrator, TurnState};
use crate::models::Tree;
use crate::ollama::{ChatBackend, ClientError};
use crate::storage::TreeStorage;
use crate::tree::{TreeError, TreeStore};

pub use session::{spawn, Reply, Request, SessionError, SessionHandle};

// === Server Lifecycle ===

/// Start the server and run until it fails.
pub async fn start_server<S, B>(
    port: u16,
    store: TreeStore<S>,
    orchestrator: Orchestrator<B>,
) -> Result<()>
where
    S: TreeStorage + Send + 'static,
    B: ChatBackend + 'static,
{
    let handle = spawn(store, orchestrator);
    let app = router(handle);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "forkchat server listening");
    println!("forkchat server running on http://{addr}");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

pub fn router(handle: SessionHandle) -> Router {
    Router::new()
        .route("/api/tree", get(get_tree))
        .route("/api/export", get(export_tree))
        .route("/api/import", post(import_tree))
        .route("/api/reset", post(reset_tree))
        .route("/api/nodes/{id}", patch(rename_node).delete(delete_node))
        .route("/api/nodes/{id}/toggle", post(toggle_node))
        .route("/api/nodes/{id}/activate", post(activate_node))
        .route("/api/nodes/{id}/messages", post(submit_message))
        .route("/api/nodes/{id}/branches", post(branch_from))
        .route("/api/nodes/{id}/batch", post(batch_nodes))
        .route("/api/cancel", post(cancel_turn))
        .route("/api/models", get(list_models))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(handle)
}

// === Errors ===

/// Error response: a status and a user-facing message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({"error": self.message}));
        (self.status, body).into_response()
    }
}

impl From<TreeError> for ApiError {
    fn from(e: TreeError) -> Self {
        let status = match e {
            TreeError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            TreeError::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Tree(e)
            | SessionError::Generation(GenerationError::Tree(e))
            | SessionError::Batch(BatchError::Tree(e)) => e.into(),
            SessionError::Generation(GenerationError::Busy) => {
                Self::new(StatusCode::CONFLICT, GenerationError::Busy.user_message())
            }
            SessionError::Generation(e) => Self::new(StatusCode::BAD_REQUEST, e.user_message()),
            SessionError::Batch(e @ BatchError::ParentNotFound(_)) => {
                Self::new(StatusCode::NOT_FOUND, e.to_string())
            }
            SessionError::Batch(e) => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            SessionError::Closed => Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        }
    }
}

impl From<ClientError> for ApiError {
    fn from(e: ClientError) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, GenerationError::from(e).user_message())
    }
}

// === Request / Response Types ===

#[derive(Debug, Serialize)]
struct TreeResponse<'a> {
    tree: &'a Tree,
    active_node_id: &'a str,
    state: TurnState,
    model: &'a str,
    live: Option<&'a LiveView>,
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TextRequest {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BatchModeParam {
    Chained,
    Siblings,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    mode: BatchModeParam,
    text: String,
    separator: Option<String>,
}

// === Handlers ===

async fn get_tree(State(handle): State<SessionHandle>) -> Response {
    let snapshot = handle.snapshot();
    Json(TreeResponse {
        tree: &snapshot.tree,
        active_node_id: &snapshot.active_node_id,
        state: snapshot.state,
        model: &snapshot.model,
        live: snapshot.live.as_ref(),
    })
    .into_response()
}

async fn export_tree(State(handle): State<SessionHandle>) -> Result<Response, ApiError> {
    let snapshot = handle.snapshot();
    let json = serde_json::to_string_pretty(&*snapshot.tree).map_err(TreeError::Serialize)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"forkchat-tree.json\"",
            ),
        ],
        json,
    )
        .into_response())
}

async fn import_tree(
    State(handle): State<SessionHandle>,
    Json(candidate): Json<serde_json::Value>,
) -> Result<StatusCode, ApiError> {
    handle.request(Request::Import(candidate)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reset_tree(State(handle): State<SessionHandle>) -> Result<StatusCode, ApiError> {
    handle.request(Request::Reset).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rename_node(
    State(handle): State<SessionHandle>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Result<StatusCode, ApiError> {
    handle.request(Request::Rename { id, name: req.name }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_node(
    State(handle): State<SessionHandle>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    handle.request(Request::Delete(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_node(
    State(handle): State<SessionHandle>,
    Path(id): Path<String>,
) -> Result<Json<Reply>, ApiError> {
    Ok(Json(handle.request(Request::Toggle(id)).await?))
}

async fn activate_node(
    State(handle): State<SessionHandle>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    handle.request(Request::Activate(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_message(
    State(handle): State<SessionHandle>,
    Path(node_id): Path<String>,
    Json(req): Json<TextRequest>,
) -> Result<(StatusCode, Json<Reply>), ApiError> {
    let reply = handle
        .request(Request::Submit {
            node_id,
            text: req.text,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(reply)))
}

async fn branch_from(
    State(handle): State<SessionHandle>,
    Path(node_id): Path<String>,
    Json(req): Json<TextRequest>,
) -> Result<(StatusCode, Json<Reply>), ApiError> {
    let reply = handle
        .request(Request::Branch {
            node_id,
            text: req.text,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(reply)))
}

async fn batch_nodes(
    State(handle): State<SessionHandle>,
    Path(node_id): Path<String>,
    Json(req): Json<BatchRequest>,
) -> Result<(StatusCode, Json<Reply>), ApiError> {
    let (mode, default_separator) = match req.mode {
        BatchModeParam::Chained => (BatchMode::Chained, DEFAULT_CHAIN_SEPARATOR),
        BatchModeParam::Siblings => (BatchMode::Siblings, DEFAULT_SIBLING_SEPARATOR),
    };
    let reply = handle
        .request(Request::Batch {
            node_id,
            mode,
            text: req.text,
            separator: req.separator.unwrap_or_else(|| default_separator.to_string()),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(reply)))
}

async fn cancel_turn(State(handle): State<SessionHandle>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"cancelled": handle.cancel()}))
}

async fn list_models(State(handle): State<SessionHandle>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(handle.backend().list_models().await?))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(handle): State<SessionHandle>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_websocket(socket, handle))
}

async fn handle_websocket(mut socket: WebSocket, handle: SessionHandle) {
    let mut events = BroadcastStream::new(handle.subscribe());

    // Late joiners get the text streamed so far.
    if let Some(live) = handle.snapshot().live {
        let hello = serde_json::json!({
            "type": "live",
            "turn_id": live.turn_id,
            "node_id": live.node_id,
            "text": live.text,
        });
        if socket.send(WsMessage::Text(hello.to_string().into())).await.is_err() {
            return;
        }
    }

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "websocket client lagging");
                continue;
            }
        };
        let Ok(json) = serde_json::to_string(&event) else {
            continue;
        };
        if socket.send(WsMessage::Text(json.into())).await.is_err() {
            break;
        }
    }
    debug!("websocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::models::ROOT_ID;
    use crate::ollama::{ScriptedBackend, StreamEvent};
    use crate::storage::MemoryStorage;
    use serde_json::{json, Value};
    use std::sync::Arc;

    async fn serve(backend: Arc<ScriptedBackend>) -> String {
        let store = TreeStore::new(MemoryStorage::new());
        let handle = spawn(store, Orchestrator::new(backend, Settings::default()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(handle)).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn tree(client: &reqwest::Client, base: &str) -> Value {
        client
            .get(format!("{base}/api/tree"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn tree_starts_with_root() {
        let base = serve(ScriptedBackend::replying(Vec::new())).await;
        let body = tree(&reqwest::Client::new(), &base).await;

        assert_eq!(body["active_node_id"], ROOT_ID);
        assert_eq!(body["state"], "idle");
        assert_eq!(body["model"], "llama3");
        assert!(body["tree"][ROOT_ID]["parentId"].is_null());
        assert!(body["live"].is_null());
    }

    #[tokio::test]
    async fn node_operations_map_errors_to_statuses() {
        let base = serve(ScriptedBackend::replying(Vec::new())).await;
        let client = reqwest::Client::new();

        let missing = client
            .patch(format!("{base}/api/nodes/ghost"))
            .json(&json!({"name": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let root = client
            .delete(format!("{base}/api/nodes/{ROOT_ID}"))
            .send()
            .await
            .unwrap();
        assert_eq!(root.status(), StatusCode::BAD_REQUEST);
        let body: Value = root.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("root"));

        let renamed = client
            .patch(format!("{base}/api/nodes/{ROOT_ID}"))
            .json(&json!({"name": "start"}))
            .send()
            .await
            .unwrap();
        assert_eq!(renamed.status(), StatusCode::NO_CONTENT);
        assert_eq!(tree(&client, &base).await["tree"][ROOT_ID]["name"], "start");
    }

    #[tokio::test]
    async fn import_without_root_is_rejected() {
        let base = serve(ScriptedBackend::replying(Vec::new())).await;
        let client = reqwest::Client::new();
        let before = tree(&client, &base).await;

        let response = client
            .post(format!("{base}/api/import"))
            .json(&json!({"a": {"id": "a"}}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(tree(&client, &base).await, before);
    }

    #[tokio::test]
    async fn export_is_an_attachment() {
        let base = serve(ScriptedBackend::replying(Vec::new())).await;
        let response = reqwest::get(format!("{base}/api/export")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap();
        assert!(disposition.starts_with("attachment"));
        let body: Value = response.json().await.unwrap();
        assert!(body.get(ROOT_ID).is_some());
    }

    #[tokio::test]
    async fn branch_is_accepted_and_busy_submit_conflicts() {
        let base = serve(ScriptedBackend::stalling(vec![StreamEvent::Content("…".into())])).await;
        let client = reqwest::Client::new();

        let accepted = client
            .post(format!("{base}/api/nodes/{ROOT_ID}/branches"))
            .json(&json!({"text": "what if"}))
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);
        let reply: Value = accepted.json().await.unwrap();
        assert!(reply["turn_id"].is_string());

        let busy = client
            .post(format!("{base}/api/nodes/{ROOT_ID}/messages"))
            .json(&json!({"text": "again"}))
            .send()
            .await
            .unwrap();
        assert_eq!(busy.status(), StatusCode::CONFLICT);

        let cancelled: Value = client
            .post(format!("{base}/api/cancel"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(cancelled["cancelled"], true);
    }

    #[tokio::test]
    async fn batch_uses_mode_default_separator() {
        let base = serve(ScriptedBackend::replying(Vec::new())).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/api/nodes/{ROOT_ID}/batch"))
            .json(&json!({"mode": "chained", "text": "q\n---\na"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let reply: Value = response.json().await.unwrap();
        assert_eq!(reply["node_ids"].as_array().unwrap().len(), 2);

        let empty = client
            .post(format!("{base}/api/nodes/{ROOT_ID}/batch"))
            .json(&json!({"mode": "siblings", "text": "   "}))
            .send()
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn models_come_from_backend() {
        let base = serve(ScriptedBackend::with_models(&["llama3", "mistral"])).await;
        let models: Vec<String> = reqwest::get(format!("{base}/api/models"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(models, vec!["llama3", "mistral"]);
    }
}
