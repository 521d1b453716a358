//! HTTP client for an Ollama-compatible model server.
//!
//! `stream_chat` returns as soon as response headers arrive. A spawned task
//! then pumps body chunks through a [`StreamDecoder`] and forwards events over
//! a channel until the stream ends, the token fires, or the receiver is
//! dropped.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::decoder::{StreamDecoder, StreamEvent, StreamFault};
use crate::models::Message;

const EVENT_BUFFER: usize = 100;
const KEEP_ALIVE: &str = "5m";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TAGS_TIMEOUT: Duration = Duration::from_secs(10);

static MODEL_NOT_FOUND: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\bmodel\b.*\bnot found\b").ok());

/// Whether a server error text says the requested model does not exist.
pub fn is_model_not_found(text: &str) -> bool {
    MODEL_NOT_FOUND.as_ref().is_some_and(|re| re.is_match(text))
}

/// Failures talking to the model server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to the model server at {url}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("model \"{model}\" was not found")]
    ModelNotFound { model: String, detail: String },

    #[error("model server returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("model server reported an error: {0}")]
    Stream(String),

    #[error("response stream interrupted: {0}")]
    Interrupted(String),

    #[error("request to the model server failed")]
    Transport(#[from] reqwest::Error),
}

impl ClientError {
    fn from_send(source: reqwest::Error, url: &str) -> Self {
        if source.is_connect() || source.is_timeout() {
            Self::Unreachable {
                url: url.to_string(),
                source,
            }
        } else {
            Self::Transport(source)
        }
    }

    fn from_status(status: StatusCode, body: String, model: &str) -> Self {
        let detail = error_text(&body);
        if status == StatusCode::NOT_FOUND || is_model_not_found(&detail) {
            Self::ModelNotFound {
                model: model.to_string(),
                detail,
            }
        } else {
            Self::Status {
                status,
                body: detail,
            }
        }
    }

    /// Classify a fault reported in the middle of a stream.
    pub fn from_fault(fault: StreamFault, model: &str) -> Self {
        match fault {
            StreamFault::Server(message) if is_model_not_found(&message) => Self::ModelNotFound {
                model: model.to_string(),
                detail: message,
            },
            StreamFault::Server(message) => Self::Stream(message),
            StreamFault::Transport(message) => Self::Interrupted(message),
        }
    }
}

/// Pull `error` out of a JSON error body, else use the body as is.
fn error_text(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(String::from))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Sampling options sent with a chat request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatOptions {
    pub temperature: f32,
    /// Output token cap; `-1` means unlimited.
    pub num_predict: i64,
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
    pub keep_alive: String,
    pub options: ChatOptions,
}

impl ChatRequest {
    /// A streaming request with the default keep-alive.
    pub fn streaming(model: impl Into<String>, messages: Vec<Message>, options: ChatOptions) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
            keep_alive: KEEP_ALIVE.to_string(),
            options,
        }
    }
}

/// The seam between turn orchestration and the network.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Open a chat stream. Errors here happen before any content arrived.
    ///
    /// Once `cancel` fires the returned channel delivers nothing more.
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ClientError>;

    /// Names of the installed models, sorted.
    async fn list_models(&self) -> Result<Vec<String>, ClientError>;
}

/// Strip trailing slashes and a trailing `/api`; add `http://` when no scheme
/// is given (as in `OLLAMA_HOST=127.0.0.1:11434`).
pub fn normalize_base_url(url: &str) -> String {
    let mut clean = url.trim().trim_end_matches('/').to_string();
    if let Some(stripped) = clean.strip_suffix("/api") {
        clean = stripped.to_string();
    }
    if !clean.is_empty() && !clean.contains("://") {
        clean = format!("http://{clean}");
    }
    clean
}

/// Ollama HTTP client.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }
}

#[async_trait]
impl ChatBackend for OllamaClient {
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ClientError> {
        debug!(model = %request.model, messages = request.messages.len(), "opening chat stream");

        let response = self
            .http
            .post(self.chat_url())
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::from_send(e, &self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status, body, &request.model));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut decoder = StreamDecoder::new();
            loop {
                let chunk = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        debug!("chat stream cancelled");
                        return;
                    }
                    chunk = stream.next() => chunk,
                };

                let events = match chunk {
                    Some(Ok(bytes)) => decoder.push(&bytes),
                    Some(Err(e)) => {
                        let fault = StreamFault::Transport(e.to_string());
                        let _ = tx.send(StreamEvent::Error(fault)).await;
                        return;
                    }
                    None => {
                        forward(&tx, decoder.finish()).await;
                        return;
                    }
                };

                if !forward(&tx, events).await || decoder.is_terminated() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn list_models(&self) -> Result<Vec<String>, ClientError> {
        let response = self
            .http
            .get(self.tags_url())
            .timeout(TAGS_TIMEOUT)
            .send()
            .await
            .map_err(|e| ClientError::from_send(e, &self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status,
                body: error_text(&body),
            });
        }

        let body = response.text().await?;
        let data: Value = match serde_json::from_str(&body) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "model list is not valid JSON");
                return Ok(Vec::new());
            }
        };
        let Some(models) = data.get("models").and_then(Value::as_array) else {
            warn!(response = %data, "model list is not in the expected format");
            return Ok(Vec::new());
        };

        let mut names: Vec<String> = models
            .iter()
            .filter_map(|m| m.get("name").and_then(Value::as_str).map(String::from))
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Send events in order. Returns `false` once the receiver is gone.
async fn forward(tx: &mpsc::Sender<StreamEvent>, events: Vec<StreamEvent>) -> bool {
    for event in events {
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRole;
    use axum::{body::Body, http::StatusCode as HttpStatus, routing::get, routing::post, Json, Router};
    use std::convert::Infallible;

    async fn spawn_stub(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request(model: &str) -> ChatRequest {
        ChatRequest::streaming(
            model,
            vec![Message::user("hi")],
            ChatOptions {
                temperature: 0.8,
                num_predict: -1,
            },
        )
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn normalizes_base_urls() {
        assert_eq!(normalize_base_url("http://localhost:11434/"), "http://localhost:11434");
        assert_eq!(normalize_base_url("http://localhost:11434/api//"), "http://localhost:11434");
        assert_eq!(normalize_base_url(" http://h/api "), "http://h");
        assert_eq!(normalize_base_url("127.0.0.1:11434"), "http://127.0.0.1:11434");
        assert_eq!(normalize_base_url("http://h/apis"), "http://h/apis");
    }

    #[test]
    fn request_serializes_to_wire_shape() {
        let value = serde_json::to_value(request("llama3")).unwrap();
        assert_eq!(value["model"], "llama3");
        assert_eq!(value["stream"], true);
        assert_eq!(value["keep_alive"], "5m");
        assert_eq!(value["options"]["num_predict"], -1);
        assert_eq!(value["messages"][0]["role"], MessageRole::User.as_str());
    }

    #[test]
    fn recognizes_model_not_found_texts() {
        assert!(is_model_not_found("model \"llama9\" not found, try pulling it first"));
        assert!(is_model_not_found("Model not found"));
        assert!(!is_model_not_found("file not found"));
    }

    #[tokio::test]
    async fn streams_events_from_server() {
        let app = Router::new().route(
            "/api/chat",
            post(|| async {
                let chunks = vec![
                    Ok::<_, Infallible>("{\"message\":{\"content\":\"Hel\"}}\n{\"mess"),
                    Ok("age\":{\"content\":\"lo\"}}\n"),
                    Ok("{\"done\":true,\"eval_count\":10,\"eval_duration\":2000000000}\n"),
                ];
                Body::from_stream(tokio_stream::iter(chunks))
            }),
        );
        let base = spawn_stub(app).await;
        let client = OllamaClient::new(&format!("{base}/api/")).unwrap();

        let rx = client
            .stream_chat(&request("llama3"), CancellationToken::new())
            .await
            .unwrap();
        let events = collect(rx).await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], StreamEvent::Content("Hel".into()));
        assert_eq!(events[1], StreamEvent::Content("lo".into()));
        assert!(matches!(events[2], StreamEvent::Stats(s) if (s.tokens_per_second - 5.0).abs() < 1e-9));
    }

    #[tokio::test]
    async fn server_sends_request_body() {
        let app = Router::new().route(
            "/api/chat",
            post(|Json(body): Json<Value>| async move {
                let echoed = format!(
                    "{}\n",
                    serde_json::json!({"message": {"content": body["messages"][0]["content"]}})
                );
                Body::from(echoed)
            }),
        );
        let base = spawn_stub(app).await;
        let client = OllamaClient::new(&base).unwrap();

        let rx = client
            .stream_chat(&request("llama3"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(collect(rx).await, vec![StreamEvent::Content("hi".into())]);
    }

    #[tokio::test]
    async fn not_found_maps_to_model_not_found() {
        let app = Router::new().route(
            "/api/chat",
            post(|| async {
                (
                    HttpStatus::NOT_FOUND,
                    "{\"error\":\"model \\\"nope\\\" not found, try pulling it first\"}",
                )
            }),
        );
        let base = spawn_stub(app).await;
        let client = OllamaClient::new(&base).unwrap();

        let err = client
            .stream_chat(&request("nope"), CancellationToken::new())
            .await
            .unwrap_err();

        let ClientError::ModelNotFound { model, detail } = err else {
            panic!("expected a model-not-found error");
        };
        assert_eq!(model, "nope");
        assert!(detail.contains("try pulling"));
    }

    #[tokio::test]
    async fn other_statuses_are_generic() {
        let app = Router::new().route(
            "/api/chat",
            post(|| async { (HttpStatus::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let base = spawn_stub(app).await;
        let client = OllamaClient::new(&base).unwrap();

        let err = client
            .stream_chat(&request("llama3"), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Status { status, ref body } if status == StatusCode::INTERNAL_SERVER_ERROR && body == "boom"));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = OllamaClient::new(&format!("http://{addr}")).unwrap();

        let err = client
            .stream_chat(&request("llama3"), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Unreachable { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn cancelled_stream_delivers_nothing_more() {
        let app = Router::new().route(
            "/api/chat",
            post(|| async {
                let first = tokio_stream::iter(vec![Ok::<_, Infallible>(
                    "{\"message\":{\"content\":\"a\"}}\n",
                )]);
                let never = tokio_stream::pending::<Result<&'static str, Infallible>>();
                Body::from_stream(first.chain(never))
            }),
        );
        let base = spawn_stub(app).await;
        let client = OllamaClient::new(&base).unwrap();
        let cancel = CancellationToken::new();

        let mut rx = client.stream_chat(&request("llama3"), cancel.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(StreamEvent::Content("a".into())));
        cancel.cancel();

        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn lists_models_sorted() {
        let app = Router::new().route(
            "/api/tags",
            get(|| async {
                Json(serde_json::json!({"models": [{"name": "mistral"}, {"name": "llama3"}, {"size": 1}]}))
            }),
        );
        let base = spawn_stub(app).await;
        let client = OllamaClient::new(&base).unwrap();

        assert_eq!(client.list_models().await.unwrap(), vec!["llama3", "mistral"]);
    }

    #[tokio::test]
    async fn unexpected_model_list_is_empty() {
        let app = Router::new().route("/api/tags", get(|| async { Json(serde_json::json!({"oops": 1})) }));
        let base = spawn_stub(app).await;
        let client = OllamaClient::new(&base).unwrap();

        assert!(client.list_models().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_json_model_list_is_empty() {
        let app = Router::new().route("/api/tags", get(|| async { "not json" }));
        let base = spawn_stub(app).await;
        let client = OllamaClient::new(&base).unwrap();

        assert!(client.list_models().await.unwrap().is_empty());
    }
}
