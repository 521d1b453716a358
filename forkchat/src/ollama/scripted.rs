//! Scripted backend for tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ChatBackend, ChatRequest, ClientError, StreamEvent};

/// Replays a fixed list of events for every request and records requests.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    events: Vec<StreamEvent>,
    open_error: Mutex<Option<ClientError>>,
    models: Vec<String>,
    hold_open: bool,
    requests: Mutex<Vec<ChatRequest>>,
    open_streams: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
}

impl ScriptedBackend {
    pub fn replying(events: Vec<StreamEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            ..Self::default()
        })
    }

    /// Like [`replying`](Self::replying), but the stream never ends on its own.
    pub fn stalling(events: Vec<StreamEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            hold_open: true,
            ..Self::default()
        })
    }

    pub fn failing(error: ClientError) -> Arc<Self> {
        Arc::new(Self {
            open_error: Mutex::new(Some(error)),
            ..Self::default()
        })
    }

    pub fn with_models(models: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            models: models.iter().map(ToString::to_string).collect(),
            ..Self::default()
        })
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Close the streams held open by a [`stalling`](Self::stalling) backend.
    pub fn release(&self) {
        self.open_streams.lock().unwrap().clear();
    }

    pub fn last_request(&self) -> ChatRequest {
        self.requests().pop().unwrap()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, ClientError> {
        self.requests.lock().unwrap().push(request.clone());
        let open_error = self.open_error.lock().unwrap().take();
        if let Some(e) = open_error {
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(self.events.len().max(1));
        for event in &self.events {
            tx.send(event.clone()).await.unwrap();
        }
        if self.hold_open {
            self.open_streams.lock().unwrap().push(tx);
        }
        Ok(rx)
    }

    async fn list_models(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.models.clone())
    }
}
