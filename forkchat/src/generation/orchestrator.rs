//! Per-turn lifecycle: build the outbound context, stream the reply into a
//! transient live view, then commit it to the tree or discard it.
//!
//! A turn is split in three so the streaming part needs no access to the
//! tree:
//!
//! 1. [`Orchestrator::begin_turn`] snapshots the history into a [`Turn`].
//! 2. [`Turn::stream`] consumes the model stream and returns a
//!    [`StreamedTurn`].
//! 3. [`Orchestrator::finish_turn`] commits or discards it.
//!
//! [`Orchestrator::run_turn`] chains the three for callers that own the
//! store outright.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::GenerationError;
use crate::config::Settings;
use crate::models::{GenerationStats, Message};
use crate::names::display_name;
use crate::ollama::{ChatBackend, ChatOptions, ChatRequest, ClientError, StreamEvent};
use crate::storage::TreeStorage;
use crate::tree::{TreeError, TreeStore};

/// Where the orchestrator is in the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Requesting,
    Streaming,
    Committing,
}

/// How a turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    /// The reply was appended to `node_id`.
    Committed {
        node_id: String,
        stats: Option<GenerationStats>,
    },
    /// Stopped by the user, or superseded. Nothing was committed.
    Cancelled,
    /// The stream completed without any text.
    Empty,
    /// The stream failed. Nothing was committed.
    Failed(GenerationError),
}

impl TurnOutcome {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Committed { .. } => "committed",
            Self::Cancelled => "cancelled",
            Self::Empty => "empty",
            Self::Failed(_) => "failed",
        }
    }
}

/// Progress of a turn, as pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveUpdate {
    Started {
        turn_id: Uuid,
        node_id: String,
    },
    Delta {
        turn_id: Uuid,
        content: String,
    },
    Stats {
        turn_id: Uuid,
        stats: GenerationStats,
    },
    Finished {
        turn_id: Uuid,
        node_id: String,
        outcome: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl LiveUpdate {
    pub const fn turn_id(&self) -> Uuid {
        match self {
            Self::Started { turn_id, .. }
            | Self::Delta { turn_id, .. }
            | Self::Stats { turn_id, .. }
            | Self::Finished { turn_id, .. } => *turn_id,
        }
    }

    fn finished(turn_id: Uuid, node_id: &str, outcome: &TurnOutcome) -> Self {
        let message = match outcome {
            TurnOutcome::Failed(e) => Some(e.user_message()),
            TurnOutcome::Empty => Some(super::EMPTY_RESPONSE_MESSAGE.to_string()),
            _ => None,
        };
        Self::Finished {
            turn_id,
            node_id: node_id.to_string(),
            outcome: outcome.kind(),
            message,
        }
    }
}

/// The in-flight assistant text of the current turn. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveView {
    pub turn_id: Uuid,
    pub node_id: String,
    pub text: String,
}

/// A turn that has been set up but not yet streamed.
#[derive(Debug)]
pub struct Turn {
    id: Uuid,
    target: String,
    request: ChatRequest,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub enum StreamEnd {
    /// The stream ended without error.
    Completed,
    Cancelled,
    Failed(ClientError),
}

/// Everything a turn produced, ready to commit or discard.
#[derive(Debug)]
pub struct StreamedTurn {
    pub turn_id: Uuid,
    pub target: String,
    pub text: String,
    pub stats: Option<GenerationStats>,
    pub end: StreamEnd,
}

impl Turn {
    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub const fn request(&self) -> &ChatRequest {
        &self.request
    }

    /// Token that stops this turn when fired.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Consume the model stream, reporting each step to `observer`.
    ///
    /// Once the token fires no further events are applied or reported.
    pub async fn stream<B>(self, backend: &B, mut observer: impl FnMut(&LiveUpdate)) -> StreamedTurn
    where
        B: ChatBackend + ?Sized,
    {
        let Self {
            id,
            target,
            request,
            cancel,
        } = self;
        let mut streamed = StreamedTurn {
            turn_id: id,
            target,
            text: String::new(),
            stats: None,
            end: StreamEnd::Completed,
        };

        observer(&LiveUpdate::Started {
            turn_id: id,
            node_id: streamed.target.clone(),
        });

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = backend.stream_chat(&request, cancel.clone()) => Some(result),
        };
        let mut events = match opened {
            None => {
                streamed.end = StreamEnd::Cancelled;
                return streamed;
            }
            Some(Err(e)) => {
                streamed.end = StreamEnd::Failed(e);
                return streamed;
            }
            Some(Ok(events)) => events,
        };

        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                event = events.recv() => Some(event),
            };
            let Some(event) = event else {
                streamed.end = StreamEnd::Cancelled;
                break;
            };
            // Channel closed without a fault: treat as completion.
            let Some(event) = event else { break };
            if cancel.is_cancelled() {
                streamed.end = StreamEnd::Cancelled;
                break;
            }

            match event {
                StreamEvent::Content(content) => {
                    streamed.text.push_str(&content);
                    observer(&LiveUpdate::Delta {
                        turn_id: id,
                        content,
                    });
                }
                StreamEvent::Stats(stats) => {
                    streamed.stats = Some(stats);
                    observer(&LiveUpdate::Stats { turn_id: id, stats });
                }
                StreamEvent::Error(fault) => {
                    streamed.end = StreamEnd::Failed(ClientError::from_fault(fault, &request.model));
                    break;
                }
            }
        }

        debug!(turn_id = %id, chars = streamed.text.len(), end = ?streamed.end, "stream ended");
        streamed
    }
}

#[derive(Debug)]
struct CurrentTurn {
    id: Uuid,
    cancel: CancellationToken,
    state: TurnState,
}

/// Owns the settings and the model backend, and runs one turn at a time.
pub struct Orchestrator<B> {
    backend: Arc<B>,
    settings: Settings,
    current: Option<CurrentTurn>,
    live: Option<LiveView>,
}

impl<B: ChatBackend> Orchestrator<B> {
    pub fn new(backend: Arc<B>, settings: Settings) -> Self {
        Self {
            backend,
            settings,
            current: None,
            live: None,
        }
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> TurnState {
        self.current.as_ref().map_or(TurnState::Idle, |turn| turn.state)
    }

    pub const fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_turn_id(&self) -> Option<Uuid> {
        self.current.as_ref().map(|turn| turn.id)
    }

    pub const fn live_view(&self) -> Option<&LiveView> {
        self.live.as_ref()
    }

    /// Outbound messages for a turn on `target`: the reconstructed history,
    /// cut to the history window, with the system prompt in front.
    pub fn build_request<S: TreeStorage>(
        &self,
        store: &TreeStore<S>,
        target: &str,
    ) -> Result<ChatRequest, GenerationError> {
        if !self.settings.has_model() {
            return Err(GenerationError::NoModel);
        }
        if !store.contains(target) {
            return Err(TreeError::NodeNotFound(target.to_string()).into());
        }

        let mut history = store.reconstruct_history(target);
        let window = self.settings.history_length;
        if window > 0 && history.len() > window {
            history.drain(..history.len() - window);
        }

        let mut messages = Vec::with_capacity(history.len() + 1);
        if !self.settings.system_prompt.is_empty() {
            messages.push(Message::system(self.settings.system_prompt.as_str()));
        }
        messages.extend(history);

        Ok(ChatRequest::streaming(
            self.settings.model.as_str(),
            messages,
            ChatOptions {
                temperature: self.settings.temperature,
                num_predict: self.settings.num_predict(),
            },
        ))
    }

    /// Start a turn whose reply will be committed to `target`.
    pub fn begin_turn<S: TreeStorage>(
        &mut self,
        store: &TreeStore<S>,
        target: &str,
    ) -> Result<Turn, GenerationError> {
        if self.is_busy() {
            return Err(GenerationError::Busy);
        }
        let request = self.build_request(store, target)?;

        let turn = Turn {
            id: Uuid::now_v7(),
            target: target.to_string(),
            request,
            cancel: CancellationToken::new(),
        };
        self.current = Some(CurrentTurn {
            id: turn.id,
            cancel: turn.cancel.clone(),
            state: TurnState::Requesting,
        });
        self.live = Some(LiveView {
            turn_id: turn.id,
            node_id: turn.target.clone(),
            text: String::new(),
        });
        info!(turn_id = %turn.id, node_id = target, model = %turn.request.model, "turn started");
        Ok(turn)
    }

    /// Append `text` as a user message to the active node and start a turn
    /// on it.
    pub fn prepare_submit<S: TreeStorage>(
        &mut self,
        store: &mut TreeStore<S>,
        text: &str,
    ) -> Result<Turn, GenerationError> {
        self.check_ready(text)?;
        let target = store.active_node_id().to_string();
        store.append_message(&target, Message::user(text));
        self.begin_turn(store, &target)
    }

    /// Branch off `node_id` with `text` as a named user message and start a
    /// turn on the new node.
    pub fn prepare_branch<S: TreeStorage>(
        &mut self,
        store: &mut TreeStore<S>,
        node_id: &str,
        text: &str,
    ) -> Result<Turn, GenerationError> {
        self.check_ready(text)?;
        let branch = store.add_branch(Message::user(text), node_id)?;
        store.rename_node(&branch, display_name(text))?;
        self.begin_turn(store, &branch)
    }

    /// Whether a turn carrying `text` could start now.
    pub fn check_ready(&self, text: &str) -> Result<(), GenerationError> {
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyInput);
        }
        if self.is_busy() {
            return Err(GenerationError::Busy);
        }
        if !self.settings.has_model() {
            return Err(GenerationError::NoModel);
        }
        Ok(())
    }

    /// Fold a live update into the live view. Updates from anything but the
    /// current, uncancelled turn are ignored.
    pub fn apply_live(&mut self, update: &LiveUpdate) -> bool {
        let Some(current) = self.current.as_mut() else {
            return false;
        };
        if current.id != update.turn_id() || current.cancel.is_cancelled() {
            return false;
        }
        if let LiveUpdate::Delta { content, .. } = update {
            current.state = TurnState::Streaming;
            if let Some(live) = self.live.as_mut() {
                live.text.push_str(content);
            }
        }
        true
    }

    /// Stop the current turn. Returns whether there was one.
    ///
    /// The orchestrator is idle again immediately; whatever the stopped turn
    /// still produces is discarded by [`finish_turn`](Self::finish_turn).
    pub fn cancel(&mut self) -> bool {
        let Some(current) = self.current.take() else {
            return false;
        };
        current.cancel.cancel();
        self.live = None;
        info!(turn_id = %current.id, "turn cancelled");
        true
    }

    /// Commit or discard a streamed turn.
    pub fn finish_turn<S: TreeStorage>(
        &mut self,
        store: &mut TreeStore<S>,
        streamed: StreamedTurn,
    ) -> TurnOutcome {
        let Some(current) = self
            .current
            .as_mut()
            .filter(|turn| turn.id == streamed.turn_id)
        else {
            debug!(turn_id = %streamed.turn_id, "discarding stale turn");
            return TurnOutcome::Cancelled;
        };
        if current.cancel.is_cancelled() {
            self.current = None;
            self.live = None;
            return TurnOutcome::Cancelled;
        }
        current.state = TurnState::Committing;

        let outcome = match streamed.end {
            StreamEnd::Cancelled => TurnOutcome::Cancelled,
            StreamEnd::Failed(e) => {
                let err = GenerationError::from(e);
                warn!(turn_id = %streamed.turn_id, error = %err, "turn failed");
                TurnOutcome::Failed(err)
            }
            StreamEnd::Completed if streamed.text.trim().is_empty() => {
                warn!(turn_id = %streamed.turn_id, "model returned an empty response");
                TurnOutcome::Empty
            }
            StreamEnd::Completed => {
                if store.append_message(&streamed.target, Message::assistant(streamed.text)) {
                    info!(turn_id = %streamed.turn_id, node_id = %streamed.target, "turn committed");
                    TurnOutcome::Committed {
                        node_id: streamed.target,
                        stats: streamed.stats,
                    }
                } else {
                    TurnOutcome::Failed(TreeError::NodeNotFound(streamed.target).into())
                }
            }
        };

        self.current = None;
        self.live = None;
        outcome
    }

    /// Stream `turn` and commit it, reporting progress to `observer`.
    pub async fn run_turn<S: TreeStorage>(
        &mut self,
        store: &mut TreeStore<S>,
        turn: Turn,
        mut observer: impl FnMut(&LiveUpdate),
    ) -> TurnOutcome {
        let backend = self.backend();
        let turn_id = turn.id();
        let target = turn.target().to_string();

        let streamed = turn
            .stream(backend.as_ref(), |update| {
                if self.apply_live(update) {
                    observer(update);
                }
            })
            .await;

        let outcome = self.finish_turn(store, streamed);
        observer(&LiveUpdate::finished(turn_id, &target, &outcome));
        outcome
    }

    /// Check the configured model against the server's list, switching to the
    /// first available model if it is missing. Returns the list.
    pub async fn validate_model(&mut self) -> Result<Vec<String>, GenerationError> {
        let models = self.backend.list_models().await?;
        if models.is_empty() {
            warn!(model = %self.settings.model, "model server reports no models");
        } else if !models.contains(&self.settings.model) {
            warn!(
                configured = %self.settings.model,
                fallback = %models[0],
                "configured model is not available, switching to the first available model"
            );
            self.settings.model.clone_from(&models[0]);
        }
        Ok(models)
    }
}

/// Build the terminal update for a turn that was finished outside
/// [`Orchestrator::run_turn`].
pub fn finished_update(turn_id: Uuid, node_id: &str, outcome: &TurnOutcome) -> LiveUpdate {
    LiveUpdate::finished(turn_id, node_id, outcome)
}
