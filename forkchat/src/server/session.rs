//! The session task: sole owner of the tree store and the orchestrator.
//!
//! Handlers never touch the tree. They send a [`Request`] over the command
//! queue and await the reply, read the latest [`Snapshot`] from a watch
//! channel, and follow live progress on a broadcast channel. Turn streams run
//! on their own tasks and feed their progress back through the same queue, so
//! every mutation happens on this one task in arrival order.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::batch::{apply_batch, BatchError, BatchMode};
use crate::generation::{
    finished_update, GenerationError, LiveUpdate, LiveView, Orchestrator, StreamedTurn, Turn,
    TurnState,
};
use crate::models::Tree;
use crate::ollama::ChatBackend;
use crate::storage::TreeStorage;
use crate::tree::{TreeError, TreeStore};

const BROADCAST_CAPACITY: usize = 1000;

/// A mutation asked of the session.
#[derive(Debug)]
pub enum Request {
    Activate(String),
    Rename { id: String, name: String },
    Toggle(String),
    Delete(String),
    Reset,
    Import(Value),
    /// Append a user message to `node_id` and reply there.
    Submit { node_id: String, text: String },
    /// Branch off `node_id` and reply in the new branch.
    Branch { node_id: String, text: String },
    Batch {
        node_id: String,
        mode: BatchMode,
        text: String,
        separator: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Done,
    Collapsed { collapsed: bool },
    TurnStarted { turn_id: Uuid, node_id: String },
    Created { node_ids: Vec<String> },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("session is not running")]
    Closed,
}

enum Command {
    Request(Request, oneshot::Sender<Result<Reply, SessionError>>),
    Live(LiveUpdate),
    Finish(StreamedTurn),
}

/// Event pushed to WebSocket clients.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Broadcast {
    Live(LiveUpdate),
    Tree(TreeChanged),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "tree_changed")]
pub struct TreeChanged {
    pub active_node_id: String,
}

/// Read-only view of the session, refreshed after every change.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tree: Arc<Tree>,
    pub active_node_id: String,
    pub state: TurnState,
    pub model: String,
    pub live: Option<LiveView>,
}

/// Cloneable handle used by request handlers.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Snapshot>,
    events: broadcast::Sender<Broadcast>,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
    backend: Arc<dyn ChatBackend>,
}

impl SessionHandle {
    pub async fn request(&self, request: Request) -> Result<Reply, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Request(request, tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.events.subscribe()
    }

    pub fn backend(&self) -> Arc<dyn ChatBackend> {
        Arc::clone(&self.backend)
    }

    /// Fire the current turn's token. Returns whether a turn was running.
    pub fn cancel(&self) -> bool {
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

struct Session<S, B> {
    store: TreeStore<S>,
    orchestrator: Orchestrator<B>,
    commands: mpsc::WeakUnboundedSender<Command>,
    snapshot: watch::Sender<Snapshot>,
    events: broadcast::Sender<Broadcast>,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
}

/// Start the session task. It runs until every handle is dropped.
pub fn spawn<S, B>(store: TreeStore<S>, orchestrator: Orchestrator<B>) -> SessionHandle
where
    S: TreeStorage + Send + 'static,
    B: ChatBackend + 'static,
{
    let (commands, rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
    let cancel = Arc::new(Mutex::new(None));
    let backend: Arc<dyn ChatBackend> = orchestrator.backend();

    let initial = Snapshot {
        tree: Arc::new(store.tree().clone()),
        active_node_id: store.active_node_id().to_string(),
        state: orchestrator.state(),
        model: orchestrator.settings().model.clone(),
        live: None,
    };
    let (snapshot, snapshot_rx) = watch::channel(initial);

    let session = Session {
        store,
        orchestrator,
        commands: commands.downgrade(),
        snapshot,
        events: events.clone(),
        cancel: Arc::clone(&cancel),
    };
    tokio::spawn(session.run(rx));

    SessionHandle {
        commands,
        snapshot: snapshot_rx,
        events,
        cancel,
        backend,
    }
}

impl<S, B> Session<S, B>
where
    S: TreeStorage + Send + 'static,
    B: ChatBackend + 'static,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Request(request, reply) => {
                    let result = self.handle(request);
                    let _ = reply.send(result);
                }
                Command::Live(update) => self.on_live(update),
                Command::Finish(streamed) => self.on_finish(streamed),
            }
        }
        debug!("session task stopped");
    }

    fn handle(&mut self, request: Request) -> Result<Reply, SessionError> {
        let reply = match request {
            Request::Activate(id) => {
                self.store.set_active(&id)?;
                Reply::Done
            }
            Request::Rename { id, name } => {
                self.store.rename_node(&id, name)?;
                Reply::Done
            }
            Request::Toggle(id) => Reply::Collapsed {
                collapsed: self.store.toggle_collapse(&id)?,
            },
            Request::Delete(id) => {
                self.store.delete_node(&id)?;
                Reply::Done
            }
            Request::Reset => {
                self.abandon_turn();
                self.store.reset_tree();
                Reply::Done
            }
            Request::Import(candidate) => {
                self.store.load_tree(candidate)?;
                self.abandon_turn();
                Reply::Done
            }
            Request::Submit { node_id, text } => {
                self.orchestrator.check_ready(&text)?;
                self.store.set_active(&node_id)?;
                let turn = self.orchestrator.prepare_submit(&mut self.store, &text)?;
                self.start_turn(turn)
            }
            Request::Branch { node_id, text } => {
                let turn = self
                    .orchestrator
                    .prepare_branch(&mut self.store, &node_id, &text)?;
                self.start_turn(turn)
            }
            Request::Batch {
                node_id,
                mode,
                text,
                separator,
            } => Reply::Created {
                node_ids: apply_batch(&mut self.store, mode, &text, &separator, &node_id)?,
            },
        };
        self.publish(true);
        Ok(reply)
    }

    /// Run `turn` on its own task, feeding progress back into the queue.
    fn start_turn(&mut self, turn: Turn) -> Reply {
        let reply = Reply::TurnStarted {
            turn_id: turn.id(),
            node_id: turn.target().to_string(),
        };
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(turn.cancel_token());

        let Some(commands) = self.commands.upgrade() else {
            return reply;
        };
        let backend = self.orchestrator.backend();
        tokio::spawn(async move {
            let live = commands.clone();
            let streamed = turn
                .stream(backend.as_ref(), |update| {
                    let _ = live.send(Command::Live(update.clone()));
                })
                .await;
            let _ = commands.send(Command::Finish(streamed));
        });
        reply
    }

    fn on_live(&mut self, update: LiveUpdate) {
        if self.orchestrator.apply_live(&update) {
            let _ = self.events.send(Broadcast::Live(update));
            self.publish(false);
        }
    }

    fn on_finish(&mut self, streamed: StreamedTurn) {
        let turn_id = streamed.turn_id;
        let node_id = streamed.target.clone();
        if self.orchestrator.current_turn_id() != Some(turn_id) {
            debug!(%turn_id, "ignoring result of superseded turn");
            return;
        }

        let outcome = self.orchestrator.finish_turn(&mut self.store, streamed);
        self.clear_cancel();
        info!(%turn_id, outcome = outcome.kind(), "turn finished");
        self.publish(true);
        let _ = self
            .events
            .send(Broadcast::Live(finished_update(turn_id, &node_id, &outcome)));
    }

    /// Drop the running turn, if any, before the tree it targets is replaced.
    fn abandon_turn(&mut self) {
        if self.orchestrator.cancel() {
            debug!("turn abandoned by tree replacement");
        }
        self.clear_cancel();
    }

    fn clear_cancel(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn publish(&self, tree_changed: bool) {
        let previous = self.snapshot.borrow().tree.clone();
        let tree = if tree_changed {
            Arc::new(self.store.tree().clone())
        } else {
            previous
        };
        let snapshot = Snapshot {
            tree,
            active_node_id: self.store.active_node_id().to_string(),
            state: self.orchestrator.state(),
            model: self.orchestrator.settings().model.clone(),
            live: self.orchestrator.live_view().cloned(),
        };
        if tree_changed {
            let changed = TreeChanged {
                active_node_id: snapshot.active_node_id.clone(),
            };
            let _ = self.events.send(Broadcast::Tree(changed));
        }
        self.snapshot.send_replace(snapshot);
    }
}
