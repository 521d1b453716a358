//! Turn orchestration between the conversation tree and the model server.

mod error;
mod orchestrator;

pub use error::{GenerationError, EMPTY_RESPONSE_MESSAGE};
pub use orchestrator::{
    finished_update, LiveUpdate, LiveView, Orchestrator, StreamEnd, StreamedTurn, Turn,
    TurnOutcome, TurnState,
};
