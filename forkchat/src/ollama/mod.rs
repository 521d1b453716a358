//! Ollama model server integration.

mod client;
mod decoder;
#[cfg(test)]
mod scripted;

pub use client::{ChatBackend, ChatOptions, ChatRequest, ClientError, OllamaClient};
pub use decoder::{StreamEvent, StreamFault};
#[cfg(test)]
pub use scripted::ScriptedBackend;
