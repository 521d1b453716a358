//! Errors that stop a turn from starting or committing, with their user-facing text.

use std::error::Error as _;

use thiserror::Error;

use crate::ollama::ClientError;
use crate::tree::TreeError;

/// Shown when a turn completes without any text.
pub const EMPTY_RESPONSE_MESSAGE: &str = "The model returned an empty response.";

/// Why a turn could not start or did not commit.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no model selected")]
    NoModel,

    #[error("message is empty")]
    EmptyInput,

    #[error("a response is already being generated")]
    Busy,

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl GenerationError {
    /// Human-readable explanation, with a hint where one helps.
    pub fn user_message(&self) -> String {
        match self {
            Self::NoModel => {
                "No model selected. Pass --model or set `model` in the config file.".to_string()
            }
            Self::EmptyInput => "Nothing to send: the message is empty.".to_string(),
            Self::Busy => {
                "A response is still being generated. Stop it before sending another message."
                    .to_string()
            }
            Self::Tree(e) => e.to_string(),
            Self::Client(ClientError::ModelNotFound { model, .. }) => format!(
                "Model \"{model}\" was not found.\nCheck the model name, choose an available \
                 model, or pull it with `ollama pull {model}`."
            ),
            Self::Client(ClientError::Unreachable { url, .. }) => format!(
                "Could not connect to the Ollama API at \"{url}\".\nCheck that the URL is \
                 correct and that the Ollama server is running."
            ),
            Self::Client(ClientError::Stream(message)) => {
                format!("The model server reported an error: {message}")
            }
            Self::Client(e) => format!("Error communicating with Ollama: {e}"),
        }
    }

    /// Diagnostic line for logs and verbose output: the underlying cause.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Client(ClientError::ModelNotFound { detail, .. }) if !detail.is_empty() => {
                Some(detail.clone())
            }
            Self::Client(ClientError::Status { status, body }) => Some(format!("{status}: {body}")),
            Self::Client(e) => e.source().map(ToString::to_string),
            Self::Tree(e) => e.source().map(ToString::to_string),
            _ => None,
        }
    }
}
