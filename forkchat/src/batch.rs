//! Batch creation of nodes from pasted text.
//!
//! A blob is cut on a literal separator into chunks. Chunks either become a
//! chain of alternating user/assistant nodes (importing an existing
//! conversation) or a fan of user branches under one parent (trying several
//! prompts at the same point).

use thiserror::Error;
use tracing::info;

use crate::models::Message;
use crate::names::display_name;
use crate::storage::TreeStorage;
use crate::tree::{TreeError, TreeStore};

/// Default separator for chained import, as typed by a user.
pub const DEFAULT_CHAIN_SEPARATOR: &str = "\\n---\\n";
/// Default separator for sibling branches: one prompt per line.
pub const DEFAULT_SIBLING_SEPARATOR: &str = "\\n";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("separator must not be empty")]
    EmptySeparator,

    #[error("no content found after splitting on the separator")]
    NoChunks,

    #[error("parent node not found: {0}")]
    ParentNotFound(String),

    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// How chunks are attached to the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Each chunk under the previous one, roles alternating from user.
    Chained,
    /// Every chunk a user branch under the same parent.
    Siblings,
}

/// Turn `\n` and `\t` escape literals into the characters they name.
pub fn unescape_separator(separator: &str) -> String {
    separator.replace("\\n", "\n").replace("\\t", "\t")
}

/// Split `text` on the literal (already unescaped) `separator`, dropping
/// blank chunks.
pub fn split_batch(text: &str, separator: &str) -> Result<Vec<String>, BatchError> {
    if separator.is_empty() {
        return Err(BatchError::EmptySeparator);
    }
    let chunks: Vec<String> = text
        .trim()
        .split(separator)
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .map(String::from)
        .collect();
    if chunks.is_empty() {
        return Err(BatchError::NoChunks);
    }
    Ok(chunks)
}

/// Split and attach `text` under `parent_id`. Returns the ids created, in
/// order. Nothing is mutated on error.
pub fn apply_batch<S: TreeStorage>(
    store: &mut TreeStore<S>,
    mode: BatchMode,
    text: &str,
    separator: &str,
    parent_id: &str,
) -> Result<Vec<String>, BatchError> {
    let chunks = split_batch(text, &unescape_separator(separator))?;
    if !store.contains(parent_id) {
        return Err(BatchError::ParentNotFound(parent_id.to_string()));
    }
    match mode {
        BatchMode::Chained => import_chained(store, &chunks, parent_id),
        BatchMode::Siblings => branch_siblings(store, &chunks, parent_id),
    }
}

fn import_chained<S: TreeStorage>(
    store: &mut TreeStore<S>,
    chunks: &[String],
    parent_id: &str,
) -> Result<Vec<String>, BatchError> {
    let mut ids = Vec::with_capacity(chunks.len());
    let mut parent = parent_id.to_string();

    for (i, chunk) in chunks.iter().enumerate() {
        let message = if i % 2 == 0 {
            Message::user(chunk.as_str())
        } else {
            Message::assistant(chunk.as_str())
        };
        let id = store.add_branch(message, &parent)?;
        if i == 0 {
            store.rename_node(&id, display_name(chunk))?;
        }
        parent.clone_from(&id);
        ids.push(id);
    }

    info!(nodes = ids.len(), parent_id, "imported chained conversation");
    Ok(ids)
}

fn branch_siblings<S: TreeStorage>(
    store: &mut TreeStore<S>,
    chunks: &[String],
    parent_id: &str,
) -> Result<Vec<String>, BatchError> {
    let mut ids = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        ids.push(store.add_branch(Message::user(chunk.as_str()), parent_id)?);
    }

    if let Some(first) = ids.first() {
        store.rename_node(first, display_name(&chunks[0]))?;
        store.set_active(first)?;
    }

    info!(branches = ids.len(), parent_id, "created sibling branches");
    Ok(ids)
}
