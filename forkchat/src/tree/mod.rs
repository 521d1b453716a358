//! Conversation tree store: the branching arena, its mutations, history
//! reconstruction, and schema migration.

mod migrate;
mod store;

use thiserror::Error;

pub use migrate::{migrate_tree, migrate_value};
pub use store::TreeStore;

/// Validation failures of tree operations. None of these change the tree.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("the root node cannot be deleted")]
    CannotDeleteRoot,

    #[error("node {0} has branches; delete all of its branches first")]
    HasChildren(String),

    #[error("invalid tree: a valid tree must contain a \"root\" node")]
    MissingRoot,

    #[error("invalid tree document: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to serialize tree")]
    Serialize(#[source] serde_json::Error),

    #[error("tree integrity violated: {0}")]
    Integrity(String),
}
