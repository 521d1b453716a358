//! Persistence collaborators for the conversation tree.
//!
//! The tree store never touches the filesystem itself; it writes through a
//! [`TreeStorage`] handed to it at construction. Documents are raw JSON text
//! so that migration can run on whatever shape an older version left behind.

mod file;
#[cfg(test)]
mod memory;

use std::path::PathBuf;

use thiserror::Error;

pub use file::FileStorage;
#[cfg(test)]
pub use memory::MemoryStorage;

/// Failure reading or writing persisted state.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Read/write access to the persisted tree, the active pointer, and the
/// one-shot import handoff.
pub trait TreeStorage {
    /// Load the persisted tree document, if any.
    fn load_tree(&self) -> Result<Option<String>, StorageError>;

    /// Replace the persisted tree document.
    fn save_tree(&self, document: &str) -> Result<(), StorageError>;

    /// Remove the persisted tree document.
    fn clear_tree(&self) -> Result<(), StorageError>;

    /// Load the persisted active node id, if any.
    fn load_active(&self) -> Result<Option<String>, StorageError>;

    /// Replace the persisted active node id.
    fn save_active(&self, node_id: &str) -> Result<(), StorageError>;

    /// Read and remove the import handoff document.
    ///
    /// The handoff is removed whether or not it turns out to be valid.
    fn take_import(&self) -> Result<Option<String>, StorageError>;
}
