//! In-memory storage for tests.

use std::sync::{Arc, Mutex};

use super::{StorageError, TreeStorage};

#[derive(Debug, Default)]
struct Slots {
    tree: Option<String>,
    active: Option<String>,
    import: Option<String>,
    saves: usize,
}

/// Cloneable handle to shared in-memory slots, so a test can keep one copy
/// while the store owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    slots: Arc<Mutex<Slots>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tree(document: impl Into<String>) -> Self {
        let storage = Self::new();
        storage.slots.lock().unwrap().tree = Some(document.into());
        storage
    }

    pub fn set_active(&self, node_id: &str) {
        self.slots.lock().unwrap().active = Some(node_id.to_string());
    }

    pub fn set_import(&self, document: impl Into<String>) {
        self.slots.lock().unwrap().import = Some(document.into());
    }

    pub fn tree(&self) -> Option<String> {
        self.slots.lock().unwrap().tree.clone()
    }

    pub fn active(&self) -> Option<String> {
        self.slots.lock().unwrap().active.clone()
    }

    pub fn has_import(&self) -> bool {
        self.slots.lock().unwrap().import.is_some()
    }

    /// Number of tree writes so far.
    pub fn saves(&self) -> usize {
        self.slots.lock().unwrap().saves
    }
}

impl TreeStorage for MemoryStorage {
    fn load_tree(&self) -> Result<Option<String>, StorageError> {
        Ok(self.tree())
    }

    fn save_tree(&self, document: &str) -> Result<(), StorageError> {
        let mut slots = self.slots.lock().unwrap();
        slots.tree = Some(document.to_string());
        slots.saves += 1;
        Ok(())
    }

    fn clear_tree(&self) -> Result<(), StorageError> {
        let mut slots = self.slots.lock().unwrap();
        slots.tree = None;
        slots.active = None;
        Ok(())
    }

    fn load_active(&self) -> Result<Option<String>, StorageError> {
        Ok(self.active())
    }

    fn save_active(&self, node_id: &str) -> Result<(), StorageError> {
        self.set_active(node_id);
        Ok(())
    }

    fn take_import(&self) -> Result<Option<String>, StorageError> {
        Ok(self.slots.lock().unwrap().import.take())
    }
}
