//! File-backed storage under a per-user data directory.

use std::path::{Path, PathBuf};

use super::{StorageError, TreeStorage};

const APP_DIR: &str = "forkchat";
const TREE_FILE: &str = "tree.json";
const ACTIVE_FILE: &str = "active";
const IMPORT_FILE: &str = "import.json";

/// Stores the tree as `tree.json`, the active pointer as `active`, and reads
/// the handoff from `import.json`, all inside one directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open storage in the default data directory (`<data_dir>/forkchat`).
    pub fn open_default() -> Result<Self, StorageError> {
        let dir = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self::open_at(dir)
    }

    /// Open storage rooted at `dir`, creating it if needed.
    pub fn open_at(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path an external importer should write its handoff document to.
    pub fn import_path(&self) -> PathBuf {
        self.dir.join(IMPORT_FILE)
    }

    fn read_optional(&self, name: &str) -> Result<Option<String>, StorageError> {
        let path = self.dir.join(name);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    /// Write through a temporary file so a crash never leaves half a document.
    fn write_atomic(&self, name: &str, content: &str) -> Result<(), StorageError> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!(".{name}.tmp"));
        std::fs::write(&tmp, content).map_err(|source| StorageError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StorageError::Io { path, source })
    }

    fn remove(&self, name: &str) -> Result<(), StorageError> {
        let path = self.dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }
}

impl TreeStorage for FileStorage {
    fn load_tree(&self) -> Result<Option<String>, StorageError> {
        self.read_optional(TREE_FILE)
    }

    fn save_tree(&self, document: &str) -> Result<(), StorageError> {
        self.write_atomic(TREE_FILE, document)
    }

    fn clear_tree(&self) -> Result<(), StorageError> {
        self.remove(TREE_FILE)?;
        self.remove(ACTIVE_FILE)
    }

    fn load_active(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .read_optional(ACTIVE_FILE)?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    fn save_active(&self, node_id: &str) -> Result<(), StorageError> {
        self.write_atomic(ACTIVE_FILE, node_id)
    }

    fn take_import(&self) -> Result<Option<String>, StorageError> {
        let content = self.read_optional(IMPORT_FILE);
        // Clear the handoff even when it could not be read.
        let removed = self.remove(IMPORT_FILE);
        let content = content?;
        removed?;
        Ok(content)
    }
}
