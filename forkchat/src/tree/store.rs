//! The live conversation tree and its write-through persistence.

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{migrate_tree, TreeError};
use crate::models::{fresh_tree, Message, Tree, TreeNode, ROOT_ID};
use crate::names::generate_node_id;
use crate::storage::TreeStorage;

/// Owns the tree arena and the active pointer, and writes every mutation
/// through to its storage.
///
/// Persistence failures are logged and never undo or block a mutation.
#[derive(Debug)]
pub struct TreeStore<S> {
    tree: Tree,
    active: String,
    storage: S,
}

impl<S: TreeStorage> TreeStore<S> {
    /// A store holding only a fresh root. Nothing is read from `storage`.
    pub fn new(storage: S) -> Self {
        Self {
            tree: fresh_tree(),
            active: ROOT_ID.to_string(),
            storage,
        }
    }

    /// Open the store at startup.
    ///
    /// Loads and migrates the persisted tree (falling back to a fresh root if
    /// it is missing, empty, or unreadable), restores the active pointer, then
    /// consumes the one-shot import handoff.
    pub fn open(storage: S) -> Self {
        let mut store = Self::new(storage);

        match store.storage.load_tree() {
            Ok(Some(document)) => match parse_document(&document) {
                Ok(tree) => {
                    debug!(nodes = tree.len(), "loaded persisted tree");
                    store.tree = tree;
                }
                Err(e) => warn!(error = %e, "ignoring unreadable persisted tree"),
            },
            Ok(None) => debug!("no persisted tree, starting fresh"),
            Err(e) => error!(error = %e, "failed to read persisted tree"),
        }

        match store.storage.load_active() {
            Ok(Some(id)) if store.tree.contains_key(&id) => store.active = id,
            Ok(Some(id)) => debug!(node_id = %id, "persisted active node no longer exists"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to read active node"),
        }

        store.consume_import();

        if let Err(e) = store.check_integrity() {
            warn!(error = %e, "loaded tree is inconsistent");
        }
        store
    }

    fn consume_import(&mut self) {
        let document = match self.storage.take_import() {
            Ok(Some(document)) => document,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "failed to read import handoff");
                return;
            }
        };

        let candidate = match serde_json::from_str::<Value>(&document) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "discarding malformed import handoff");
                return;
            }
        };

        match self.load_tree(candidate) {
            Ok(()) => {
                self.active = self.deepest_last_descendant(ROOT_ID);
                info!(active = %self.active, "imported conversation from handoff");
                self.persist();
            }
            Err(e) => warn!(error = %e, "discarding invalid import handoff"),
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn node(&self, node_id: &str) -> Option<&TreeNode> {
        self.tree.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.tree.contains_key(node_id)
    }

    pub fn active_node_id(&self) -> &str {
        &self.active
    }

    /// Move the active pointer.
    pub fn set_active(&mut self, node_id: &str) -> Result<(), TreeError> {
        if !self.contains(node_id) {
            return Err(TreeError::NodeNotFound(node_id.to_string()));
        }
        self.active = node_id.to_string();
        if let Err(e) = self.storage.save_active(&self.active) {
            error!(error = %e, "failed to persist active node");
        }
        Ok(())
    }

    /// Create a new leaf holding `message` under `parent_id` and make it active.
    pub fn add_branch(&mut self, message: Message, parent_id: &str) -> Result<String, TreeError> {
        if !self.contains(parent_id) {
            return Err(TreeError::NodeNotFound(parent_id.to_string()));
        }
        let id = generate_node_id(|candidate| self.tree.contains_key(candidate));

        let parent = self.node_mut(parent_id)?;
        parent.children_ids.push(id.clone());
        parent.is_collapsed = false;

        self.tree.insert(
            id.clone(),
            TreeNode::leaf(id.clone(), parent_id.to_string(), message),
        );
        self.active.clone_from(&id);
        debug!(node_id = %id, parent_id, "added branch");
        self.persist();
        Ok(id)
    }

    /// Push `message` onto an existing node. Returns `false` (and changes
    /// nothing) if the node does not exist.
    pub fn append_message(&mut self, node_id: &str, message: Message) -> bool {
        let Some(node) = self.tree.get_mut(node_id) else {
            warn!(node_id, "append to unknown node ignored");
            return false;
        };
        node.messages.push(message);
        self.persist();
        true
    }

    pub fn rename_node(&mut self, node_id: &str, name: impl Into<String>) -> Result<(), TreeError> {
        let node = self.node_mut(node_id)?;
        node.name = Some(name.into());
        self.persist();
        Ok(())
    }

    /// Flip the collapsed flag. Returns the new value.
    pub fn toggle_collapse(&mut self, node_id: &str) -> Result<bool, TreeError> {
        let node = self.node_mut(node_id)?;
        node.is_collapsed = !node.is_collapsed;
        let collapsed = node.is_collapsed;
        self.persist();
        Ok(collapsed)
    }

    /// Delete a leaf. The root and nodes with children are refused.
    pub fn delete_node(&mut self, node_id: &str) -> Result<(), TreeError> {
        if node_id == ROOT_ID {
            return Err(TreeError::CannotDeleteRoot);
        }
        let node = self
            .tree
            .get(node_id)
            .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))?;
        if node.is_root() {
            return Err(TreeError::CannotDeleteRoot);
        }
        if !node.is_leaf() {
            return Err(TreeError::HasChildren(node_id.to_string()));
        }

        let parent_id = node.parent_id.clone();
        self.tree.remove(node_id);
        if let Some(parent) = parent_id.as_deref().and_then(|id| self.tree.get_mut(id)) {
            parent.children_ids.retain(|child| child != node_id);
        }

        if self.active == node_id {
            self.active = parent_id
                .filter(|id| self.tree.contains_key(id))
                .unwrap_or_else(|| ROOT_ID.to_string());
        }
        debug!(node_id, "deleted node");
        self.persist();
        Ok(())
    }

    /// Replace everything with a fresh root and clear persisted state.
    pub fn reset_tree(&mut self) {
        self.tree = fresh_tree();
        self.active = ROOT_ID.to_string();
        if let Err(e) = self.storage.clear_tree() {
            error!(error = %e, "failed to clear persisted tree");
        }
        info!("conversation tree reset");
        self.persist();
    }

    /// Replace the tree with an externally supplied one.
    ///
    /// The candidate must contain a `root` key; it is migrated before it goes
    /// live. On any error the current tree and active pointer are untouched.
    pub fn load_tree(&mut self, candidate: Value) -> Result<(), TreeError> {
        let has_root = candidate
            .as_object()
            .is_some_and(|nodes| nodes.contains_key(ROOT_ID));
        if !has_root {
            return Err(TreeError::MissingRoot);
        }

        let tree = migrate_tree(candidate)?;
        if let Err(e) = check_integrity(&tree) {
            warn!(error = %e, "loaded tree is inconsistent");
        }
        self.tree = tree;
        self.active = ROOT_ID.to_string();
        info!(nodes = self.tree.len(), "loaded tree");
        self.persist();
        Ok(())
    }

    /// Linear model context for `leaf_id`: every message on the root-to-leaf
    /// path in order, minus the first one (the root's welcome message).
    ///
    /// Runs in time proportional to the path depth. An unknown id yields an
    /// empty history.
    pub fn reconstruct_history(&self, leaf_id: &str) -> Vec<Message> {
        let mut history: Vec<Message> = self
            .path(leaf_id)
            .into_iter()
            .flat_map(|node| node.messages.iter().cloned())
            .collect();
        if !history.is_empty() {
            history.remove(0);
        }
        history
    }

    /// Nodes from the root down to `node_id`, inclusive.
    ///
    /// Stops early at a missing parent, and after as many steps as the tree
    /// has nodes if a corrupt document contains a parent cycle.
    pub fn path(&self, node_id: &str) -> Vec<&TreeNode> {
        let mut path = Vec::new();
        let mut current = self.tree.get(node_id);
        while let Some(node) = current {
            if path.len() == self.tree.len() {
                warn!(node_id, "parent cycle detected while walking to root");
                break;
            }
            path.push(node);
            current = node.parent_id.as_deref().and_then(|id| self.tree.get(id));
        }
        path.reverse();
        path
    }

    /// Follow the last child repeatedly, starting at `node_id`.
    pub fn deepest_last_descendant(&self, node_id: &str) -> String {
        let mut current = node_id.to_string();
        let mut steps = 0;
        while let Some(last) = self.tree.get(&current).and_then(|n| n.children_ids.last()) {
            if !self.tree.contains_key(last) || steps == self.tree.len() {
                break;
            }
            current.clone_from(last);
            steps += 1;
        }
        current
    }

    /// Verify the parent/children invariants of the live tree.
    pub fn check_integrity(&self) -> Result<(), TreeError> {
        check_integrity(&self.tree)
    }

    /// Pretty JSON of the live tree, for export.
    pub fn export_json(&self) -> Result<String, TreeError> {
        serde_json::to_string_pretty(&self.tree).map_err(TreeError::Serialize)
    }

    fn node_mut(&mut self, node_id: &str) -> Result<&mut TreeNode, TreeError> {
        self.tree
            .get_mut(node_id)
            .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))
    }

    fn persist(&self) {
        let document = match serde_json::to_string(&self.tree) {
            Ok(document) => document,
            Err(e) => {
                error!(error = %e, "failed to serialize tree");
                return;
            }
        };
        if let Err(e) = self.storage.save_tree(&document) {
            error!(error = %e, "failed to persist tree");
        }
        if let Err(e) = self.storage.save_active(&self.active) {
            error!(error = %e, "failed to persist active node");
        }
    }
}

fn parse_document(document: &str) -> Result<Tree, TreeError> {
    let value: Value = serde_json::from_str(document).map_err(TreeError::Malformed)?;
    let tree = migrate_tree(value)?;
    if tree.contains_key(ROOT_ID) {
        Ok(tree)
    } else {
        Err(TreeError::MissingRoot)
    }
}

fn check_integrity(tree: &Tree) -> Result<(), TreeError> {
    let mut roots = 0;
    for (key, node) in tree {
        if &node.id != key {
            return Err(TreeError::Integrity(format!("node {key} carries id {}", node.id)));
        }
        match node.parent_id.as_deref() {
            None => roots += 1,
            Some(parent_id) => {
                let parent = tree.get(parent_id).ok_or_else(|| {
                    TreeError::Integrity(format!("node {key} has missing parent {parent_id}"))
                })?;
                if !parent.children_ids.iter().any(|child| child == key) {
                    return Err(TreeError::Integrity(format!(
                        "node {key} is not listed by its parent {parent_id}"
                    )));
                }
            }
        }
        for child in &node.children_ids {
            let listed = tree.get(child).and_then(|c| c.parent_id.as_deref());
            if listed != Some(key.as_str()) {
                return Err(TreeError::Integrity(format!(
                    "node {key} lists {child}, which does not point back"
                )));
            }
        }
    }
    if roots != 1 || !tree.get(ROOT_ID).is_some_and(TreeNode::is_root) {
        return Err(TreeError::Integrity(format!(
            "expected exactly one parentless node \"{ROOT_ID}\", found {roots}"
        )));
    }
    Ok(())
}
