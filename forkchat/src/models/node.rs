//! Tree node model: one branch point holding a run of messages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Message;

/// Id of the single parentless node.
pub const ROOT_ID: &str = "root";

const WELCOME_MESSAGE: &str = "Hello! I'm your AI assistant. Send a message to start our \
conversation. You can branch from any message to explore a different path.";

/// The whole conversation arena, keyed by node id.
///
/// Traversal order comes from `children_ids`, never from the map. The map is
/// ordered only so that serialized trees are deterministic.
pub type Tree = BTreeMap<String, TreeNode>;

/// A node in the conversation tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    /// Unique identifier, equal to the node's key in the tree.
    pub id: String,
    /// Messages in this node, in order.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Parent node, `None` only for the root.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Children in creation order.
    #[serde(default)]
    pub children_ids: Vec<String>,
    /// Optional display label. An empty string is an explicit name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// View-state flag for tree renderers.
    #[serde(default)]
    pub is_collapsed: bool,
}

impl TreeNode {
    /// The synthetic root carrying the welcome message.
    pub fn root() -> Self {
        Self {
            id: ROOT_ID.to_string(),
            messages: vec![Message::assistant(WELCOME_MESSAGE)],
            parent_id: None,
            children_ids: Vec::new(),
            name: None,
            is_collapsed: false,
        }
    }

    /// A fresh leaf under `parent_id` holding a single message.
    pub fn leaf(id: String, parent_id: String, message: Message) -> Self {
        Self {
            id,
            messages: vec![message],
            parent_id: Some(parent_id),
            children_ids: Vec::new(),
            name: None,
            is_collapsed: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children_ids.is_empty()
    }
}

/// A tree containing only a fresh root.
pub fn fresh_tree() -> Tree {
    let mut tree = Tree::new();
    tree.insert(ROOT_ID.to_string(), TreeNode::root());
    tree
}
