//! Data models for conversation trees.

mod message;
mod node;
mod stats;

pub use message::{Message, MessageRole};
pub use node::{fresh_tree, Tree, TreeNode, ROOT_ID};
pub use stats::GenerationStats;
