//! Node ids and short display names.
//!
//! Ids look like `node-1718000000000-k3j9x0a`: a millisecond timestamp plus a
//! random base36 suffix. Display names are the first few characters of a
//! chunk of text, used to label branches created from pasted content.

use chrono::Utc;
use rand::prelude::IndexedRandom;

use crate::models::TreeNode;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 7;

/// Characters kept by [`display_name`] before the ellipsis.
pub const DISPLAY_NAME_LEN: usize = 35;

/// Generate a node id that `is_taken` does not already claim.
pub fn generate_node_id(is_taken: impl Fn(&str) -> bool) -> String {
    let mut rng = rand::rng();
    loop {
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| char::from(*BASE36.choose(&mut rng).unwrap_or(&b'0')))
            .collect();
        let id = format!("node-{}-{suffix}", Utc::now().timestamp_millis());
        if !is_taken(&id) {
            return id;
        }
    }
}

/// Short label derived from a chunk of text.
pub fn display_name(text: &str) -> String {
    let text = text.trim();
    let mut name: String = text.chars().take(DISPLAY_NAME_LEN).collect();
    if text.chars().count() > DISPLAY_NAME_LEN {
        name.push_str("...");
    }
    name
}

/// Label for listing a node: its name, else a snippet of its first message.
pub fn node_label(node: &TreeNode) -> String {
    if let Some(name) = &node.name {
        return name.clone();
    }
    node.messages.first().map_or_else(
        || "(empty)".to_string(),
        |m| display_name(&m.content.replace(['\n', '\r'], " ")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, ROOT_ID};

    #[test]
    fn node_id_has_timestamp_and_suffix() {
        let id = generate_node_id(|_| false);
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "node");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), SUFFIX_LEN);
        assert!(parts[2].bytes().all(|b| BASE36.contains(&b)));
    }

    #[test]
    fn node_id_skips_taken_ids() {
        let first = generate_node_id(|_| false);
        let second = generate_node_id(|id| id == first);
        assert_ne!(first, second);
    }

    #[test]
    fn short_text_is_kept_whole() {
        assert_eq!(display_name("  hello world  "), "hello world");
    }

    #[test]
    fn long_text_is_truncated_with_ellipsis() {
        let text = "a".repeat(40);
        let name = display_name(&text);
        assert_eq!(name, format!("{}...", "a".repeat(DISPLAY_NAME_LEN)));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let text = "é".repeat(36);
        assert_eq!(display_name(&text).chars().count(), DISPLAY_NAME_LEN + 3);
    }

    #[test]
    fn label_prefers_explicit_name() {
        let mut node = TreeNode::leaf("n".into(), ROOT_ID.into(), Message::user("line one\nline two"));
        assert_eq!(node_label(&node), "line one line two");
        node.name = Some(String::new());
        assert_eq!(node_label(&node), "");
    }
}
