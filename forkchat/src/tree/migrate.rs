//! Schema migration for persisted and imported trees.
//!
//! Runs on the raw JSON document, before typing, because older documents
//! carry shapes the current [`TreeNode`](crate::models::TreeNode) cannot
//! express. Every step only fills in what is missing or null, so running the pass
//! again changes nothing.

use serde_json::{Map, Value};

use super::TreeError;
use crate::models::Tree;

/// Bring every node of `document` up to the current shape.
///
/// Non-object documents and non-object nodes are left as they are; typing
/// rejects them afterwards.
pub fn migrate_value(mut document: Value) -> Value {
    if let Some(nodes) = document.as_object_mut() {
        for (key, node) in nodes.iter_mut() {
            if let Some(node) = node.as_object_mut() {
                migrate_node(key, node);
            }
        }
    }
    document
}

/// Migrate `document` and type it as a [`Tree`].
pub fn migrate_tree(document: Value) -> Result<Tree, TreeError> {
    serde_json::from_value(migrate_value(document)).map_err(TreeError::Malformed)
}

fn migrate_node(key: &str, node: &mut Map<String, Value>) {
    if is_missing(node, "isCollapsed") {
        node.insert("isCollapsed".into(), Value::Bool(false));
    }

    // Legacy single-message nodes.
    if is_missing(node, "messages") {
        let messages = match node.remove("message") {
            Some(Value::Null) | None => Vec::new(),
            Some(message) => vec![message],
        };
        node.insert("messages".into(), Value::Array(messages));
    }

    if is_missing(node, "childrenIds") {
        node.insert("childrenIds".into(), Value::Array(Vec::new()));
    }
    if !node.contains_key("parentId") {
        node.insert("parentId".into(), Value::Null);
    }
    if is_missing(node, "id") {
        node.insert("id".into(), Value::String(key.to_string()));
    }
}

/// Absent keys and explicit nulls are treated alike.
fn is_missing(node: &Map<String, Value>, key: &str) -> bool {
    matches!(node.get(key), None | Some(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, ROOT_ID};
    use serde_json::json;

    fn legacy_document() -> Value {
        json!({
            "root": {
                "id": "root",
                "message": {"role": "assistant", "content": "welcome"},
                "parentId": null,
                "childrenIds": ["a"]
            },
            "a": {
                "id": "a",
                "message": {"role": "user", "content": "hi"},
                "parentId": "root",
                "childrenIds": [],
                "isCollapsed": true
            },
            "b": {"parentId": "a"}
        })
    }

    #[test]
    fn wraps_legacy_single_message() {
        let migrated = migrate_value(legacy_document());
        assert_eq!(
            migrated["root"]["messages"],
            json!([{"role": "assistant", "content": "welcome"}])
        );
        assert!(migrated["root"].get("message").is_none());
    }

    #[test]
    fn defaults_missing_fields() {
        let migrated = migrate_value(legacy_document());
        assert_eq!(migrated["root"]["isCollapsed"], false);
        assert_eq!(migrated["a"]["isCollapsed"], true);
        assert_eq!(migrated["b"]["messages"], json!([]));
        assert_eq!(migrated["b"]["childrenIds"], json!([]));
        assert_eq!(migrated["b"]["id"], "b");
    }

    #[test]
    fn keeps_current_messages_over_legacy_field() {
        let doc = json!({"root": {
            "id": "root",
            "messages": [{"role": "assistant", "content": "new"}],
            "message": {"role": "assistant", "content": "old"}
        }});
        let tree = migrate_tree(doc).unwrap();
        assert_eq!(tree[ROOT_ID].messages, vec![Message::assistant("new")]);
    }

    #[test]
    fn null_fields_count_as_missing() {
        let doc = json!({
            "root": {
                "id": "root",
                "messages": null,
                "parentId": null,
                "childrenIds": null,
                "isCollapsed": null
            },
            "a": {
                "id": "a",
                "message": {"role": "user", "content": "hi"},
                "messages": null,
                "parentId": "root",
                "childrenIds": []
            }
        });

        let tree = migrate_tree(doc).unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree[ROOT_ID].messages.is_empty());
        assert!(tree[ROOT_ID].children_ids.is_empty());
        assert!(!tree[ROOT_ID].is_collapsed);
        assert_eq!(tree["a"].messages, vec![Message::user("hi")]);
    }

    #[test]
    fn migration_is_idempotent() {
        let once = migrate_value(legacy_document());
        let twice = migrate_value(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn types_migrated_document() {
        let tree = migrate_tree(legacy_document()).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree["a"].messages, vec![Message::user("hi")]);
        assert!(tree["a"].is_collapsed);
        assert!(tree["b"].messages.is_empty());
    }

    #[test]
    fn rejects_nodes_that_cannot_be_typed() {
        let doc = json!({"root": {"messages": [{"role": "wizard", "content": "x"}]}});
        assert!(matches!(migrate_tree(doc), Err(TreeError::Malformed(_))));
    }
}
