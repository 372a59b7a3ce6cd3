//! The message envelope: content delivery between nodes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::Document;
use crate::node::Node;

/// The message envelope.
///
/// An absent `id` marks the message as fire-and-forget: no notification
/// about its lifecycle is expected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Envelope id; `None` means no notifications are expected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Originator address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Node>,
    /// Destination address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Node>,
    /// Delegation (per-hop) address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pp: Option<Node>,
    /// Extension metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// The content document (`type` + `content` on the wire).
    #[serde(flatten)]
    pub content: Document,
}

impl Message {
    /// Create a message with a fresh id.
    pub fn new(to: Node, content: Document) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            from: None,
            to: Some(to),
            pp: None,
            metadata: HashMap::new(),
            content,
        }
    }

    /// Create a fire-and-forget message (no id, so no notifications).
    pub fn fire_and_forget(to: Node, content: Document) -> Self {
        Self { id: None, ..Self::new(to, content) }
    }
}
