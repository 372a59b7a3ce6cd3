//! The notification envelope: message lifecycle events.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::reason::Reason;

/// Events in a message's lifecycle.
///
/// For a given message id the events increase monotonically, except
/// `Failed`, which is terminal and may arrive at any point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationEvent {
    /// The server accepted the message.
    Accepted,
    /// The message content was validated.
    Validated,
    /// Delivery was authorized.
    Authorized,
    /// The message was dispatched towards its destination.
    Dispatched,
    /// The destination node received the message.
    Received,
    /// The destination application consumed the message.
    Consumed,
    /// Processing failed; terminal.
    Failed,
}

/// The notification envelope.
///
/// `id` refers to the message the event is about; `reason` is present iff
/// the event is `Failed`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Id of the message this notification refers to.
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
    /// The lifecycle event.
    pub event: NotificationEvent,
    /// Failure reason, present iff `event` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl Notification {
    /// Create a notification about message `id`.
    pub fn new(id: impl Into<String>, event: NotificationEvent) -> Self {
        Self {
            id: Some(id.into()),
            from: None,
            to: None,
            pp: None,
            metadata: HashMap::new(),
            event,
            reason: None,
        }
    }

    /// Create a `Failed` notification about message `id`.
    pub fn failed(id: impl Into<String>, reason: Reason) -> Self {
        let mut notification = Self::new(id, NotificationEvent::Failed);
        notification.reason = Some(reason);
        notification
    }
}
