//! The command envelope: resource request/response.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{Document, MediaType};
use crate::node::Node;
use crate::reason::Reason;

/// The well-known ping resource URI.
pub const PING_URI: &str = "/ping";

/// Methods a command may request on a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandMethod {
    /// Read the resource.
    Get,
    /// Create or update the resource.
    Set,
    /// Remove the resource.
    Delete,
    /// Observe resource changes without acknowledgement.
    Observe,
    /// Subscribe to resource change events.
    Subscribe,
}

/// Processing status of a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandStatus {
    /// Request not yet processed (the implicit status of requests).
    Pending,
    /// The request succeeded.
    Success,
    /// The request failed; `reason` carries the cause.
    Failure,
}

/// The command envelope.
///
/// An absent `id` makes the command one-way: no response is expected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Envelope id correlating request and response; `None` = one-way.
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
    /// Requested method.
    pub method: CommandMethod,
    /// Resource locator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Media type of the resource document.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<MediaType>,
    /// Resource document value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,
    /// Processing status; absent on requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CommandStatus>,
    /// Failure reason, present iff `status` is `Failure`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl Command {
    /// Create a request with a fresh id.
    pub fn new(method: CommandMethod, uri: impl Into<String>) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            from: None,
            to: None,
            pp: None,
            metadata: HashMap::new(),
            method,
            uri: Some(uri.into()),
            resource_type: None,
            resource: None,
            status: None,
            reason: None,
        }
    }

    /// Create a `GET /ping` request.
    pub fn ping() -> Self {
        Self::new(CommandMethod::Get, PING_URI)
    }

    /// Whether this is a ping request awaiting a reply.
    pub fn is_ping_request(&self) -> bool {
        self.id.is_some()
            && self.status.is_none()
            && self.method == CommandMethod::Get
            && self.uri.as_deref().is_some_and(|uri| {
                uri == PING_URI || uri.ends_with(PING_URI)
            })
    }

    /// Whether this command is a response (carries a final status).
    pub fn is_response(&self) -> bool {
        matches!(self.status, Some(CommandStatus::Success | CommandStatus::Failure))
    }

    /// The resource as a document, when both wire fields are present.
    pub fn resource_document(&self) -> Option<Document> {
        let media_type = self.resource_type.clone()?;
        let value = self.resource.clone()?;
        Some(Document { media_type, value })
    }

    /// Attach a resource document, filling both wire fields.
    pub fn set_resource(&mut self, document: Document) {
        self.resource_type = Some(document.media_type);
        self.resource = Some(document.value);
    }

    /// Build a success response to this request, swapping the route.
    pub fn success_response(&self) -> Self {
        Self {
            id: self.id.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            pp: None,
            metadata: HashMap::new(),
            method: self.method,
            uri: None,
            resource_type: None,
            resource: None,
            status: Some(CommandStatus::Success),
            reason: None,
        }
    }

    /// Build a failure response to this request, swapping the route.
    pub fn failure_response(&self, reason: Reason) -> Self {
        let mut response = self.success_response();
        response.status = Some(CommandStatus::Failure);
        response.reason = Some(reason);
        response
    }
}
