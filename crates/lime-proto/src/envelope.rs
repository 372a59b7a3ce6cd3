//! The envelope union and wire round-tripping.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::Command;
use crate::error::EnvelopeError;
use crate::message::Message;
use crate::node::Node;
use crate::notification::Notification;
use crate::session::Session;

/// Any of the four envelope kinds.
///
/// Wire discrimination is structural: `state` marks a session, `event` a
/// notification, `method` a command and `content` a message. The untagged
/// representation relies on those fields being mandatory in their kind,
/// with `Message` last because `content` alone is its discriminator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    /// Session handshake/termination envelope.
    Session(Session),
    /// Message lifecycle notification.
    Notification(Notification),
    /// Resource request/response.
    Command(Command),
    /// Content delivery.
    Message(Message),
}

impl Envelope {
    /// Generate a fresh envelope id.
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// The envelope id, if present.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Session(s) => s.id.as_deref(),
            Self::Notification(n) => n.id.as_deref(),
            Self::Command(c) => c.id.as_deref(),
            Self::Message(m) => m.id.as_deref(),
        }
    }

    /// The originator address, if present.
    pub fn from(&self) -> Option<&Node> {
        match self {
            Self::Session(s) => s.from.as_ref(),
            Self::Notification(n) => n.from.as_ref(),
            Self::Command(c) => c.from.as_ref(),
            Self::Message(m) => m.from.as_ref(),
        }
    }

    /// The destination address, if present.
    pub fn to(&self) -> Option<&Node> {
        match self {
            Self::Session(s) => s.to.as_ref(),
            Self::Notification(n) => n.to.as_ref(),
            Self::Command(c) => c.to.as_ref(),
            Self::Message(m) => m.to.as_ref(),
        }
    }

    /// The kind name, for logging and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Session(_) => "session",
            Self::Notification(_) => "notification",
            Self::Command(_) => "command",
            Self::Message(_) => "message",
        }
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the JSON wire form.
    pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl From<Session> for Envelope {
    fn from(session: Session) -> Self {
        Self::Session(session)
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

impl From<Notification> for Envelope {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

impl From<Command> for Envelope {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}
