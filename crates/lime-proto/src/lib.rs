//! Envelope data model for the LIME protocol.
//!
//! LIME traffic is made of four envelope kinds - [`Session`], [`Message`],
//! [`Notification`] and [`Command`] - serialized as JSON objects that are
//! discriminated structurally: the presence of a `state` field marks a
//! session, `event` a notification, `method` a command and `content` a
//! message. This crate is pure data: parsing, validation and wire
//! round-tripping, with no I/O and no async.
//!
//! # Components
//!
//! - [`envelope`]: the [`Envelope`] union and common field accessors
//! - [`node`]: `name@domain/instance` addressing ([`Node`], [`Identity`])
//! - [`session`]: session envelope, states and negotiation options
//! - [`document`]: media-type-tagged polymorphic content
//! - [`authentication`]: authentication schemes and payloads
//! - [`reason`]: protocol failure reasons and the reason code namespace

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authentication;
pub mod command;
pub mod document;
pub mod envelope;
pub mod error;
pub mod message;
pub mod node;
pub mod notification;
pub mod reason;
pub mod session;

pub use authentication::{Authentication, AuthenticationScheme};
pub use command::{Command, CommandMethod, CommandStatus};
pub use document::{Document, DocumentRegistry, MediaType};
pub use envelope::Envelope;
pub use error::EnvelopeError;
pub use message::Message;
pub use node::{DomainRole, Identity, Node};
pub use notification::{Notification, NotificationEvent};
pub use reason::Reason;
pub use session::{Session, SessionCompression, SessionEncryption, SessionState};
