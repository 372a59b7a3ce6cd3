//! Errors produced while parsing or decoding envelope data.

use thiserror::Error;

use crate::authentication::AuthenticationScheme;
use crate::document::MediaType;

/// Errors from envelope parsing, validation and document decoding.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// A node string did not match `name@domain` or `name@domain/instance`.
    #[error("invalid node '{0}': expected name@domain/instance")]
    InvalidNode(String),

    /// An identity string did not match `name@domain`.
    #[error("invalid identity '{0}': expected name@domain")]
    InvalidIdentity(String),

    /// A document carried a media type with no registered decoder.
    #[error("no decoder registered for media type '{0}'")]
    UnknownMediaType(MediaType),

    /// A registered decoder produced a value of an unexpected type.
    #[error("decoded document is not of the requested type")]
    DocumentType,

    /// An authentication payload did not match its declared scheme.
    #[error("unexpected authentication payload for scheme '{0}'")]
    InvalidAuthentication(AuthenticationScheme),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
