//! Media-type-tagged polymorphic content.
//!
//! Message content and command resources are documents: a JSON value paired
//! with a media type. Typed payloads are resolved through an explicit
//! [`DocumentRegistry`] mapping media type to decode function; there is no
//! reflection-based type resolution.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// A MIME media type tag.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaType(pub String);

impl MediaType {
    /// Plain text content.
    pub const TEXT_PLAIN: &'static str = "text/plain";
    /// Untyped JSON content.
    pub const APPLICATION_JSON: &'static str = "application/json";
    /// The well-known ping resource type.
    pub const PING: &'static str = "application/vnd.lime.ping+json";

    /// Create a media type from a string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The media type as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for MediaType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A polymorphic document: a JSON value keyed by its media type.
///
/// Serializes as the sibling fields `type` and `content` of the containing
/// envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Media type identifying how to interpret the value.
    #[serde(rename = "type")]
    pub media_type: MediaType,
    /// The raw JSON value.
    #[serde(rename = "content")]
    pub value: serde_json::Value,
}

impl Document {
    /// Create a document from a media type and raw JSON value.
    pub fn new(media_type: impl Into<MediaType>, value: serde_json::Value) -> Self {
        Self { media_type: media_type.into(), value }
    }

    /// A `text/plain` document.
    pub fn text(content: impl Into<String>) -> Self {
        Self::new(MediaType::TEXT_PLAIN, serde_json::Value::String(content.into()))
    }

    /// An `application/json` document.
    pub fn json(value: serde_json::Value) -> Self {
        Self::new(MediaType::APPLICATION_JSON, value)
    }
}

type DecodeFn =
    Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn Any + Send>, EnvelopeError> + Send + Sync>;

/// Registry mapping media types to typed decode functions.
#[derive(Default)]
pub struct DocumentRegistry {
    decoders: HashMap<MediaType, DecodeFn>,
}

impl DocumentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` as the decoded form of `media_type`.
    pub fn register<T>(&mut self, media_type: impl Into<MediaType>)
    where
        T: DeserializeOwned + Any + Send,
    {
        self.decoders.insert(
            media_type.into(),
            Box::new(|value| {
                let decoded: T = serde_json::from_value(value.clone())?;
                Ok(Box::new(decoded))
            }),
        );
    }

    /// Decode a document through its registered decoder.
    pub fn decode(&self, document: &Document) -> Result<Box<dyn Any + Send>, EnvelopeError> {
        let decode = self
            .decoders
            .get(&document.media_type)
            .ok_or_else(|| EnvelopeError::UnknownMediaType(document.media_type.clone()))?;
        decode(&document.value)
    }

    /// Decode a document and downcast it to `T`.
    pub fn decode_as<T: Any>(&self, document: &Document) -> Result<T, EnvelopeError> {
        self.decode(document)?
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| EnvelopeError::DocumentType)
    }
}
