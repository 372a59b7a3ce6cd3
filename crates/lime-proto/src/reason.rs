//! Failure reasons and the protocol reason code namespace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A failure reason attached to Failed sessions, Failed notifications and
/// Failure command responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    /// Numeric code from the [`codes`] namespace, passed through verbatim.
    pub code: i32,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Reason {
    /// Create a reason with a description.
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self { code, description: Some(description.into()) }
    }

    /// Create a reason carrying only a code.
    pub fn from_code(code: i32) -> Self {
        Self { code, description: None }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{} (code {})", description, self.code),
            None => write!(f, "code {}", self.code),
        }
    }
}

/// Protocol reason codes.
///
/// The channel core treats these as opaque integers; codes supplied by
/// authenticator or registration callbacks are preserved verbatim.
pub mod codes {
    /// Unclassified error.
    pub const GENERAL_ERROR: i32 = 1;
    /// Unclassified session-level error.
    pub const SESSION_ERROR: i32 = 11;
    /// Session negotiation timed out.
    pub const SESSION_NEGOTIATION_TIMEOUT: i32 = 21;
    /// Peer selected compression or encryption outside the offered options.
    pub const SESSION_NEGOTIATION_INVALID_OPTIONS: i32 = 22;
    /// Session authentication timed out.
    pub const SESSION_AUTHENTICATION_TIMEOUT: i32 = 31;
    /// Authentication was rejected.
    pub const SESSION_AUTHENTICATION_FAILED: i32 = 32;
    /// The node address could not be registered.
    pub const SESSION_REGISTRATION_ERROR: i32 = 41;
    /// An envelope could not be dispatched.
    pub const DISPATCH_ERROR: i32 = 61;
}
