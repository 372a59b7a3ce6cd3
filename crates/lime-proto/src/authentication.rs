//! Authentication schemes and payloads.
//!
//! A session's authentication is split on the wire into a `scheme` tag and
//! a scheme-specific `authentication` object. [`Authentication`] models the
//! pair as one tagged value; [`Authentication::to_wire`] and
//! [`Authentication::from_wire`] convert to and from the two wire fields.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::EnvelopeError;

/// Authentication scheme identifiers offered and selected during the
/// handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthenticationScheme {
    /// Anonymous access.
    Guest,
    /// Password authentication.
    Plain,
    /// The transport layer authenticates the identity (e.g. mutual TLS).
    Transport,
    /// Pre-shared key authentication.
    Key,
    /// Token issued by a third party.
    External,
}

impl fmt::Display for AuthenticationScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Guest => "guest",
            Self::Plain => "plain",
            Self::Transport => "transport",
            Self::Key => "key",
            Self::External => "external",
        };
        f.write_str(name)
    }
}

/// An authentication payload tagged by its scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Authentication {
    /// Anonymous access; empty payload.
    Guest,
    /// Password authentication.
    Plain {
        /// Base64-encoded password.
        password: String,
    },
    /// Identity vouched for by the transport layer.
    Transport,
    /// Pre-shared key authentication.
    Key {
        /// Base64-encoded key.
        key: String,
    },
    /// Third-party token authentication.
    External {
        /// Opaque token.
        token: String,
        /// Token issuer.
        issuer: String,
    },
}

impl Authentication {
    /// The scheme tag for this payload.
    pub fn scheme(&self) -> AuthenticationScheme {
        match self {
            Self::Guest => AuthenticationScheme::Guest,
            Self::Plain { .. } => AuthenticationScheme::Plain,
            Self::Transport => AuthenticationScheme::Transport,
            Self::Key { .. } => AuthenticationScheme::Key,
            Self::External { .. } => AuthenticationScheme::External,
        }
    }

    /// Split into the `scheme` and `authentication` wire fields.
    pub fn to_wire(&self) -> (AuthenticationScheme, serde_json::Value) {
        let value = match self {
            Self::Guest | Self::Transport => json!({}),
            Self::Plain { password } => json!({ "password": password }),
            Self::Key { key } => json!({ "key": key }),
            Self::External { token, issuer } => json!({ "token": token, "issuer": issuer }),
        };
        (self.scheme(), value)
    }

    /// Reassemble from the `scheme` and `authentication` wire fields.
    pub fn from_wire(
        scheme: AuthenticationScheme,
        value: &serde_json::Value,
    ) -> Result<Self, EnvelopeError> {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .ok_or(EnvelopeError::InvalidAuthentication(scheme))
        };
        match scheme {
            AuthenticationScheme::Guest => Ok(Self::Guest),
            AuthenticationScheme::Transport => Ok(Self::Transport),
            AuthenticationScheme::Plain => Ok(Self::Plain { password: field("password")? }),
            AuthenticationScheme::Key => Ok(Self::Key { key: field("key")? }),
            AuthenticationScheme::External => {
                Ok(Self::External { token: field("token")?, issuer: field("issuer")? })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn scheme_wire_names() {
        let tag = serde_json::to_value(AuthenticationScheme::Guest).unwrap();
        assert_eq!(tag, serde_json::Value::String("guest".to_string()));
        let tag = serde_json::to_value(AuthenticationScheme::External).unwrap();
        assert_eq!(tag, serde_json::Value::String("external".to_string()));
    }

    #[test]
    fn plain_round_trips_through_wire_fields() {
        let auth = Authentication::Plain { password: "cGFzcw==".to_string() };
        let (scheme, value) = auth.to_wire();
        assert_eq!(scheme, AuthenticationScheme::Plain);
        assert_eq!(Authentication::from_wire(scheme, &value).unwrap(), auth);
    }

    #[test]
    fn payload_mismatch_is_rejected() {
        let result = Authentication::from_wire(AuthenticationScheme::Plain, &json!({}));
        assert!(matches!(result, Err(EnvelopeError::InvalidAuthentication(_))));
    }
}
