//! The session envelope: handshake, negotiation and authentication state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::authentication::{Authentication, AuthenticationScheme};
use crate::error::EnvelopeError;
use crate::node::Node;
use crate::reason::Reason;

/// Session lifecycle states.
///
/// The state only moves forward through
/// `New -> Negotiating -> Authenticating -> Established -> Finishing ->
/// Finished` (intermediate states may be skipped), or to `Failed` from any
/// non-terminal state. `New` is never re-entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Session requested, nothing negotiated yet.
    New,
    /// Compression and encryption are being negotiated.
    Negotiating,
    /// Identity authentication round-trips are in progress.
    Authenticating,
    /// The session is active and envelopes may flow.
    Established,
    /// Graceful termination was requested.
    Finishing,
    /// The session ended gracefully.
    Finished,
    /// The session ended with an error.
    Failed,
}

impl SessionState {
    fn order(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Negotiating => 1,
            Self::Authenticating => 2,
            Self::Established => 3,
            Self::Finishing => 4,
            Self::Finished => 5,
            Self::Failed => 6,
        }
    }

    /// Whether this state ends the session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Whether a session envelope may move the channel from `self` to
    /// `next`.
    ///
    /// Re-announcing the current state is not a transition but is legal on
    /// the wire (e.g. negotiation offer and selection both carry
    /// `Negotiating`); callers treat `next == self` separately.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        if next == Self::New {
            return false;
        }
        next.order() > self.order()
    }
}

/// Compression options negotiated for the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionCompression {
    /// No compression.
    None,
    /// GZip stream compression.
    Gzip,
}

/// Encryption options negotiated for the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionEncryption {
    /// Cleartext.
    None,
    /// TLS encryption.
    Tls,
}

/// The session envelope.
///
/// Offer fields (`*_options`) appear only on offering envelopes; selection
/// fields (`compression`, `encryption`, `scheme`, `authentication`) only on
/// selection envelopes. `reason` is present iff the state is `Failed`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Envelope id; the session id once the server has assigned one.
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
    /// The state this envelope announces.
    pub state: SessionState,
    /// Failure reason, present iff `state` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    /// Offered encryption options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_options: Option<Vec<SessionEncryption>>,
    /// Selected encryption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<SessionEncryption>,
    /// Offered compression options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_options: Option<Vec<SessionCompression>>,
    /// Selected compression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<SessionCompression>,
    /// Offered authentication schemes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme_options: Option<Vec<AuthenticationScheme>>,
    /// Selected authentication scheme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<AuthenticationScheme>,
    /// Scheme-specific authentication payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<serde_json::Value>,
}

impl Session {
    /// Create a bare session envelope announcing `state`.
    pub fn new(state: SessionState) -> Self {
        Self {
            id: None,
            from: None,
            to: None,
            pp: None,
            metadata: HashMap::new(),
            state,
            reason: None,
            encryption_options: None,
            encryption: None,
            compression_options: None,
            compression: None,
            scheme_options: None,
            scheme: None,
            authentication: None,
        }
    }

    /// Create a `Failed` session carrying `reason`.
    pub fn failed(id: Option<String>, reason: Reason) -> Self {
        let mut session = Self::new(SessionState::Failed);
        session.id = id;
        session.reason = Some(reason);
        session
    }

    /// Attach an authentication payload, filling both wire fields.
    pub fn set_authentication(&mut self, authentication: &Authentication) {
        let (scheme, value) = authentication.to_wire();
        self.scheme = Some(scheme);
        self.authentication = Some(value);
    }

    /// Reassemble the authentication payload from the wire fields.
    pub fn authentication(&self) -> Option<Result<Authentication, EnvelopeError>> {
        let scheme = self.scheme?;
        let value = self.authentication.as_ref()?;
        Some(Authentication::from_wire(scheme, value))
    }
}
