//! Channel error taxonomy.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use lime_proto::{Reason, SessionState};

/// Errors surfaced by channel operations.
///
/// The taxonomy separates programming-contract violations (`InvalidState`,
/// `AlreadyListening`), protocol-level failures (`SessionFailed`),
/// transport faults (`Transport`) and deadline expiry (`Timeout`), so
/// resilient wrappers can tell "must propagate" from "may retry" and
/// "caller gave up" from "channel is broken".
#[derive(Clone, Debug, Error)]
pub enum ChannelError {
    /// The operation is not permitted in the channel's current state.
    #[error("operation '{operation}' is invalid in session state {state:?}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The channel state at the time.
        state: SessionState,
    },

    /// A second concurrent receive was attempted for the same envelope
    /// kind.
    #[error("there is already an active {0} listener")]
    AlreadyListening(&'static str),

    /// Handshake options were empty or unsupported by the transport.
    #[error("invalid handshake options: {0}")]
    InvalidOptions(&'static str),

    /// The transport failed while sending or receiving.
    #[error("transport failure")]
    Transport(#[source] Arc<io::Error>),

    /// The peer terminated the session with a failure reason.
    #[error("session failed: {0}")]
    SessionFailed(Reason),

    /// A deadline-bound operation did not complete in time.
    #[error("'{0}' timed out")]
    Timeout(&'static str),

    /// The channel was closed and can no longer be used.
    #[error("the channel is closed")]
    Closed,

    /// A received envelope could not be interpreted.
    #[error("invalid envelope: {0}")]
    Envelope(String),
}

impl From<io::Error> for ChannelError {
    fn from(error: io::Error) -> Self {
        Self::Transport(Arc::new(error))
    }
}
