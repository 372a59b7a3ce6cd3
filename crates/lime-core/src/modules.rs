//! Envelope interceptor chains.
//!
//! Each envelope kind flowing through a channel passes an ordered list of
//! modules. A module may observe, transform or drop the envelope, and is
//! told about session state changes so it can arm or disarm itself.

use async_trait::async_trait;

use lime_proto::SessionState;

/// An interceptor for one envelope kind.
///
/// Modules run in registration order. Returning `None` from `on_sending`
/// or `on_receiving` drops the envelope, short-circuiting the rest of the
/// chain.
#[async_trait]
pub trait ChannelModule<T: Send + 'static>: Send + Sync {
    /// Called when the channel's session state changes.
    async fn on_state_changed(&self, state: SessionState) {
        let _ = state;
    }

    /// Called for each envelope before it is written to the transport.
    async fn on_sending(&self, envelope: T) -> Option<T> {
        Some(envelope)
    }

    /// Called for each envelope before it is delivered to the receiver.
    async fn on_receiving(&self, envelope: T) -> Option<T> {
        Some(envelope)
    }
}
