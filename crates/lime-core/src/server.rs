//! Server-side channel role.

use std::sync::Arc;
use std::time::Duration;

use lime_proto::{
    Authentication, AuthenticationScheme, Command, Message, Node, Notification, Reason, Session,
    SessionCompression, SessionEncryption, SessionState,
};

use crate::channel::{ChannelBase, ChannelConfig};
use crate::error::ChannelError;
use crate::transport::Transport;

/// A channel playing the server role of the session handshake.
///
/// The server assigns the session id up front, drives the state forward
/// explicitly around each envelope it sends, and is the only side that
/// announces `Established`, `Finished` and `Failed`.
pub struct ServerChannel {
    base: ChannelBase,
    local_node: Node,
}

impl ServerChannel {
    /// Create a server channel over an accepted transport.
    ///
    /// `session_id` is the identifier this server assigns to the session;
    /// `local_node` is the address the server announces as `from`.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &ChannelConfig,
        local_node: Node,
        session_id: String,
    ) -> Self {
        let base = ChannelBase::new(transport, config);
        base.set_session_id(session_id);
        base.set_local_node(local_node.clone());
        Self { base, local_node }
    }

    /// The underlying channel.
    pub fn base(&self) -> &ChannelBase {
        &self.base
    }

    /// The address this server announces as `from`.
    pub fn node(&self) -> &Node {
        &self.local_node
    }

    /// Await the client's session request. Requires the `New` state.
    pub async fn receive_new_session(&self) -> Result<Session, ChannelError> {
        self.require_state(SessionState::New, "receive_new_session")?;
        self.base.receive_session().await
    }

    /// Offer transport options and await the client's selection. Requires
    /// the `New` state and non-empty option lists.
    pub async fn negotiate_session(
        &self,
        compression_options: &[SessionCompression],
        encryption_options: &[SessionEncryption],
    ) -> Result<Session, ChannelError> {
        self.require_state(SessionState::New, "negotiate_session")?;
        if compression_options.is_empty() {
            return Err(ChannelError::InvalidOptions("no compression options to offer"));
        }
        if encryption_options.is_empty() {
            return Err(ChannelError::InvalidOptions("no encryption options to offer"));
        }
        self.base.set_state(SessionState::Negotiating).await;

        let mut offer = Session::new(SessionState::Negotiating);
        offer.id = self.base.session_id();
        offer.from = Some(self.local_node.clone());
        offer.compression_options = Some(compression_options.to_vec());
        offer.encryption_options = Some(encryption_options.to_vec());
        self.base.send_session(offer).await?;
        self.base.receive_session().await
    }

    /// Confirm the negotiated options back to the client. Requires the
    /// `Negotiating` state.
    pub async fn send_negotiating_confirmation(
        &self,
        compression: SessionCompression,
        encryption: SessionEncryption,
    ) -> Result<(), ChannelError> {
        self.require_state(SessionState::Negotiating, "send_negotiating_confirmation")?;
        let mut confirmation = Session::new(SessionState::Negotiating);
        confirmation.id = self.base.session_id();
        confirmation.from = Some(self.local_node.clone());
        confirmation.compression = Some(compression);
        confirmation.encryption = Some(encryption);
        self.base.send_session(confirmation).await
    }

    /// Offer authentication schemes and await the client's credentials.
    /// Requires the `New` or `Negotiating` state and a non-empty scheme
    /// list.
    pub async fn authenticate_session(
        &self,
        scheme_options: &[AuthenticationScheme],
    ) -> Result<Session, ChannelError> {
        let state = self.base.state();
        if !matches!(state, SessionState::New | SessionState::Negotiating) {
            return Err(ChannelError::InvalidState { operation: "authenticate_session", state });
        }
        if scheme_options.is_empty() {
            return Err(ChannelError::InvalidOptions("no authentication schemes to offer"));
        }
        self.base.set_state(SessionState::Authenticating).await;

        let mut offer = Session::new(SessionState::Authenticating);
        offer.id = self.base.session_id();
        offer.from = Some(self.local_node.clone());
        offer.scheme_options = Some(scheme_options.to_vec());
        self.base.send_session(offer).await?;
        self.base.receive_session().await
    }

    /// Send an authentication round-trip challenge and await the client's
    /// next answer. Requires the `Authenticating` state.
    pub async fn send_authentication_challenge(
        &self,
        challenge: &Authentication,
    ) -> Result<Session, ChannelError> {
        self.require_state(SessionState::Authenticating, "send_authentication_challenge")?;
        let mut round_trip = Session::new(SessionState::Authenticating);
        round_trip.id = self.base.session_id();
        round_trip.from = Some(self.local_node.clone());
        round_trip.set_authentication(challenge);
        self.base.send_session(round_trip).await?;
        self.base.receive_session().await
    }

    /// Establish the session, announcing the client's effective address.
    /// Requires a pre-`Established` handshake state.
    pub async fn send_established_session(&self, remote: Node) -> Result<(), ChannelError> {
        let state = self.base.state();
        if !matches!(
            state,
            SessionState::New | SessionState::Negotiating | SessionState::Authenticating
        ) {
            return Err(ChannelError::InvalidState { operation: "send_established_session", state });
        }

        let mut established = Session::new(SessionState::Established);
        established.id = self.base.session_id();
        established.from = Some(self.local_node.clone());
        established.to = Some(remote.clone());
        self.base.send_session(established).await?;

        self.base.set_remote_node(remote);
        self.base.set_state(SessionState::Established).await;
        Ok(())
    }

    /// Terminate the session gracefully and close the transport.
    ///
    /// Safe to call regardless of the current state; the envelope write is
    /// best-effort since the peer may already be gone.
    pub async fn send_finished_session(&self) {
        let mut finished = Session::new(SessionState::Finished);
        finished.id = self.base.session_id();
        finished.from = Some(self.local_node.clone());
        if let Err(error) = self.base.send_session(finished).await {
            tracing::debug!(%error, "finished session envelope not delivered");
        }
        self.base.set_state(SessionState::Finished).await;
        self.base.close();
    }

    /// Terminate the session with a failure reason and close the
    /// transport.
    ///
    /// Safe to call regardless of the current state; the envelope write is
    /// best-effort since the peer may already be gone.
    pub async fn send_failed_session(&self, reason: Reason) {
        let failed = Session::failed(self.base.session_id(), reason);
        if let Err(error) = self.base.send_session(failed).await {
            tracing::debug!(%error, "failed session envelope not delivered");
        }
        self.base.set_state(SessionState::Failed).await;
        self.base.close();
    }

    fn require_state(
        &self,
        expected: SessionState,
        operation: &'static str,
    ) -> Result<(), ChannelError> {
        let state = self.base.state();
        if state == expected {
            Ok(())
        } else {
            Err(ChannelError::InvalidState { operation, state })
        }
    }

    /// The channel's current session state.
    pub fn state(&self) -> SessionState {
        self.base.state()
    }

    /// The session id assigned at construction.
    pub fn session_id(&self) -> Option<String> {
        self.base.session_id()
    }

    /// The client node announced at establishment.
    pub fn remote_node(&self) -> Option<Node> {
        self.base.remote_node()
    }

    /// The transport this channel owns.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.base.transport()
    }

    /// Whether the channel is established and its transport usable.
    pub fn is_established(&self) -> bool {
        self.base.state() == SessionState::Established && !self.base.is_closed()
    }

    /// Close the transport. Idempotent.
    pub fn close(&self) {
        self.base.close();
    }

    /// See [`ChannelBase::send_message`].
    pub async fn send_message(&self, message: Message) -> Result<(), ChannelError> {
        self.base.send_message(message).await
    }

    /// See [`ChannelBase::send_notification`].
    pub async fn send_notification(&self, notification: Notification) -> Result<(), ChannelError> {
        self.base.send_notification(notification).await
    }

    /// See [`ChannelBase::send_command`].
    pub async fn send_command(&self, command: Command) -> Result<(), ChannelError> {
        self.base.send_command(command).await
    }

    /// See [`ChannelBase::receive_message`].
    pub async fn receive_message(&self) -> Result<Message, ChannelError> {
        self.base.receive_message().await
    }

    /// See [`ChannelBase::receive_notification`].
    pub async fn receive_notification(&self) -> Result<Notification, ChannelError> {
        self.base.receive_notification().await
    }

    /// See [`ChannelBase::receive_command`].
    pub async fn receive_command(&self) -> Result<Command, ChannelError> {
        self.base.receive_command().await
    }

    /// See [`ChannelBase::receive_session`].
    pub async fn receive_session(&self) -> Result<Session, ChannelError> {
        self.base.receive_session().await
    }

    /// See [`ChannelBase::process_command`].
    pub async fn process_command(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Command, ChannelError> {
        self.base.process_command(command, timeout).await
    }
}
