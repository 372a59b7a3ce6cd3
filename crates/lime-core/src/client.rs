//! Client-side channel role.

use std::sync::Arc;
use std::time::Duration;

use lime_proto::{
    Authentication, Command, Envelope, Message, Node, Notification, Session, SessionCompression,
    SessionEncryption, SessionState,
};

use crate::channel::{ChannelBase, ChannelConfig};
use crate::error::ChannelError;
use crate::transport::Transport;

/// A channel playing the client role of the session handshake.
///
/// Each handshake step sends one session envelope and awaits the server's
/// reply; the channel state is adopted from received envelopes only, so the
/// server stays authoritative over the session lifecycle.
pub struct ClientChannel {
    base: ChannelBase,
}

impl ClientChannel {
    /// Create a client channel over an opened transport.
    pub fn new(transport: Arc<dyn Transport>, config: &ChannelConfig) -> Self {
        Self { base: ChannelBase::new(transport, config) }
    }

    /// The underlying channel.
    pub fn base(&self) -> &ChannelBase {
        &self.base
    }

    /// Request a new session. Requires the `New` state; returns the
    /// server's reply, which carries the next handshake step.
    pub async fn start_new_session(&self) -> Result<Session, ChannelError> {
        self.require_state(SessionState::New, "start_new_session")?;
        self.base.send_session(Session::new(SessionState::New)).await?;
        self.base.receive_session().await
    }

    /// Answer a negotiation offer with the selected options. Requires the
    /// `Negotiating` state; returns the server's confirmation.
    pub async fn negotiate_session(
        &self,
        compression: SessionCompression,
        encryption: SessionEncryption,
    ) -> Result<Session, ChannelError> {
        self.require_state(SessionState::Negotiating, "negotiate_session")?;
        let mut selection = Session::new(SessionState::Negotiating);
        selection.id = self.base.session_id();
        selection.compression = Some(compression);
        selection.encryption = Some(encryption);
        self.base.send_session(selection).await?;
        self.base.receive_session().await
    }

    /// Answer an authentication offer with credentials. Requires the
    /// `Authenticating` state; the reply is either another authentication
    /// round-trip, `Established` or `Failed`.
    pub async fn authenticate_session(
        &self,
        identity: &lime_proto::Identity,
        instance: Option<&str>,
        authentication: &Authentication,
    ) -> Result<Session, ChannelError> {
        self.require_state(SessionState::Authenticating, "authenticate_session")?;
        let mut reply = Session::new(SessionState::Authenticating);
        reply.id = self.base.session_id();
        reply.from = Some(Node {
            identity: identity.clone(),
            instance: instance.map(str::to_string),
        });
        reply.set_authentication(authentication);
        self.base.send_session(reply).await?;
        self.base.receive_session().await
    }

    /// Request graceful termination. Requires the `Established` state.
    pub async fn send_finishing_session(&self) -> Result<(), ChannelError> {
        self.require_state(SessionState::Established, "send_finishing_session")?;
        let mut finishing = Session::new(SessionState::Finishing);
        finishing.id = self.base.session_id();
        self.base.send_session(finishing).await
    }

    /// Await the terminal session envelope. `Finished` resolves
    /// successfully; `Failed` surfaces the peer's reason.
    ///
    /// Legal while `Established` and after a terminal envelope has been
    /// adopted: the reply may outrun the caller, in which case the
    /// buffered terminal session is returned.
    pub async fn receive_finished_session(&self) -> Result<Session, ChannelError> {
        let state = self.base.state();
        if state != SessionState::Established && !state.is_terminal() {
            return Err(ChannelError::InvalidState {
                operation: "receive_finished_session",
                state,
            });
        }
        let session = self.base.receive_session().await?;
        match session.state {
            SessionState::Failed => {
                let reason = session.reason.clone().unwrap_or_else(|| {
                    lime_proto::Reason::from_code(lime_proto::reason::codes::SESSION_ERROR)
                });
                Err(ChannelError::SessionFailed(reason))
            },
            _ => Ok(session),
        }
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

    /// The session id, once assigned by the server.
    pub fn session_id(&self) -> Option<String> {
        self.base.session_id()
    }

    /// The local node address assigned at establishment.
    pub fn local_node(&self) -> Option<Node> {
        self.base.local_node()
    }

    /// The server node address observed at establishment.
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

    /// See [`ChannelBase::process_command`].
    pub async fn process_command(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Command, ChannelError> {
        self.base.process_command(command, timeout).await
    }

    /// Send a raw envelope of any kind through the channel pipelines.
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<(), ChannelError> {
        match envelope {
            Envelope::Message(message) => self.send_message(message).await,
            Envelope::Notification(notification) => self.send_notification(notification).await,
            Envelope::Command(command) => self.send_command(command).await,
            Envelope::Session(session) => self.base.send_session(session).await,
        }
    }
}
