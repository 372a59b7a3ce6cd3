//! Connection acceptance and per-session serving.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use lime_core::{
    AcceptGuestsAuthenticator, AuthenticationOutcome, ChannelConfig, ChannelError, NodeRegistrar,
    ServerAuthenticator, ServerChannel, ServerEstablishment, Transport, TransportListener,
    establish_server,
};
use lime_proto::reason::codes;
use lime_proto::{
    Authentication, AuthenticationScheme, Command, DomainRole, Identity, Message, Node,
    Notification, Reason, SessionCompression, SessionEncryption, SessionState,
};

use crate::registry::NodeRegistry;

/// Receives the traffic of established sessions.
///
/// Implementations reply or forward through the channels themselves;
/// returned errors are logged and do not end the session.
#[async_trait]
pub trait EnvelopeConsumer: Send + Sync {
    /// A message arrived on `channel`.
    async fn on_message(
        &self,
        channel: &Arc<ServerChannel>,
        message: Message,
    ) -> Result<(), ChannelError>;

    /// A notification arrived on `channel`.
    async fn on_notification(
        &self,
        channel: &Arc<ServerChannel>,
        notification: Notification,
    ) -> Result<(), ChannelError>;

    /// A command request arrived on `channel`. Ping requests never get
    /// here; the channel answers them itself.
    async fn on_command(
        &self,
        channel: &Arc<ServerChannel>,
        command: Command,
    ) -> Result<(), ChannelError>;
}

/// Routes envelopes between the registered nodes of one server.
///
/// Messages to unknown destinations are answered with a failed
/// notification when the sender asked for one; commands the router does
/// not understand get a failure response.
pub struct RouterConsumer {
    registry: Arc<NodeRegistry>,
}

impl RouterConsumer {
    /// Create a router over `registry`.
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    async fn notify_undeliverable(
        &self,
        channel: &Arc<ServerChannel>,
        id: Option<&str>,
    ) -> Result<(), ChannelError> {
        if let Some(id) = id {
            let notification = Notification::failed(
                id,
                Reason::new(codes::DISPATCH_ERROR, "the destination is not available"),
            );
            channel.send_notification(notification).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EnvelopeConsumer for RouterConsumer {
    async fn on_message(
        &self,
        channel: &Arc<ServerChannel>,
        mut message: Message,
    ) -> Result<(), ChannelError> {
        let Some(to) = message.to.clone() else {
            return self.notify_undeliverable(channel, message.id.as_deref()).await;
        };
        // Stamp the originator so the destination can reply.
        if message.from.is_none() {
            message.from = channel.remote_node();
        }
        match self.registry.get(&to) {
            Some(destination) => {
                let id = message.id.clone();
                if destination.send_message(message).await.is_err() {
                    self.notify_undeliverable(channel, id.as_deref()).await?;
                }
                Ok(())
            },
            None => self.notify_undeliverable(channel, message.id.as_deref()).await,
        }
    }

    async fn on_notification(
        &self,
        channel: &Arc<ServerChannel>,
        mut notification: Notification,
    ) -> Result<(), ChannelError> {
        let Some(to) = notification.to.clone() else {
            return Ok(());
        };
        if notification.from.is_none() {
            notification.from = channel.remote_node();
        }
        if let Some(destination) = self.registry.get(&to) {
            let _ = destination.send_notification(notification).await;
        }
        Ok(())
    }

    async fn on_command(
        &self,
        channel: &Arc<ServerChannel>,
        command: Command,
    ) -> Result<(), ChannelError> {
        if command.id.is_some() && !command.is_response() {
            let response = command.failure_response(Reason::new(
                codes::DISPATCH_ERROR,
                "the resource is not supported",
            ));
            channel.send_command(response).await?;
        }
        Ok(())
    }
}

struct ServerContext {
    node: Node,
    config: ChannelConfig,
    compression_options: Vec<SessionCompression>,
    encryption_options: Vec<SessionEncryption>,
    scheme_options: Vec<AuthenticationScheme>,
    authenticator: Arc<dyn ServerAuthenticator>,
    consumer: Arc<dyn EnvelopeConsumer>,
    registry: Arc<NodeRegistry>,
}

struct SharedAuthenticator(Arc<dyn ServerAuthenticator>);

#[async_trait]
impl ServerAuthenticator for SharedAuthenticator {
    async fn authenticate(
        &self,
        identity: &Identity,
        authentication: &Authentication,
        transport_role: Option<DomainRole>,
    ) -> AuthenticationOutcome {
        self.0.authenticate(identity, authentication, transport_role).await
    }
}

/// Claims the candidate address in the registry on behalf of one channel.
struct RegistryClaim {
    registry: Arc<NodeRegistry>,
    channel: Arc<ServerChannel>,
}

#[async_trait]
impl NodeRegistrar for RegistryClaim {
    async fn register(&self, candidate: Node) -> Option<Node> {
        self.registry.try_register(&candidate, &self.channel)
    }

    async fn unregister(&self, node: Node) {
        self.registry.unregister(&node, &self.channel);
    }
}

/// Configures and starts a [`Server`].
pub struct ServerBuilder {
    node: Node,
    config: ChannelConfig,
    compression_options: Vec<SessionCompression>,
    encryption_options: Vec<SessionEncryption>,
    scheme_options: Vec<AuthenticationScheme>,
    authenticator: Arc<dyn ServerAuthenticator>,
    consumer: Option<Arc<dyn EnvelopeConsumer>>,
    max_active_sessions: Option<usize>,
    accept_backlog: usize,
}

impl ServerBuilder {
    /// Create a builder for a server at `node`, defaulting to cleartext
    /// transport, guest authentication and envelope routing between
    /// registered nodes.
    pub fn new(node: Node) -> Self {
        Self {
            node,
            config: ChannelConfig::default(),
            compression_options: vec![SessionCompression::None],
            encryption_options: vec![SessionEncryption::None],
            scheme_options: vec![AuthenticationScheme::Guest],
            authenticator: Arc::new(AcceptGuestsAuthenticator),
            consumer: None,
            max_active_sessions: None,
            accept_backlog: 32,
        }
    }

    /// Replace the channel configuration applied to accepted sessions.
    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the transport options offered during negotiation.
    pub fn with_transport_options(
        mut self,
        compression: Vec<SessionCompression>,
        encryption: Vec<SessionEncryption>,
    ) -> Self {
        self.compression_options = compression;
        self.encryption_options = encryption;
        self
    }

    /// Set the authentication schemes offered and their verifier.
    pub fn with_authentication(
        mut self,
        schemes: Vec<AuthenticationScheme>,
        authenticator: Arc<dyn ServerAuthenticator>,
    ) -> Self {
        self.scheme_options = schemes;
        self.authenticator = authenticator;
        self
    }

    /// Replace the consumer fed with established sessions' traffic.
    pub fn with_consumer(mut self, consumer: Arc<dyn EnvelopeConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Bound the number of concurrently established sessions; further
    /// connections wait in the accept backlog.
    pub fn with_max_active_sessions(mut self, limit: usize) -> Self {
        self.max_active_sessions = Some(limit.max(1));
        self
    }

    /// Start accepting connections from `listener`.
    pub async fn start(self, listener: Arc<dyn TransportListener>) -> Result<Server, ChannelError> {
        if self.compression_options.is_empty()
            || self.encryption_options.is_empty()
            || self.scheme_options.is_empty()
        {
            return Err(ChannelError::InvalidOptions("handshake option lists must be non-empty"));
        }

        let registry = Arc::new(NodeRegistry::new());
        let consumer = self
            .consumer
            .unwrap_or_else(|| Arc::new(RouterConsumer::new(registry.clone())));
        let context = Arc::new(ServerContext {
            node: self.node,
            config: self.config,
            compression_options: self.compression_options,
            encryption_options: self.encryption_options,
            scheme_options: self.scheme_options,
            authenticator: self.authenticator,
            consumer,
            registry,
        });

        listener.start().await?;
        tracing::info!(node = %context.node, "server listening");

        let (accept_tx, accept_rx) = mpsc::channel(self.accept_backlog.max(1));
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_accept(listener.clone(), accept_tx)));
        let limiter = self
            .max_active_sessions
            .map(|limit| Arc::new(Semaphore::new(limit)));
        tasks.push(tokio::spawn(run_dispatch(context.clone(), accept_rx, limiter)));

        Ok(Server { context, listener, tasks })
    }
}

/// An accepting LIME server.
pub struct Server {
    context: Arc<ServerContext>,
    listener: Arc<dyn TransportListener>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// The registry of currently established nodes.
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.context.registry
    }

    /// The address this server announces.
    pub fn node(&self) -> &Node {
        &self.context.node
    }

    /// Stop accepting new connections. Established sessions keep running
    /// until their clients finish.
    pub fn stop(&self) {
        self.listener.stop();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.listener.stop();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn run_accept(
    listener: Arc<dyn TransportListener>,
    accept_tx: mpsc::Sender<Arc<dyn Transport>>,
) {
    loop {
        match listener.accept().await {
            Ok(transport) => {
                if accept_tx.send(transport).await.is_err() {
                    break;
                }
            },
            Err(error) => {
                tracing::debug!(%error, "listener stopped accepting");
                break;
            },
        }
    }
}

async fn run_dispatch(
    context: Arc<ServerContext>,
    mut accept_rx: mpsc::Receiver<Arc<dyn Transport>>,
    limiter: Option<Arc<Semaphore>>,
) {
    while let Some(transport) = accept_rx.recv().await {
        let permit = match &limiter {
            Some(semaphore) => match semaphore.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            None => None,
        };
        let context = context.clone();
        tokio::spawn(async move {
            let _permit = permit;
            serve_connection(context, transport).await;
        });
    }
}

async fn serve_connection(context: Arc<ServerContext>, transport: Arc<dyn Transport>) {
    let session_id = Uuid::new_v4().to_string();
    let channel = Arc::new(ServerChannel::new(
        transport,
        &context.config,
        context.node.clone(),
        session_id.clone(),
    ));
    let options = ServerEstablishment {
        compression_options: context.compression_options.clone(),
        encryption_options: context.encryption_options.clone(),
        scheme_options: context.scheme_options.clone(),
        authenticator: Box::new(SharedAuthenticator(context.authenticator.clone())),
        registrar: Box::new(RegistryClaim {
            registry: context.registry.clone(),
            channel: channel.clone(),
        }),
    };

    let node = match establish_server(&channel, &options).await {
        Ok(Some(node)) => node,
        Ok(None) => return,
        Err(error) => {
            tracing::warn!(session_id, %error, "session establishment failed");
            channel.close();
            return;
        },
    };
    tracing::info!(session_id, %node, "session established");

    listen(&context, &channel).await;

    context.registry.unregister(&node, &channel);
    channel.close();
    tracing::info!(session_id, %node, "session ended");
}

/// Pump one established session's traffic into the consumer until the
/// session ends.
///
/// Each envelope kind feeds the consumer from its own task, so a slow
/// callback for one kind does not hold up the others.
async fn listen(context: &Arc<ServerContext>, channel: &Arc<ServerChannel>) {
    let mut pumps = Vec::new();
    {
        let context = context.clone();
        let channel = channel.clone();
        pumps.push(tokio::spawn(async move {
            while let Ok(message) = channel.receive_message().await {
                if let Err(error) = context.consumer.on_message(&channel, message).await {
                    tracing::warn!(%error, "message consumer failed");
                }
            }
        }));
    }
    {
        let context = context.clone();
        let channel = channel.clone();
        pumps.push(tokio::spawn(async move {
            while let Ok(notification) = channel.receive_notification().await {
                if let Err(error) = context.consumer.on_notification(&channel, notification).await
                {
                    tracing::warn!(%error, "notification consumer failed");
                }
            }
        }));
    }
    {
        let context = context.clone();
        let channel = channel.clone();
        pumps.push(tokio::spawn(async move {
            while let Ok(command) = channel.receive_command().await {
                if let Err(error) = context.consumer.on_command(&channel, command).await {
                    tracing::warn!(%error, "command consumer failed");
                }
            }
        }));
    }

    // Terminal envelopes are buffered in the session queue before the
    // transport closes, so a graceful finish is never missed here.
    loop {
        match channel.receive_session().await {
            Ok(session) if session.state == SessionState::Finishing => {
                channel.send_finished_session().await;
                break;
            },
            Ok(_) | Err(_) => break,
        }
    }
    for pump in pumps {
        pump.abort();
    }
}
