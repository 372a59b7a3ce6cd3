//! The channel session state machine and envelope pipelines.
//!
//! [`ChannelBase`] owns one transport exclusively and multiplexes the four
//! envelope kinds over it. A single demux task reads the transport and
//! routes envelopes into bounded per-kind queues, so reception is
//! independent across kinds and FIFO within one. Sends are serialized
//! through a per-channel gate, optionally batched through a bounded queue
//! and flush worker.
//!
//! The session state only moves forward; transitions are driven
//! exclusively by session envelopes crossing the wire. Receiving a
//! terminal session closes the transport, exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Mutex as TokioMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use lime_proto::reason::codes;
use lime_proto::{
    Command, Document, Envelope, MediaType, Message, Node, Notification, NotificationEvent,
    Reason, Session, SessionState,
};

use crate::error::ChannelError;
use crate::modules::ChannelModule;
use crate::transport::Transport;

/// Tuning knobs for a channel.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Capacity of each per-kind receive queue and of the send queues.
    pub queue_capacity: usize,
    /// Envelopes accumulated per transport write; 1 disables batching.
    pub send_batch_size: usize,
    /// How long a partial batch may wait before it is flushed.
    pub send_flush_interval: Duration,
    /// Answer `GET /ping` requests before they reach the receiver.
    pub auto_reply_pings: bool,
    /// Emit a `received` notification for each delivered message with an
    /// id.
    pub auto_notify_receipt: bool,
    /// Send a ping when the connection has been idle this long.
    pub remote_ping_interval: Option<Duration>,
    /// Close the channel when no traffic is observed for this long.
    pub remote_idle_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            send_batch_size: 1,
            send_flush_interval: Duration::from_millis(5),
            auto_reply_pings: true,
            auto_notify_receipt: false,
            remote_ping_interval: None,
            remote_idle_timeout: None,
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Pipeline<T> {
    tx: StdMutex<Option<mpsc::Sender<T>>>,
    rx: TokioMutex<mpsc::Receiver<T>>,
}

impl<T> Pipeline<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx: StdMutex::new(Some(tx)), rx: TokioMutex::new(rx) }
    }

    fn sender(&self) -> Option<mpsc::Sender<T>> {
        lock(&self.tx).clone()
    }

    fn shut(&self) {
        lock(&self.tx).take();
    }
}

type ModuleChain<T> = StdMutex<Vec<Arc<dyn ChannelModule<T>>>>;
type SendAck = oneshot::Sender<Result<(), ChannelError>>;

enum Direction {
    Sending,
    Receiving,
}

async fn run_chain<T: Send + 'static>(
    modules: &ModuleChain<T>,
    mut envelope: T,
    direction: Direction,
) -> Option<T> {
    let chain: Vec<Arc<dyn ChannelModule<T>>> = lock(modules).clone();
    for module in chain {
        envelope = match direction {
            Direction::Sending => module.on_sending(envelope).await?,
            Direction::Receiving => module.on_receiving(envelope).await?,
        };
    }
    Some(envelope)
}

struct ChannelInner {
    transport: Arc<dyn Transport>,
    state: StdMutex<SessionState>,
    session_id: StdMutex<Option<String>>,
    local_node: StdMutex<Option<Node>>,
    remote_node: StdMutex<Option<Node>>,
    closed: AtomicBool,
    last_activity: StdMutex<Instant>,
    send_gate: TokioMutex<()>,
    batch_tx: Option<mpsc::Sender<(Envelope, SendAck)>>,
    messages: Pipeline<Message>,
    notifications: Pipeline<Notification>,
    commands: Pipeline<Command>,
    sessions: Pipeline<Session>,
    message_modules: ModuleChain<Message>,
    notification_modules: ModuleChain<Notification>,
    command_modules: ModuleChain<Command>,
    pending_commands: StdMutex<HashMap<String, oneshot::Sender<Command>>>,
    last_ping_id: StdMutex<Option<String>>,
    failure: StdMutex<Option<ChannelError>>,
}

impl ChannelInner {
    /// Close the transport exactly once; racing callers no-op.
    fn close_transport(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(state = ?*lock(&self.state), "closing transport");
            self.transport.close();
        }
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn termination_error(&self) -> ChannelError {
        lock(&self.failure).clone().unwrap_or(ChannelError::Closed)
    }

    async fn set_state(&self, state: SessionState) {
        let previous = {
            let mut guard = lock(&self.state);
            std::mem::replace(&mut *guard, state)
        };
        if previous != state {
            tracing::debug!(?previous, ?state, "session state changed");
            notify_state_changed(self, state).await;
        }
    }

    /// Write an envelope under the send gate, bypassing batching.
    ///
    /// Used for auto-replies, keep-alive pings and protocol self-defense,
    /// which must not queue behind application traffic.
    async fn send_direct(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        let _gate = self.send_gate.lock().await;
        self.transport.send(envelope).await?;
        self.touch();
        Ok(())
    }

    fn shut_pipelines(&self) {
        self.messages.shut();
        self.notifications.shut();
        self.commands.shut();
        self.sessions.shut();
        lock(&self.pending_commands).clear();
    }
}

async fn notify_state_changed(inner: &ChannelInner, state: SessionState) {
    let message_chain = lock(&inner.message_modules).clone();
    for module in message_chain {
        module.on_state_changed(state).await;
    }
    let notification_chain = lock(&inner.notification_modules).clone();
    for module in notification_chain {
        module.on_state_changed(state).await;
    }
    let command_chain = lock(&inner.command_modules).clone();
    for module in command_chain {
        module.on_state_changed(state).await;
    }
}

/// The session state machine and per-kind send/receive pipelines over one
/// exclusively-owned transport.
pub struct ChannelBase {
    inner: Arc<ChannelInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelBase {
    /// Create a channel over an opened transport and start its pipeline
    /// tasks. The channel starts in the `New` state.
    pub fn new(transport: Arc<dyn Transport>, config: &ChannelConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (reply_tx, reply_rx) = mpsc::channel::<Envelope>(capacity);
        let (batch_tx, batch_rx) = if config.send_batch_size > 1 {
            let (tx, rx) = mpsc::channel(capacity);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let inner = Arc::new(ChannelInner {
            transport,
            state: StdMutex::new(SessionState::New),
            session_id: StdMutex::new(None),
            local_node: StdMutex::new(None),
            remote_node: StdMutex::new(None),
            closed: AtomicBool::new(false),
            last_activity: StdMutex::new(Instant::now()),
            send_gate: TokioMutex::new(()),
            batch_tx,
            messages: Pipeline::new(capacity),
            notifications: Pipeline::new(capacity),
            commands: Pipeline::new(capacity),
            sessions: Pipeline::new(capacity),
            message_modules: StdMutex::new(Vec::new()),
            notification_modules: StdMutex::new(Vec::new()),
            command_modules: StdMutex::new(Vec::new()),
            pending_commands: StdMutex::new(HashMap::new()),
            last_ping_id: StdMutex::new(None),
            failure: StdMutex::new(None),
        });

        if config.auto_reply_pings {
            lock(&inner.command_modules)
                .push(Arc::new(ReplyPingModule { replies: reply_tx.clone() }));
        }
        if config.auto_notify_receipt {
            lock(&inner.message_modules)
                .push(Arc::new(NotifyReceiptModule { replies: reply_tx.clone() }));
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_demux(inner.clone())));
        tasks.push(tokio::spawn(run_reply_pump(inner.clone(), reply_rx)));
        if let Some(batch_rx) = batch_rx {
            tasks.push(tokio::spawn(run_send_flusher(
                inner.clone(),
                batch_rx,
                config.send_batch_size,
                config.send_flush_interval,
            )));
        }
        if config.remote_ping_interval.is_some() || config.remote_idle_timeout.is_some() {
            tasks.push(tokio::spawn(run_keepalive(
                inner.clone(),
                config.remote_ping_interval,
                config.remote_idle_timeout,
            )));
        }

        Self { inner, tasks }
    }

    /// The channel's current view of the session state.
    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    /// The session id, once assigned.
    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.session_id).clone()
    }

    /// The local node address, once established.
    pub fn local_node(&self) -> Option<Node> {
        lock(&self.inner.local_node).clone()
    }

    /// The remote node address, once established.
    pub fn remote_node(&self) -> Option<Node> {
        lock(&self.inner.remote_node).clone()
    }

    /// The transport this channel owns.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the transport. Idempotent; pending operations fail with
    /// [`ChannelError::Closed`] or the recorded failure.
    pub fn close(&self) {
        self.inner.close_transport();
    }

    /// Append a module to the message chain.
    pub fn add_message_module(&self, module: Arc<dyn ChannelModule<Message>>) {
        lock(&self.inner.message_modules).push(module);
    }

    /// Append a module to the notification chain.
    pub fn add_notification_module(&self, module: Arc<dyn ChannelModule<Notification>>) {
        lock(&self.inner.notification_modules).push(module);
    }

    /// Append a module to the command chain.
    pub fn add_command_module(&self, module: Arc<dyn ChannelModule<Command>>) {
        lock(&self.inner.command_modules).push(module);
    }

    pub(crate) async fn set_state(&self, state: SessionState) {
        self.inner.set_state(state).await;
    }

    pub(crate) fn set_session_id(&self, id: String) {
        *lock(&self.inner.session_id) = Some(id);
    }

    pub(crate) fn set_local_node(&self, node: Node) {
        *lock(&self.inner.local_node) = Some(node);
    }

    pub(crate) fn set_remote_node(&self, node: Node) {
        *lock(&self.inner.remote_node) = Some(node);
    }

    fn require_established(&self, operation: &'static str) -> Result<(), ChannelError> {
        let state = self.state();
        if state == SessionState::Established {
            Ok(())
        } else {
            Err(ChannelError::InvalidState { operation, state })
        }
    }

    /// Send a message. Requires the `Established` state.
    pub async fn send_message(&self, message: Message) -> Result<(), ChannelError> {
        self.require_established("send_message")?;
        let Some(message) =
            run_chain(&self.inner.message_modules, message, Direction::Sending).await
        else {
            return Ok(());
        };
        self.send_envelope(Envelope::Message(message)).await
    }

    /// Send a notification. Requires the `Established` state.
    pub async fn send_notification(&self, notification: Notification) -> Result<(), ChannelError> {
        self.require_established("send_notification")?;
        let Some(notification) =
            run_chain(&self.inner.notification_modules, notification, Direction::Sending).await
        else {
            return Ok(());
        };
        self.send_envelope(Envelope::Notification(notification)).await
    }

    /// Send a command. Requires the `Established` state.
    pub async fn send_command(&self, command: Command) -> Result<(), ChannelError> {
        self.require_established("send_command")?;
        let Some(command) =
            run_chain(&self.inner.command_modules, command, Direction::Sending).await
        else {
            return Ok(());
        };
        self.send_envelope(Envelope::Command(command)).await
    }

    /// Send a session envelope. Permitted in any pre-terminal state; the
    /// channel state itself changes only through role-specific methods or
    /// received sessions.
    pub async fn send_session(&self, session: Session) -> Result<(), ChannelError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(ChannelError::InvalidState { operation: "send_session", state });
        }
        // Session envelopes bypass batching: handshake latency must not
        // wait on a flush window.
        self.inner.send_direct(&Envelope::Session(session)).await
    }

    async fn send_envelope(&self, envelope: Envelope) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(self.inner.termination_error());
        }
        match &self.inner.batch_tx {
            Some(batch_tx) => {
                let (ack_tx, ack_rx) = oneshot::channel();
                batch_tx
                    .send((envelope, ack_tx))
                    .await
                    .map_err(|_| self.inner.termination_error())?;
                ack_rx.await.map_err(|_| self.inner.termination_error())?
            },
            None => self.inner.send_direct(&envelope).await,
        }
    }

    /// Receive the next message. Requires the `Established` state; at most
    /// one message receive may be outstanding.
    pub async fn receive_message(&self) -> Result<Message, ChannelError> {
        self.require_established("receive_message")?;
        self.receive_from(&self.inner.messages, "message").await
    }

    /// Receive the next notification. Requires the `Established` state; at
    /// most one notification receive may be outstanding.
    pub async fn receive_notification(&self) -> Result<Notification, ChannelError> {
        self.require_established("receive_notification")?;
        self.receive_from(&self.inner.notifications, "notification").await
    }

    /// Receive the next command. Requires the `Established` state; at most
    /// one command receive may be outstanding.
    pub async fn receive_command(&self) -> Result<Command, ChannelError> {
        self.require_established("receive_command")?;
        self.receive_from(&self.inner.commands, "command").await
    }

    /// Receive the next session envelope. Permitted in any state; at most
    /// one session receive may be outstanding.
    pub async fn receive_session(&self) -> Result<Session, ChannelError> {
        self.receive_from(&self.inner.sessions, "session").await
    }

    async fn receive_from<T>(
        &self,
        pipeline: &Pipeline<T>,
        kind: &'static str,
    ) -> Result<T, ChannelError> {
        let mut rx =
            pipeline.rx.try_lock().map_err(|_| ChannelError::AlreadyListening(kind))?;
        match rx.recv().await {
            Some(envelope) => Ok(envelope),
            None => Err(self.inner.termination_error()),
        }
    }

    /// Send a command and await its correlated response.
    ///
    /// The response is matched by id ahead of the command receive queue,
    /// so it does not interfere with an active `receive_command` listener.
    pub async fn process_command(
        &self,
        mut command: Command,
        timeout: Duration,
    ) -> Result<Command, ChannelError> {
        self.require_established("process_command")?;
        let id = command.id.get_or_insert_with(Envelope::new_id).clone();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending_commands).insert(id.clone(), tx);

        let result = async {
            self.send_envelope(Envelope::Command(command)).await?;
            match tokio::time::timeout(timeout, rx).await {
                Err(_) => Err(ChannelError::Timeout("process_command")),
                Ok(Err(_)) => Err(self.inner.termination_error()),
                Ok(Ok(response)) => Ok(response),
            }
        }
        .await;

        if result.is_err() {
            lock(&self.inner.pending_commands).remove(&id);
        }
        result
    }
}

impl Drop for ChannelBase {
    fn drop(&mut self) {
        self.inner.close_transport();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Reads the transport and routes envelopes into the per-kind queues.
async fn run_demux(inner: Arc<ChannelInner>) {
    loop {
        let envelope = match inner.transport.receive().await {
            Ok(envelope) => envelope,
            Err(error) => {
                if !inner.closed.load(Ordering::SeqCst) {
                    tracing::debug!(%error, "transport receive failed");
                    *lock(&inner.failure) = Some(ChannelError::from(error));
                }
                break;
            },
        };
        inner.touch();

        let proceed = match envelope {
            Envelope::Session(session) => handle_session(&inner, session).await,
            Envelope::Message(message) => {
                match run_chain(&inner.message_modules, message, Direction::Receiving).await {
                    Some(message) => deliver(&inner.messages, message).await,
                    None => true,
                }
            },
            Envelope::Notification(notification) => {
                match run_chain(&inner.notification_modules, notification, Direction::Receiving)
                    .await
                {
                    Some(notification) => deliver(&inner.notifications, notification).await,
                    None => true,
                }
            },
            Envelope::Command(command) => handle_command(&inner, command).await,
        };
        if !proceed {
            break;
        }
    }
    inner.close_transport();
    inner.shut_pipelines();
}

async fn deliver<T>(pipeline: &Pipeline<T>, envelope: T) -> bool {
    match pipeline.sender() {
        Some(tx) => tx.send(envelope).await.is_ok(),
        None => false,
    }
}

async fn handle_command(inner: &Arc<ChannelInner>, command: Command) -> bool {
    if command.is_response() {
        if let Some(id) = &command.id {
            // Keep-alive ping responses are internal traffic.
            if lock(&inner.last_ping_id).as_ref() == Some(id) {
                lock(&inner.last_ping_id).take();
                return true;
            }
            let pending = lock(&inner.pending_commands).remove(id);
            if let Some(tx) = pending {
                let _ = tx.send(command);
                return true;
            }
        }
    }
    match run_chain(&inner.command_modules, command, Direction::Receiving).await {
        Some(command) => deliver(&inner.commands, command).await,
        None => true,
    }
}

/// Adopt a received session envelope: state, id and (when established)
/// node addresses. Returns false when the demux loop must stop.
async fn handle_session(inner: &Arc<ChannelInner>, session: Session) -> bool {
    let current = *lock(&inner.state);
    let target = session.state;

    let id_consistent = {
        let mut session_id = lock(&inner.session_id);
        match (session_id.as_ref(), session.id.as_ref()) {
            (None, Some(id)) => {
                *session_id = Some(id.clone());
                true
            },
            (Some(expected), Some(received)) => expected == received,
            _ => true,
        }
    };

    if !id_consistent || (target != current && !current.can_transition_to(target)) {
        // Desynchronized peer: refuse, notify and shut down.
        tracing::warn!(?current, ?target, id_consistent, "unexpected session envelope");
        let reason = Reason::new(codes::SESSION_ERROR, "unexpected session envelope");
        let failed = Session::failed(lock(&inner.session_id).clone(), reason.clone());
        let _ = inner.send_direct(&Envelope::Session(failed)).await;
        *lock(&inner.failure) = Some(ChannelError::SessionFailed(reason));
        return false;
    }

    if target != current {
        inner.set_state(target).await;
    }

    if target == SessionState::Established {
        if let Some(to) = &session.to {
            *lock(&inner.local_node) = Some(to.clone());
        }
        if let Some(from) = &session.from {
            *lock(&inner.remote_node) = Some(from.clone());
        }
    }

    if target == SessionState::Failed {
        let reason = session
            .reason
            .clone()
            .unwrap_or_else(|| Reason::new(codes::SESSION_ERROR, "session failed"));
        *lock(&inner.failure) = Some(ChannelError::SessionFailed(reason));
    }

    let terminal = target.is_terminal();
    // Deliver before stopping so a pending receive_session observes the
    // terminal envelope rather than a closed queue.
    deliver(&inner.sessions, session).await;
    if terminal {
        inner.close_transport();
    }
    !terminal
}

/// Writes auto-replies and keep-alive traffic, bypassing batching.
async fn run_reply_pump(inner: Arc<ChannelInner>, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        if inner.send_direct(&envelope).await.is_err() {
            break;
        }
    }
}

/// Accumulates queued sends into batches and flushes them as one
/// transport write.
async fn run_send_flusher(
    inner: Arc<ChannelInner>,
    mut rx: mpsc::Receiver<(Envelope, SendAck)>,
    batch_size: usize,
    flush_interval: Duration,
) {
    while let Some(first) = rx.recv().await {
        let mut items = vec![first];
        let deadline = tokio::time::sleep(flush_interval);
        tokio::pin!(deadline);
        while items.len() < batch_size {
            tokio::select! {
                () = &mut deadline => break,
                next = rx.recv() => match next {
                    Some(item) => items.push(item),
                    None => break,
                },
            }
        }

        let envelopes: Vec<Envelope> = items.iter().map(|(envelope, _)| envelope.clone()).collect();
        let result = {
            let _gate = inner.send_gate.lock().await;
            inner.transport.send_batch(&envelopes).await
        };
        inner.touch();
        let result = result.map_err(ChannelError::from);
        for (_, ack) in items {
            let _ = ack.send(result.clone());
        }
    }
}

/// Best-effort idle management: ping the remote on idleness, close the
/// channel when the idle timeout elapses.
async fn run_keepalive(
    inner: Arc<ChannelInner>,
    ping_interval: Option<Duration>,
    idle_timeout: Option<Duration>,
) {
    let tick = ping_interval
        .or(idle_timeout)
        .unwrap_or(Duration::from_secs(30));
    loop {
        tokio::time::sleep(tick).await;
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        let idle = lock(&inner.last_activity).elapsed();
        if let Some(timeout) = idle_timeout {
            if idle >= timeout {
                tracing::info!(?idle, "remote idle timeout, closing channel");
                inner.close_transport();
                break;
            }
        }
        if *lock(&inner.state) != SessionState::Established {
            continue;
        }
        if let Some(interval) = ping_interval {
            if idle >= interval {
                let ping = Command::ping();
                if let Some(id) = &ping.id {
                    *lock(&inner.last_ping_id) = Some(id.clone());
                }
                if inner.send_direct(&Envelope::Command(ping)).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Answers ping requests before they reach the command receiver.
struct ReplyPingModule {
    replies: mpsc::Sender<Envelope>,
}

#[async_trait]
impl ChannelModule<Command> for ReplyPingModule {
    async fn on_receiving(&self, command: Command) -> Option<Command> {
        if command.is_ping_request() {
            let mut response = command.success_response();
            response.set_resource(Document::new(MediaType::PING, json!({})));
            let _ = self.replies.send(Envelope::Command(response)).await;
            None
        } else {
            Some(command)
        }
    }
}

/// Emits a `received` notification for each delivered message with an id.
struct NotifyReceiptModule {
    replies: mpsc::Sender<Envelope>,
}

#[async_trait]
impl ChannelModule<Message> for NotifyReceiptModule {
    async fn on_receiving(&self, message: Message) -> Option<Message> {
        if let Some(id) = &message.id {
            let mut notification = Notification::new(id.clone(), NotificationEvent::Received);
            notification.to = message.from.clone();
            let _ = self.replies.send(Envelope::Notification(notification)).await;
        }
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::AtomicUsize;

    use lime_proto::{CommandStatus, SessionCompression, SessionEncryption};

    use super::*;

    /// In-memory envelope pipe for exercising a single channel.
    struct TestTransport {
        tx: StdMutex<Option<mpsc::UnboundedSender<Envelope>>>,
        rx: TokioMutex<mpsc::UnboundedReceiver<Envelope>>,
        connected: AtomicBool,
        closes: AtomicUsize,
    }

    fn transport_pair() -> (Arc<TestTransport>, Arc<TestTransport>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let make = |tx, rx| {
            Arc::new(TestTransport {
                tx: StdMutex::new(Some(tx)),
                rx: TokioMutex::new(rx),
                connected: AtomicBool::new(true),
                closes: AtomicUsize::new(0),
            })
        };
        (make(a_tx, a_rx), make(b_tx, b_rx))
    }

    #[async_trait]
    impl Transport for TestTransport {
        async fn open(&self, _uri: &str) -> io::Result<()> {
            Ok(())
        }

        async fn send(&self, envelope: &Envelope) -> io::Result<()> {
            let tx = lock(&self.tx)
                .clone()
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "closed"))?;
            tx.send(envelope.clone())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
        }

        async fn receive(&self) -> io::Result<Envelope> {
            self.rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "closed"))
        }

        fn close(&self) {
            lock(&self.tx).take();
            self.connected.store(false, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn supported_compression(&self) -> Vec<SessionCompression> {
            vec![SessionCompression::None]
        }

        fn supported_encryption(&self) -> Vec<SessionEncryption> {
            vec![SessionEncryption::None]
        }

        fn compression(&self) -> SessionCompression {
            SessionCompression::None
        }

        fn encryption(&self) -> SessionEncryption {
            SessionEncryption::None
        }

        async fn set_compression(&self, _compression: SessionCompression) -> io::Result<()> {
            Ok(())
        }

        async fn set_encryption(&self, _encryption: SessionEncryption) -> io::Result<()> {
            Ok(())
        }
    }

    fn sample_message() -> Message {
        let to: Node = "bob@example.com".parse().unwrap();
        Message::new(to, Document::text("hi"))
    }

    async fn established_channel() -> (ChannelBase, Arc<TestTransport>) {
        let (local, remote) = transport_pair();
        let channel = ChannelBase::new(local, &ChannelConfig::default());
        channel.set_state(SessionState::Established).await;
        (channel, remote)
    }

    #[tokio::test]
    async fn send_requires_established_state() {
        let (local, _remote) = transport_pair();
        let channel = ChannelBase::new(local, &ChannelConfig::default());

        let result = channel.send_message(sample_message()).await;
        assert!(matches!(
            result,
            Err(ChannelError::InvalidState { operation: "send_message", state: SessionState::New })
        ));
    }

    #[tokio::test]
    async fn second_concurrent_receive_fails_fast() {
        let (channel, remote) = established_channel().await;
        let channel = Arc::new(channel);

        let first = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.receive_message().await })
        };
        tokio::task::yield_now().await;

        let second = channel.receive_message().await;
        assert!(matches!(second, Err(ChannelError::AlreadyListening("message"))));

        // A different kind is independent and unaffected.
        let third = tokio::time::timeout(Duration::from_millis(10), channel.receive_command()).await;
        assert!(third.is_err(), "command receive must not be blocked by the message listener");

        // The first listener is unaffected and still completes.
        remote.send(&Envelope::Message(sample_message())).await.unwrap();
        let received = first.await.unwrap().unwrap();
        assert_eq!(received.content, Document::text("hi"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (local, _remote) = transport_pair();
        let channel = ChannelBase::new(local.clone(), &ChannelConfig::default());
        channel.set_state(SessionState::Established).await;

        channel.close();
        channel.close();
        drop(channel); // drop closes too; still exactly once

        assert_eq!(local.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ping_requests_are_answered_automatically() {
        let (_channel, remote) = established_channel().await;

        let ping = Command::ping();
        remote.send(&Envelope::Command(ping.clone())).await.unwrap();

        let response = remote.rx.lock().await.recv().await.unwrap();
        match response {
            Envelope::Command(response) => {
                assert_eq!(response.id, ping.id);
                assert_eq!(response.status, Some(CommandStatus::Success));
            },
            other => panic!("expected command response, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn receipt_notifications_are_sent_when_enabled() {
        let (local, remote) = transport_pair();
        let config = ChannelConfig { auto_notify_receipt: true, ..ChannelConfig::default() };
        let channel = ChannelBase::new(local, &config);
        channel.set_state(SessionState::Established).await;

        let mut message = sample_message();
        message.from = Some("alice@example.com/a".parse().unwrap());
        remote.send(&Envelope::Message(message.clone())).await.unwrap();

        let delivered = channel.receive_message().await.unwrap();
        assert_eq!(delivered.id, message.id);

        let notification = remote.rx.lock().await.recv().await.unwrap();
        match notification {
            Envelope::Notification(notification) => {
                assert_eq!(notification.id, message.id);
                assert_eq!(notification.event, NotificationEvent::Received);
                assert_eq!(notification.to, message.from);
            },
            other => panic!("expected notification, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn regressing_session_triggers_failed_and_close() {
        let (channel, remote) = established_channel().await;
        channel.set_session_id("s-1".to_string());

        remote.send(&Envelope::Session(Session::new(SessionState::New))).await.unwrap();

        let response = remote.rx.lock().await.recv().await.unwrap();
        match response {
            Envelope::Session(session) => {
                assert_eq!(session.state, SessionState::Failed);
                assert!(session.reason.is_some());
            },
            other => panic!("expected failed session, got {}", other.kind()),
        }

        // The channel tears down; subsequent receives report the failure.
        let result = channel.receive_session().await;
        assert!(matches!(result, Err(ChannelError::SessionFailed(_))));
    }

    #[tokio::test]
    async fn mismatched_session_id_is_rejected() {
        let (channel, remote) = established_channel().await;
        channel.set_session_id("s-1".to_string());

        let mut finishing = Session::new(SessionState::Finishing);
        finishing.id = Some("someone-else".to_string());
        remote.send(&Envelope::Session(finishing)).await.unwrap();

        let response = remote.rx.lock().await.recv().await.unwrap();
        assert!(matches!(response, Envelope::Session(s) if s.state == SessionState::Failed));
        assert!(channel.is_closed() || channel.receive_session().await.is_err());
    }

    #[tokio::test]
    async fn batched_sends_all_reach_the_peer() {
        let (local, remote) = transport_pair();
        let config = ChannelConfig {
            send_batch_size: 4,
            send_flush_interval: Duration::from_millis(1),
            ..ChannelConfig::default()
        };
        let channel = Arc::new(ChannelBase::new(local, &config));
        channel.set_state(SessionState::Established).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let channel = channel.clone();
            handles.push(tokio::spawn(
                async move { channel.send_message(sample_message()).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut received = 0;
        let mut rx = remote.rx.lock().await;
        while received < 8 {
            match rx.recv().await.unwrap() {
                Envelope::Message(_) => received += 1,
                other => panic!("unexpected envelope {}", other.kind()),
            }
        }
    }

    #[tokio::test]
    async fn process_command_correlates_response() {
        let (channel, remote) = established_channel().await;

        let request = Command::new(lime_proto::CommandMethod::Get, "/contacts");
        let request_id = request.id.clone().unwrap();

        let processing = tokio::spawn({
            let channel = Arc::new(channel);
            let request = request.clone();
            async move { channel.process_command(request, Duration::from_secs(1)).await }
        });

        // Peer sees the request and answers it.
        let seen = remote.rx.lock().await.recv().await.unwrap();
        let seen = match seen {
            Envelope::Command(command) => command,
            other => panic!("expected command, got {}", other.kind()),
        };
        assert_eq!(seen.id.as_deref(), Some(request_id.as_str()));
        remote.send(&Envelope::Command(seen.success_response())).await.unwrap();

        let response = processing.await.unwrap().unwrap();
        assert_eq!(response.id, Some(request_id));
        assert_eq!(response.status, Some(CommandStatus::Success));
    }

    #[tokio::test]
    async fn process_command_times_out_distinctly() {
        let (channel, _remote) = established_channel().await;
        let request = Command::new(lime_proto::CommandMethod::Get, "/slow");
        let result = channel.process_command(request, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ChannelError::Timeout("process_command"))));
    }
}
