//! Fan-out over several established channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as TokioMutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use lime_core::{ChannelError, ClientChannel};
use lime_proto::{Command, Envelope, Message, Notification};

use crate::builder::EstablishedClientChannelBuilder;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type SendAck = oneshot::Sender<Result<(), ChannelError>>;
type Outbound = (Envelope, SendAck);
type PendingCommands = Arc<StdMutex<HashMap<String, oneshot::Sender<Command>>>>;

/// A client channel fanned out over several underlying sessions.
///
/// Sends are assigned to the underlying channels in strict round-robin
/// order, so one slow send delays at most the traffic assigned to its
/// channel. Receives merge all channels into single per-kind queues;
/// cross-channel arrival order is not defined, but envelopes sent over the
/// same underlying channel stay in order.
pub struct MultiplexerClientChannel {
    channels: Vec<Arc<ClientChannel>>,
    outbound_tx: mpsc::Sender<Outbound>,
    messages_rx: TokioMutex<mpsc::Receiver<Message>>,
    notifications_rx: TokioMutex<mpsc::Receiver<Notification>>,
    commands_rx: TokioMutex<mpsc::Receiver<Command>>,
    pending_commands: PendingCommands,
    tasks: Vec<JoinHandle<()>>,
}

impl MultiplexerClientChannel {
    /// Build and establish `count` channels from `builder` and wire the
    /// fan-out around them.
    pub async fn establish(
        builder: &EstablishedClientChannelBuilder,
        count: usize,
    ) -> Result<Self, ChannelError> {
        let count = count.max(1);
        let mut channels = Vec::with_capacity(count);
        for _ in 0..count {
            channels.push(Arc::new(builder.build_and_establish().await?));
        }
        Ok(Self::over(channels))
    }

    /// Wire the fan-out over already-established channels.
    pub fn over(channels: Vec<Arc<ClientChannel>>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(64);
        let (messages_tx, messages_rx) = mpsc::channel(64);
        let (notifications_tx, notifications_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let pending_commands: PendingCommands = Arc::new(StdMutex::new(HashMap::new()));

        let mut tasks = Vec::new();
        let mut worker_txs = Vec::with_capacity(channels.len());
        for channel in &channels {
            // Capacity 1 keeps assignment round-robin while letting the
            // distributor run ahead by one envelope per channel.
            let (worker_tx, worker_rx) = mpsc::channel::<Outbound>(1);
            worker_txs.push(worker_tx);
            tasks.push(tokio::spawn(run_send_worker(channel.clone(), worker_rx)));

            tasks.push(tokio::spawn(pump_messages(channel.clone(), messages_tx.clone())));
            tasks.push(tokio::spawn(pump_notifications(
                channel.clone(),
                notifications_tx.clone(),
            )));
            tasks.push(tokio::spawn(pump_commands(
                channel.clone(),
                commands_tx.clone(),
                pending_commands.clone(),
            )));
        }
        tasks.push(tokio::spawn(run_distributor(outbound_rx, worker_txs)));

        Self {
            channels,
            outbound_tx,
            messages_rx: TokioMutex::new(messages_rx),
            notifications_rx: TokioMutex::new(notifications_rx),
            commands_rx: TokioMutex::new(commands_rx),
            pending_commands,
            tasks,
        }
    }

    /// The underlying channels, in round-robin order.
    pub fn channels(&self) -> &[Arc<ClientChannel>] {
        &self.channels
    }

    /// Whether every underlying channel is still established. An empty
    /// channel set is never established.
    pub fn is_established(&self) -> bool {
        !self.channels.is_empty() && self.channels.iter().all(|channel| channel.is_established())
    }

    /// Send a message over the next channel in round-robin order.
    pub async fn send_message(&self, message: Message) -> Result<(), ChannelError> {
        self.send_envelope(Envelope::Message(message)).await
    }

    /// Send a notification over the next channel in round-robin order.
    pub async fn send_notification(&self, notification: Notification) -> Result<(), ChannelError> {
        self.send_envelope(Envelope::Notification(notification)).await
    }

    /// Send a command over the next channel in round-robin order.
    pub async fn send_command(&self, command: Command) -> Result<(), ChannelError> {
        self.send_envelope(Envelope::Command(command)).await
    }

    async fn send_envelope(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound_tx
            .send((envelope, ack_tx))
            .await
            .map_err(|_| ChannelError::Closed)?;
        ack_rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Receive the next message from any underlying channel.
    pub async fn receive_message(&self) -> Result<Message, ChannelError> {
        let mut rx = self
            .messages_rx
            .try_lock()
            .map_err(|_| ChannelError::AlreadyListening("message"))?;
        rx.recv().await.ok_or(ChannelError::Closed)
    }

    /// Receive the next notification from any underlying channel.
    pub async fn receive_notification(&self) -> Result<Notification, ChannelError> {
        let mut rx = self
            .notifications_rx
            .try_lock()
            .map_err(|_| ChannelError::AlreadyListening("notification"))?;
        rx.recv().await.ok_or(ChannelError::Closed)
    }

    /// Receive the next command from any underlying channel.
    pub async fn receive_command(&self) -> Result<Command, ChannelError> {
        let mut rx = self
            .commands_rx
            .try_lock()
            .map_err(|_| ChannelError::AlreadyListening("command"))?;
        rx.recv().await.ok_or(ChannelError::Closed)
    }

    /// Send a command and await its correlated response, whichever
    /// underlying channel it arrives on.
    pub async fn process_command(
        &self,
        mut command: Command,
        timeout: Duration,
    ) -> Result<Command, ChannelError> {
        let id = command.id.get_or_insert_with(Envelope::new_id).clone();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending_commands).insert(id.clone(), tx);

        let result = async {
            self.send_envelope(Envelope::Command(command)).await?;
            match tokio::time::timeout(timeout, rx).await {
                Err(_) => Err(ChannelError::Timeout("process_command")),
                Ok(Err(_)) => Err(ChannelError::Closed),
                Ok(Ok(response)) => Ok(response),
            }
        }
        .await;

        if result.is_err() {
            lock(&self.pending_commands).remove(&id);
        }
        result
    }

    /// Gracefully finish every underlying session and close the channels.
    pub async fn finish(&self) {
        for channel in &self.channels {
            if channel.is_established() {
                let farewell = async {
                    channel.send_finishing_session().await?;
                    channel.receive_finished_session().await
                };
                if let Err(error) = tokio::time::timeout(Duration::from_secs(5), farewell)
                    .await
                    .unwrap_or(Err(ChannelError::Timeout("finish")))
                {
                    tracing::debug!(%error, "graceful finish did not complete");
                }
            }
            channel.close();
        }
    }

    /// Close every underlying channel immediately.
    pub fn close(&self) {
        for channel in &self.channels {
            channel.close();
        }
    }
}

impl Drop for MultiplexerClientChannel {
    fn drop(&mut self) {
        for channel in &self.channels {
            channel.close();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Assigns outbound envelopes to workers in strict round-robin order.
///
/// With no workers every send is refused instead of delivered.
async fn run_distributor(mut rx: mpsc::Receiver<Outbound>, worker_txs: Vec<mpsc::Sender<Outbound>>) {
    if worker_txs.is_empty() {
        while let Some((_, ack)) = rx.recv().await {
            let _ = ack.send(Err(ChannelError::Closed));
        }
        return;
    }
    let mut next = 0;
    while let Some(item) = rx.recv().await {
        let worker = &worker_txs[next];
        next = (next + 1) % worker_txs.len();
        if let Err(mpsc::error::SendError((_, ack))) = worker.send(item).await {
            let _ = ack.send(Err(ChannelError::Closed));
        }
    }
}

async fn run_send_worker(channel: Arc<ClientChannel>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some((envelope, ack)) = rx.recv().await {
        let result = channel.send_envelope(envelope).await;
        let _ = ack.send(result);
    }
}

async fn pump_messages(channel: Arc<ClientChannel>, tx: mpsc::Sender<Message>) {
    while let Ok(message) = channel.receive_message().await {
        if tx.send(message).await.is_err() {
            break;
        }
    }
}

async fn pump_notifications(channel: Arc<ClientChannel>, tx: mpsc::Sender<Notification>) {
    while let Ok(notification) = channel.receive_notification().await {
        if tx.send(notification).await.is_err() {
            break;
        }
    }
}

async fn pump_commands(
    channel: Arc<ClientChannel>,
    tx: mpsc::Sender<Command>,
    pending: PendingCommands,
) {
    while let Ok(command) = channel.receive_command().await {
        if command.is_response() {
            if let Some(id) = &command.id {
                let waiter = lock(&pending).remove(id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(command);
                    continue;
                }
            }
        }
        if tx.send(command).await.is_err() {
            break;
        }
    }
}
