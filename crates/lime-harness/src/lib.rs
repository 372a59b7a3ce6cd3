//! Test fixtures for LIME channels.
//!
//! [`PairTransport`] is an in-memory, envelope-level transport pair with
//! fault injection and traffic capture; the `established_pair` helpers run
//! both sides of the handshake and hand back ready-to-use channels.
//!
//! This crate is test tooling: helpers panic on fixture failures instead
//! of propagating them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex as TokioMutex, Notify, mpsc};
use uuid::Uuid;

use lime_core::{
    ChannelConfig, ClientChannel, ClientEstablishment, ServerChannel, ServerEstablishment,
    Transport, TransportListener, establish_client, establish_server,
};
use lime_proto::{Envelope, Identity, Node, SessionCompression, SessionEncryption};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One end of an in-memory transport pair.
///
/// Every sent envelope is recorded for later assertions; `fail_next_send`
/// and `fail_next_receive` inject one-shot transport faults.
pub struct PairTransport {
    tx: StdMutex<Option<mpsc::UnboundedSender<Envelope>>>,
    rx: TokioMutex<mpsc::UnboundedReceiver<Envelope>>,
    connected: AtomicBool,
    closes: AtomicUsize,
    sent: StdMutex<Vec<Envelope>>,
    fail_next_send: AtomicBool,
    fail_next_receive: AtomicBool,
    compression: StdMutex<SessionCompression>,
    encryption: StdMutex<SessionEncryption>,
    supported_compression: Vec<SessionCompression>,
    supported_encryption: Vec<SessionEncryption>,
}

impl PairTransport {
    fn new(
        tx: mpsc::UnboundedSender<Envelope>,
        rx: mpsc::UnboundedReceiver<Envelope>,
        supported_compression: Vec<SessionCompression>,
        supported_encryption: Vec<SessionEncryption>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tx: StdMutex::new(Some(tx)),
            rx: TokioMutex::new(rx),
            connected: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
            sent: StdMutex::new(Vec::new()),
            fail_next_send: AtomicBool::new(false),
            fail_next_receive: AtomicBool::new(false),
            compression: StdMutex::new(SessionCompression::None),
            encryption: StdMutex::new(SessionEncryption::None),
            supported_compression,
            supported_encryption,
        })
    }

    /// How many times `close` has been called on this end.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// A snapshot of every envelope sent through this end.
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        lock(&self.sent).clone()
    }

    /// Make the next `send` fail with a broken-pipe error.
    pub fn fail_next_send(&self) {
        self.fail_next_send.store(true, Ordering::SeqCst);
    }

    /// Make the next `receive` fail with a connection-reset error.
    pub fn fail_next_receive(&self) {
        self.fail_next_receive.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for PairTransport {
    async fn open(&self, _uri: &str) -> io::Result<()> {
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> io::Result<()> {
        if self.fail_next_send.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected send fault"));
        }
        let tx = lock(&self.tx)
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"))?;
        tx.send(envelope.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))?;
        lock(&self.sent).push(envelope.clone());
        Ok(())
    }

    async fn receive(&self) -> io::Result<Envelope> {
        if self.fail_next_receive.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected receive fault"));
        }
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "transport closed"))
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
        self.supported_compression.clone()
    }

    fn supported_encryption(&self) -> Vec<SessionEncryption> {
        self.supported_encryption.clone()
    }

    fn compression(&self) -> SessionCompression {
        *lock(&self.compression)
    }

    fn encryption(&self) -> SessionEncryption {
        *lock(&self.encryption)
    }

    async fn set_compression(&self, compression: SessionCompression) -> io::Result<()> {
        *lock(&self.compression) = compression;
        Ok(())
    }

    async fn set_encryption(&self, encryption: SessionEncryption) -> io::Result<()> {
        *lock(&self.encryption) = encryption;
        Ok(())
    }
}

/// Create a connected transport pair supporting only cleartext.
pub fn transport_pair() -> (Arc<PairTransport>, Arc<PairTransport>) {
    transport_pair_with(vec![SessionCompression::None], vec![SessionEncryption::None])
}

/// Create a connected transport pair with the given supported options.
pub fn transport_pair_with(
    compression: Vec<SessionCompression>,
    encryption: Vec<SessionEncryption>,
) -> (Arc<PairTransport>, Arc<PairTransport>) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a = PairTransport::new(a_tx, a_rx, compression.clone(), encryption.clone());
    let b = PairTransport::new(b_tx, b_rx, compression, encryption);
    (a, b)
}

/// In-memory listener: accepts the server ends pushed by a
/// [`MemoryConnector`].
pub struct MemoryListener {
    rx: TokioMutex<mpsc::UnboundedReceiver<Arc<PairTransport>>>,
    stopped: AtomicBool,
    notify: Notify,
}

/// Client-side handle producing connections to a [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<Arc<PairTransport>>,
}

impl MemoryConnector {
    /// Open a new connection; returns the client end of the pair.
    pub fn connect(&self) -> Arc<PairTransport> {
        let (client, server) = transport_pair();
        self.tx.send(server).expect("listener gone");
        client
    }
}

/// Create a connected in-memory listener/connector pair.
pub fn memory_listener() -> (MemoryListener, MemoryConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = MemoryListener {
        rx: TokioMutex::new(rx),
        stopped: AtomicBool::new(false),
        notify: Notify::new(),
    };
    (listener, MemoryConnector { tx })
}

#[async_trait]
impl TransportListener for MemoryListener {
    async fn start(&self) -> io::Result<()> {
        Ok(())
    }

    async fn accept(&self) -> io::Result<Arc<dyn Transport>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "listener stopped"));
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            transport = rx.recv() => transport
                .map(|t| t as Arc<dyn Transport>)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener gone")),
            () = self.notify.notified() => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "listener stopped"))
            },
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// The server address used by the fixtures.
pub fn server_node() -> Node {
    "postmaster@localhost/server".parse().expect("fixture node")
}

/// The client identity used by the fixtures.
pub fn client_identity() -> Identity {
    "alice@localhost".parse().expect("fixture identity")
}

/// Run both sides of a guest handshake over the given transports and
/// return the established channels.
pub async fn establish_over(
    client_transport: Arc<PairTransport>,
    server_transport: Arc<PairTransport>,
    client_options: &ClientEstablishment,
    server_options: &ServerEstablishment,
) -> (ClientChannel, ServerChannel) {
    let config = ChannelConfig::default();
    let client = ClientChannel::new(client_transport, &config);
    let server = ServerChannel::new(
        server_transport,
        &config,
        server_node(),
        Uuid::new_v4().to_string(),
    );

    let (client_result, server_result) = tokio::join!(
        establish_client(&client, client_options),
        establish_server(&server, server_options),
    );
    client_result.expect("client establishment");
    server_result.expect("server establishment").expect("session refused");
    (client, server)
}

/// A ready-to-use established channel pair with guest authentication and
/// nothing to negotiate.
pub async fn established_pair() -> (ClientChannel, ServerChannel) {
    let (client_transport, server_transport) = transport_pair();
    let client_options = ClientEstablishment::guest(client_identity(), Some("test".to_string()));
    let server_options = ServerEstablishment::guest();
    establish_over(client_transport, server_transport, &client_options, &server_options).await
}
