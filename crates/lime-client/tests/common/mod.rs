//! Shared fixture: a transport factory backed by in-memory pairs, with
//! a server handshake spawned per connection attempt.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use lime_client::{EstablishedClientChannelBuilder, TransportFactory};
use lime_core::{
    ChannelConfig, ClientEstablishment, ServerChannel, ServerEstablishment, Transport,
    establish_server,
};
use lime_harness::{client_identity, server_node, transport_pair};

pub struct InMemoryFactory {
    servers: mpsc::UnboundedSender<ServerChannel>,
    attempts: AtomicUsize,
    fail_next: AtomicBool,
}

impl InMemoryFactory {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Make the next connection attempt fail.
    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportFactory for InMemoryFactory {
    async fn create(&self) -> io::Result<Arc<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "injected"));
        }
        let (client_transport, server_transport) = transport_pair();

        let servers = self.servers.clone();
        tokio::spawn(async move {
            let server = ServerChannel::new(
                server_transport,
                &ChannelConfig::default(),
                server_node(),
                Uuid::new_v4().to_string(),
            );
            match establish_server(&server, &ServerEstablishment::guest()).await {
                Ok(Some(_)) => {
                    let _ = servers.send(server);
                },
                other => panic!("server establishment failed: {other:?}"),
            }
        });

        Ok(client_transport)
    }
}

/// A guest-handshake builder plus the stream of server channels its
/// factory produces, one per connection attempt.
pub fn guest_builder() -> (
    Arc<InMemoryFactory>,
    EstablishedClientChannelBuilder,
    mpsc::UnboundedReceiver<ServerChannel>,
) {
    let (servers_tx, servers_rx) = mpsc::unbounded_channel();
    let factory = Arc::new(InMemoryFactory {
        servers: servers_tx,
        attempts: AtomicUsize::new(0),
        fail_next: AtomicBool::new(false),
    });
    let builder = EstablishedClientChannelBuilder::new(
        Box::new(SharedFactory(factory.clone())),
        "mem://local",
        ClientEstablishment::guest(client_identity(), None),
    );
    (factory, builder, servers_rx)
}

struct SharedFactory(Arc<InMemoryFactory>);

#[async_trait]
impl TransportFactory for SharedFactory {
    async fn create(&self) -> io::Result<Arc<dyn Transport>> {
        self.0.create().await
    }
}
