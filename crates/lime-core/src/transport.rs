//! Transport abstraction consumed by channels.
//!
//! A transport is a bidirectional envelope pipe: framing, serialization
//! and the byte-level mechanics of compression/TLS upgrades are its
//! concern, not the channel's. Production transports wrap TCP or
//! WebSocket connections; tests use in-memory pairs.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use lime_proto::{DomainRole, Envelope, Identity, SessionCompression, SessionEncryption};

/// A bidirectional, envelope-oriented connection to one peer.
///
/// A transport is exclusively owned by its channel; no two channels share
/// one. `close` is synchronous and non-blocking so owners can release the
/// connection deterministically on drop.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to the remote endpoint.
    async fn open(&self, uri: &str) -> io::Result<()>;

    /// Send one envelope. Completes when the envelope is handed to the
    /// wire; channels serialize calls so envelopes never interleave.
    async fn send(&self, envelope: &Envelope) -> io::Result<()>;

    /// Send several envelopes as one transport write.
    ///
    /// The default sends them one by one; transports with cheaper bulk
    /// writes override this to amortize small-envelope overhead.
    async fn send_batch(&self, envelopes: &[Envelope]) -> io::Result<()> {
        for envelope in envelopes {
            self.send(envelope).await?;
        }
        Ok(())
    }

    /// Receive the next envelope from the peer.
    async fn receive(&self) -> io::Result<Envelope>;

    /// Close the connection immediately. Idempotent.
    fn close(&self);

    /// Whether the connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Compression options this transport can switch to.
    fn supported_compression(&self) -> Vec<SessionCompression>;

    /// Encryption options this transport can switch to.
    fn supported_encryption(&self) -> Vec<SessionEncryption>;

    /// The compression currently in effect.
    fn compression(&self) -> SessionCompression;

    /// The encryption currently in effect.
    fn encryption(&self) -> SessionEncryption;

    /// Switch the stream to the given compression.
    async fn set_compression(&self, compression: SessionCompression) -> io::Result<()>;

    /// Switch the stream to the given encryption.
    async fn set_encryption(&self, encryption: SessionEncryption) -> io::Result<()>;

    /// The local endpoint description (e.g. socket address), when known.
    fn local_end_point(&self) -> Option<String> {
        None
    }

    /// The remote endpoint description, when known.
    fn remote_end_point(&self) -> Option<String> {
        None
    }

    /// Whether this transport can authenticate identities itself
    /// (e.g. mutual-TLS certificate mapping).
    fn supports_authentication(&self) -> bool {
        false
    }

    /// Ask the transport to authenticate `identity`.
    ///
    /// Only meaningful when [`supports_authentication`] returns true; the
    /// result feeds into the server's authenticator, which makes the
    /// final call.
    ///
    /// [`supports_authentication`]: Transport::supports_authentication
    async fn authenticate(&self, identity: &Identity) -> io::Result<DomainRole> {
        let _ = identity;
        Ok(DomainRole::Unknown)
    }
}

/// Server-side acceptor producing transports for incoming connections.
#[async_trait]
pub trait TransportListener: Send + Sync + 'static {
    /// Start listening.
    async fn start(&self) -> io::Result<()>;

    /// Accept the next incoming connection as an opened transport.
    async fn accept(&self) -> io::Result<Arc<dyn Transport>>;

    /// Stop listening. Pending `accept` calls fail.
    fn stop(&self);
}
