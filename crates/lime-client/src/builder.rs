//! Reusable recipe for producing established client channels.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use lime_core::{
    ChannelConfig, ChannelError, ClientChannel, ClientEstablishment, Transport, establish_client,
};
use lime_proto::SessionState;

/// Produces a fresh transport per connection attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a new, unopened transport.
    async fn create(&self) -> io::Result<Arc<dyn Transport>>;
}

/// Builds client channels that come back already established.
///
/// The builder owns everything a connection attempt needs: the transport
/// factory, the endpoint uri, the channel configuration and the handshake
/// recipe, so callers can reconnect by just calling
/// [`build_and_establish`](Self::build_and_establish) again.
pub struct EstablishedClientChannelBuilder {
    factory: Box<dyn TransportFactory>,
    uri: String,
    config: ChannelConfig,
    establishment: ClientEstablishment,
}

impl EstablishedClientChannelBuilder {
    /// Create a builder from a transport factory, endpoint uri and
    /// handshake recipe.
    pub fn new(
        factory: Box<dyn TransportFactory>,
        uri: impl Into<String>,
        establishment: ClientEstablishment,
    ) -> Self {
        Self { factory, uri: uri.into(), config: ChannelConfig::default(), establishment }
    }

    /// Replace the channel configuration used for built channels.
    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// The endpoint uri connection attempts are made against.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Create a transport, open it, and run the client handshake to
    /// completion.
    pub async fn build_and_establish(&self) -> Result<ClientChannel, ChannelError> {
        let transport = self.factory.create().await?;
        transport.open(&self.uri).await?;

        let channel = ClientChannel::new(transport, &self.config);
        let session = establish_client(&channel, &self.establishment).await?;
        tracing::debug!(
            session_id = session.id.as_deref().unwrap_or(""),
            node = %channel.local_node().map(|n| n.to_string()).unwrap_or_default(),
            "client channel established"
        );
        debug_assert_eq!(channel.state(), SessionState::Established);
        Ok(channel)
    }
}
