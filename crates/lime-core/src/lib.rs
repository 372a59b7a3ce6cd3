//! Channel core for the LIME protocol.
//!
//! A channel wraps exactly one [`Transport`] and drives the session state
//! machine over it: handshake, multiplexed envelope traffic and
//! termination. Protocol correctness lives here; wire framing and
//! serialization live behind the transport seam.
//!
//! # Components
//!
//! - [`transport`]: the [`Transport`] and [`TransportListener`] contracts
//! - [`channel`]: [`ChannelBase`] - state machine, send/receive pipelines,
//!   batching, keep-alive and auto-reply behaviors
//! - [`modules`]: ordered envelope interceptor chains
//! - [`client`] / [`server`]: role-specific handshake primitives
//! - [`establishment`]: the multi-round-trip handshake orchestration built
//!   on those primitives
//! - [`error`]: the channel error taxonomy

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod client;
pub mod error;
pub mod establishment;
pub mod modules;
pub mod server;
pub mod transport;

pub use channel::{ChannelBase, ChannelConfig};
pub use client::ClientChannel;
pub use error::ChannelError;
pub use establishment::{
    AcceptAllRegistrar, AcceptGuestsAuthenticator, AuthenticationOutcome, ClientAuthenticator,
    ClientEstablishment, GuestAuthenticator, NodeRegistrar, ServerAuthenticator,
    ServerEstablishment, establish_client, establish_server,
};
pub use modules::ChannelModule;
pub use server::ServerChannel;
pub use transport::{Transport, TransportListener};
