//! Server composition for the LIME protocol.
//!
//! [`NodeRegistry`] maps registered node addresses to their server
//! channels; [`Server`] accepts transports from a listener, runs the
//! handshake on each and feeds established sessions' traffic to an
//! [`EnvelopeConsumer`]. The default consumer routes envelopes between
//! registered nodes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod registry;
pub mod server;

pub use registry::NodeRegistry;
pub use server::{EnvelopeConsumer, RouterConsumer, Server, ServerBuilder};
