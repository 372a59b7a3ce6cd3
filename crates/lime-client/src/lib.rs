//! Client-side channel management for the LIME protocol.
//!
//! [`EstablishedClientChannelBuilder`] packages transport creation and the
//! handshake into a reusable recipe; [`OnDemandClientChannel`] lazily
//! builds and transparently rebuilds a channel around that recipe; and
//! [`MultiplexerClientChannel`] fans traffic out over several established
//! channels to hide per-channel head-of-line blocking.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod builder;
pub mod multiplexer;
pub mod on_demand;

pub use builder::{EstablishedClientChannelBuilder, TransportFactory};
pub use multiplexer::MultiplexerClientChannel;
pub use on_demand::{ChannelEventHandler, FailureHandler, OnDemandClientChannel};
