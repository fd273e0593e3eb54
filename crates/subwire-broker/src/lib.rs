//! Backends and the run loop that exposes them over a byte stream.
//!
//! A [`Backend`] is anything that can publish, track subscriptions and push
//! deliveries into a [`Sink`]. Two are provided:
//! - [`MemoryBroker`] sessions: fan-out inside one process
//! - [`MulticastBackend`]: subjects mapped onto a UDP multicast group
//!
//! [`serve`] runs the protocol for one stream against one backend;
//! [`BrokerListener`] does so for every connection accepted on a TCP port.

pub mod backend;
pub mod error;
pub mod listener;
pub mod memory;
pub mod multicast;
pub mod nonce;
pub mod serve;

pub use backend::{Backend, BackendFactory, Sink};
pub use error::{BrokerError, Result};
pub use listener::BrokerListener;
pub use memory::{MemoryBroker, MemoryBrokerConfig, MemorySession, SubjectRegistry};
pub use multicast::{MulticastBackend, MulticastConfig, DEFAULT_RECV_BUFFER};
pub use nonce::{NonceWindow, DEFAULT_NONCE_TTL};
pub use serve::{serve, serve_stdio, ServeConfig};
