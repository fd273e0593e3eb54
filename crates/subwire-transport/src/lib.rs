//! Byte-stream carriers for the subwire protocol.
//!
//! The protocol runs over any full-duplex byte stream. This crate provides the
//! [`WireStream`] type that wraps the carriers subwire knows about:
//! - TCP connections
//! - the process's own stdin/stdout
//! - in-process pipes (for tests and embedding)
//! - a child process's stdin/stdout
//!
//! It also hosts small platform helpers the multicast backend needs, such as
//! resolving an interface name to its IPv4 address.

pub mod error;
pub mod stream;
pub mod tcp;

#[cfg(unix)]
pub mod iface;

pub use error::{Result, TransportError};
pub use stream::WireStream;
pub use tcp::TcpTransport;

#[cfg(unix)]
pub use iface::{interface_ipv4, ipv4_interfaces, InterfaceAddr};
