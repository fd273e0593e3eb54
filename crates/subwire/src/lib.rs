//! Subject-based publish/subscribe over a line-oriented text protocol.
//!
//! A client talks to a backend over any full-duplex byte stream (stdio, TCP,
//! a child process, an in-process pipe). Backends range from an in-process
//! broker to a UDP multicast group shared by every peer on a LAN segment.
//!
//! # Crate Structure
//!
//! - [`transport`]: Byte-stream carriers (TCP, stdio, pipes, child processes)
//! - [`proto`]: Wire codec for `SUB`/`UNSUB`/`PUB`/`INFO`/`MSG`/`+OK`/`-ERR`
//! - [`broker`]: Backend trait, in-memory broker, multicast backend, run loop
//!   (behind `broker` feature)
//! - [`client`]: Client multiplexer (behind `client` feature)

/// Re-export transport types.
pub mod transport {
    pub use subwire_transport::*;
}

/// Re-export protocol types.
pub mod proto {
    pub use subwire_proto::*;
}

/// Re-export backend types (requires `broker` feature).
#[cfg(feature = "broker")]
pub mod broker {
    pub use subwire_broker::*;
}

/// Re-export client types (requires `client` feature).
#[cfg(feature = "client")]
pub mod client {
    pub use subwire_client::*;
}
