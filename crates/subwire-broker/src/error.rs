/// Errors that can occur in backend and run-loop operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] subwire_transport::TransportError),

    /// Codec-level error on the served stream.
    #[error("codec error: {0}")]
    Codec(#[from] subwire_proto::CodecError),

    /// The subject cannot be used.
    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    /// An encoded multicast datagram does not fit the receive buffer.
    #[error("datagram too large ({size} bytes, max {max})")]
    DatagramTooLarge { size: usize, max: usize },

    /// Sending to the multicast group failed.
    #[error("multicast send failed: {0}")]
    Send(std::io::Error),

    /// Receiving from the multicast socket failed.
    #[error("multicast receive failed: {0}")]
    Receive(std::io::Error),

    /// Setting up the multicast socket failed.
    #[error("multicast setup failed: {0}")]
    Setup(std::io::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The session's outbound side has gone away.
    #[error("session closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BrokerError>;
