use subwire_proto::{CodecError, ParseError};

/// Why a client stopped. Retained and handed to every later caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalCause {
    /// The backend sent a frame that could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(ParseError),

    /// The backend sent `-ERR`.
    #[error("server error: {0}")]
    Server(String),

    /// The backend closed the stream.
    #[error("stream ended")]
    EndOfStream,

    /// Reading or writing the stream failed.
    #[error("stream I/O error: {0}")]
    Io(String),

    /// The client was closed locally.
    #[error("client closed")]
    Closed,
}

impl From<CodecError> for FatalCause {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Parse(parse) => Self::Protocol(parse),
            other => Self::Io(other.to_string()),
        }
    }
}

/// Errors returned by client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The client or the subscription is closed.
    #[error("connection closed")]
    Closed,

    /// The client stopped; carries the cause.
    #[error("connection failed: {0}")]
    Fatal(FatalCause),

    /// The subject cannot be represented on the wire.
    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Opening the underlying stream failed.
    #[error("transport error: {0}")]
    Transport(#[from] subwire_transport::TransportError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
