/// Reasons a frame could not be decoded.
///
/// A parse error never leaves the decoder stuck: the offending input is
/// consumed (or scheduled to be skipped) before the error is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The command line was empty.
    #[error("empty line")]
    EmptyLine,

    /// The operation name is not valid in this direction.
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    /// Wrong number of arguments for the operation.
    #[error("{op} expects {expected} argument(s), found {found}")]
    ArgumentCount {
        op: &'static str,
        expected: usize,
        found: usize,
    },

    /// The subject is empty or contains whitespace/control characters.
    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    /// The declared payload length is not a decimal integer.
    #[error("invalid payload length '{0}'")]
    InvalidLength(String),

    /// The declared payload length exceeds the configured maximum.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The byte following the declared payload is not a line terminator.
    #[error("payload length mismatch: no line terminator after {0} bytes")]
    MissingTerminator(usize),

    /// A command line exceeded the configured maximum length.
    #[error("line too long (max {max} bytes)")]
    LineTooLong { max: usize },

    /// The command line is not valid UTF-8.
    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    /// The `INFO` argument is not a JSON object.
    #[error("invalid INFO object: {0}")]
    InvalidInfo(String),

    /// The `-ERR` argument is not a JSON-quoted string.
    #[error("invalid -ERR message: {0}")]
    InvalidErrorMessage(String),

    /// The stream ended in the middle of a frame.
    #[error("stream ended inside a frame")]
    Truncated,
}

/// Errors produced by the stream codecs.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A frame could not be decoded.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// A subject cannot be represented on the wire.
    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred on the underlying stream.
    #[error("codec I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;
