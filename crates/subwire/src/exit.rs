use std::fmt;
use std::io;

use subwire_broker::BrokerError;
use subwire_client::{ClientError, FatalCause};
use subwire_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrInUse => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::Spawn { .. } => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn broker_error(context: &str, err: BrokerError) -> CliError {
    match err {
        BrokerError::Transport(err) => transport_error(context, err),
        BrokerError::Setup(source) | BrokerError::Send(source) | BrokerError::Receive(source) => {
            io_error(context, source)
        }
        BrokerError::InvalidSubject(_) | BrokerError::DatagramTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        BrokerError::Closed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn client_error(context: &str, err: ClientError) -> CliError {
    match err {
        ClientError::Transport(err) => transport_error(context, err),
        ClientError::InvalidSubject(_) | ClientError::PayloadTooLarge { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        ClientError::Fatal(FatalCause::Protocol(_)) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        ClientError::Fatal(FatalCause::Io(_)) => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connection_maps_to_transport_code() {
        let err = transport_error(
            "connect failed",
            TransportError::Connect {
                addr: "127.0.0.1:1".to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            },
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
        assert!(err.message.starts_with("connect failed: "));
    }

    #[test]
    fn protocol_failure_maps_to_data_invalid() {
        let err = client_error(
            "receive failed",
            ClientError::Fatal(FatalCause::Protocol(subwire_proto::ParseError::Truncated)),
        );
        assert_eq!(err.code, DATA_INVALID);
    }

    #[test]
    fn closed_client_maps_to_failure() {
        assert_eq!(client_error("x", ClientError::Closed).code, FAILURE);
        assert_eq!(
            client_error("x", ClientError::Fatal(FatalCause::EndOfStream)).code,
            FAILURE
        );
    }
}
