use std::collections::BTreeMap;

use bytes::Bytes;

/// Backend descriptor carried by `INFO`. Values are always exposed as strings;
/// numeric literals keep their exact textual form.
pub type InfoMap = BTreeMap<String, String>;

/// A decoded client-to-backend frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOperation {
    /// `SUB <subject>`
    Subscribe { subject: String },
    /// `UNSUB <subject>`
    Unsubscribe { subject: String },
    /// `PUB <subject> <n>` followed by the payload.
    Publish { subject: String, payload: Bytes },
}

impl ClientOperation {
    pub fn subscribe(subject: impl Into<String>) -> Self {
        Self::Subscribe {
            subject: subject.into(),
        }
    }

    pub fn unsubscribe(subject: impl Into<String>) -> Self {
        Self::Unsubscribe {
            subject: subject.into(),
        }
    }

    pub fn publish(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::Publish {
            subject: subject.into(),
            payload: payload.into(),
        }
    }

    /// Subject the operation targets.
    pub fn subject(&self) -> &str {
        match self {
            Self::Subscribe { subject }
            | Self::Unsubscribe { subject }
            | Self::Publish { subject, .. } => subject,
        }
    }

    /// Wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "SUB",
            Self::Unsubscribe { .. } => "UNSUB",
            Self::Publish { .. } => "PUB",
        }
    }
}

/// A decoded backend-to-client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOperation {
    /// `INFO <json-object>`
    Info(InfoMap),
    /// `MSG <subject> <n>` followed by the payload.
    Message { subject: String, payload: Bytes },
    /// `+OK`
    Ok,
    /// `-ERR <message>`
    Error(String),
}

impl ServerOperation {
    pub fn message(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::Message {
            subject: subject.into(),
            payload: payload.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Info(_) => "INFO",
            Self::Message { .. } => "MSG",
            Self::Ok => "+OK",
            Self::Error(_) => "-ERR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_operation_accessors() {
        let op = ClientOperation::publish("orders", &b"x"[..]);
        assert_eq!(op.subject(), "orders");
        assert_eq!(op.name(), "PUB");
        assert_eq!(ClientOperation::subscribe("a").name(), "SUB");
        assert_eq!(ClientOperation::unsubscribe("a").name(), "UNSUB");
    }

    #[test]
    fn server_operation_names() {
        assert_eq!(ServerOperation::Info(InfoMap::new()).name(), "INFO");
        assert_eq!(ServerOperation::message("s", Bytes::new()).name(), "MSG");
        assert_eq!(ServerOperation::Ok.name(), "+OK");
        assert_eq!(ServerOperation::error("boom").name(), "-ERR");
    }
}
