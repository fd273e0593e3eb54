use std::fs;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::cmd::{parse_duration, PubArgs, Target};
use crate::exit::{client_error, io_error, CliError, CliResult, SUCCESS, TIMEOUT};

pub async fn run(args: PubArgs) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let target = Target::parse(&args.target)?;
    let payload = resolve_payload(&args)?;

    let client = within(timeout, "connect", target.open())
        .await?
        .map_err(|err| client_error("connect failed", err))?;
    let info = within(timeout, "handshake", client.info())
        .await?
        .map_err(|err| client_error("handshake failed", err))?;
    debug!(?info, "connected");

    let subscription = client
        .dial(&args.subject)
        .await
        .map_err(|err| client_error("subscribe failed", err))?;
    subscription
        .send(payload)
        .await
        .map_err(|err| client_error("publish failed", err))?;

    drop(subscription);
    client.close().await;
    Ok(SUCCESS)
}

fn resolve_payload(args: &PubArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}

/// Bound `future` by `limit`, reporting a timeout as a CLI error.
pub(crate) async fn within<F: Future>(limit: Duration, what: &str, future: F) -> CliResult<F::Output> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| CliError::new(TIMEOUT, format!("{what} timed out after {limit:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> PubArgs {
        PubArgs {
            target: "127.0.0.1:4222".to_string(),
            subject: "mytopic".to_string(),
            data: None,
            file: None,
            timeout: "5s".to_string(),
        }
    }

    #[test]
    fn payload_defaults_to_empty() {
        assert!(resolve_payload(&args()).unwrap().is_empty());
    }

    #[test]
    fn payload_from_data_flag() {
        let args = PubArgs {
            data: Some("hello".to_string()),
            ..args()
        };
        assert_eq!(resolve_payload(&args).unwrap(), b"hello");
    }

    #[test]
    fn missing_file_is_reported() {
        let args = PubArgs {
            file: Some("/nonexistent/subwire-payload".into()),
            ..args()
        };
        let err = resolve_payload(&args).unwrap_err();
        assert!(err.message.contains("failed reading"));
    }

    #[tokio::test]
    async fn within_reports_timeout() {
        let err = within(
            Duration::from_millis(10),
            "handshake",
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, TIMEOUT);
    }
}
