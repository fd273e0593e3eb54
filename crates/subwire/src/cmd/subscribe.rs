use subwire_client::ClientError;
use tracing::{debug, info};

use crate::cmd::publish::within;
use crate::cmd::{parse_duration, SubArgs, Target};
use crate::exit::{client_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub async fn run(args: SubArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let target = Target::parse(&args.target)?;

    let client = within(timeout, "connect", target.open())
        .await?
        .map_err(|err| client_error("connect failed", err))?;
    let backend = within(timeout, "handshake", client.info())
        .await?
        .map_err(|err| client_error("handshake failed", err))?;
    debug!(?backend, "connected");

    let subscription = client
        .dial(&args.subject)
        .await
        .map_err(|err| client_error("subscribe failed", err))?;
    info!(subject = %args.subject, "subscribed");

    let mut printed = 0usize;
    loop {
        let received = tokio::select! {
            received = subscription.receive() => received,
            _ = tokio::signal::ctrl_c() => break,
        };
        let payload = match received {
            Ok(payload) => payload,
            Err(ClientError::Closed) => {
                let err = client
                    .fatal_error()
                    .map_or(ClientError::Closed, ClientError::Fatal);
                return Err(client_error("receive failed", err));
            }
            Err(err) => return Err(client_error("receive failed", err)),
        };

        print_message(&args.subject, &payload, format);
        printed = printed.saturating_add(1);

        if let Some(count) = args.count {
            if printed >= count {
                break;
            }
        }
    }

    let stats = subscription.stats();
    debug!(
        received = stats.received_messages,
        bytes = stats.received_bytes,
        dropped = stats.dropped,
        "subscription finished"
    );
    drop(subscription);
    client.close().await;
    Ok(SUCCESS)
}
