use std::sync::Arc;

use subwire_broker::{BrokerListener, MemoryBroker, MemoryBrokerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cmd::ServeArgs;
use crate::exit::{broker_error, CliResult, SUCCESS};
use crate::output::{print_listening, OutputFormat};

pub async fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let broker = MemoryBroker::with_config(MemoryBrokerConfig {
        name: args.name,
        sink_queue: args.sink_queue,
    });
    let listener = BrokerListener::bind(&args.addr, Arc::new(broker))
        .await
        .map_err(|err| broker_error("bind failed", err))?;
    print_listening(listener.local_addr(), format);

    let shutdown = CancellationToken::new();
    install_ctrlc_handler(shutdown.clone());

    listener
        .run(shutdown)
        .await
        .map_err(|err| broker_error("broker failed", err))?;

    Ok(SUCCESS)
}

fn install_ctrlc_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
            Err(err) => warn!(%err, "signal handler setup failed"),
        }
    });
}
