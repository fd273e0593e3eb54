use std::net::SocketAddrV4;
use std::sync::Arc;

use subwire_broker::{
    serve_stdio, Backend, MemoryBroker, MulticastBackend, MulticastConfig, ServeConfig,
};
use tracing::info;

use crate::cmd::{parse_duration, BackendKind, StdioArgs};
use crate::exit::{broker_error, CliError, CliResult, SUCCESS, USAGE};

pub async fn run(args: StdioArgs) -> CliResult<i32> {
    let backend: Arc<dyn Backend> = match args.backend {
        BackendKind::Memory => Arc::new(MemoryBroker::new().session()),
        BackendKind::Multicast => Arc::new(
            MulticastBackend::bind(multicast_config(&args)?)
                .map_err(|err| broker_error("multicast setup failed", err))?,
        ),
    };

    info!(backend = ?args.backend, "serving over stdio");
    serve_stdio(backend, ServeConfig::default())
        .await
        .map_err(|err| broker_error("session failed", err))?;

    Ok(SUCCESS)
}

fn multicast_config(args: &StdioArgs) -> CliResult<MulticastConfig> {
    let group: SocketAddrV4 = args.group.parse().map_err(|_| {
        CliError::new(
            USAGE,
            format!("invalid multicast group '{}': expected ADDR:PORT", args.group),
        )
    })?;

    Ok(MulticastConfig {
        group,
        interface: args.interface.clone(),
        recv_buffer_size: args.recv_buffer,
        nonce_ttl: parse_duration(&args.nonce_ttl)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn args(group: &str) -> StdioArgs {
        StdioArgs {
            backend: BackendKind::Multicast,
            group: group.to_string(),
            interface: Some("eth0".to_string()),
            recv_buffer: 4096,
            nonce_ttl: "3s".to_string(),
        }
    }

    #[test]
    fn builds_multicast_config_from_flags() {
        let config = multicast_config(&args("239.1.2.3:5000")).unwrap();
        assert_eq!(config.group.to_string(), "239.1.2.3:5000");
        assert_eq!(config.interface.as_deref(), Some("eth0"));
        assert_eq!(config.recv_buffer_size, 4096);
        assert_eq!(config.nonce_ttl, Duration::from_secs(3));
    }

    #[test]
    fn rejects_group_without_port() {
        let err = multicast_config(&args("239.1.2.3")).unwrap_err();
        assert_eq!(err.code, USAGE);
    }
}
