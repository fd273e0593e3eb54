use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

#[cfg(unix)]
pub mod interfaces;
pub mod publish;
pub mod serve;
pub mod stdio;
pub mod subscribe;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Expose a backend over this process's stdin/stdout.
    Stdio(StdioArgs),
    /// Run an in-memory broker on a TCP address.
    Serve(ServeArgs),
    /// Publish a single message.
    Pub(PubArgs),
    /// Subscribe and print received messages.
    Sub(SubArgs),
    /// List IPv4 network interfaces usable for multicast.
    #[cfg(unix)]
    Interfaces(InterfacesArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Stdio(args) => stdio::run(args).await,
        Command::Serve(args) => serve::run(args, format).await,
        Command::Pub(args) => publish::run(args).await,
        Command::Sub(args) => subscribe::run(args, format).await,
        #[cfg(unix)]
        Command::Interfaces(args) => interfaces::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum BackendKind {
    /// Loopback broker: the session only hears its own publications.
    Memory,
    /// UDP multicast group shared with every peer on the segment.
    Multicast,
}

#[derive(Args, Debug)]
pub struct StdioArgs {
    /// Backend to expose.
    #[arg(long, value_enum, default_value = "memory", env = "SUBWIRE_BACKEND")]
    pub backend: BackendKind,
    /// Multicast group address and port.
    #[arg(long, default_value = "224.0.0.1:9999", env = "SUBWIRE_MULTICAST_GROUP")]
    pub group: String,
    /// Interface name or IPv4 address to join the group on.
    #[arg(long, env = "SUBWIRE_MULTICAST_INTERFACE")]
    pub interface: Option<String>,
    /// Socket receive buffer and maximum datagram size in bytes.
    #[arg(long, default_value = "8192", env = "SUBWIRE_RECV_BUFFER")]
    pub recv_buffer: usize,
    /// How long multicast nonces are remembered (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s", env = "SUBWIRE_NONCE_TTL")]
    pub nonce_ttl: String,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// TCP address to bind (port 0 picks a free port).
    #[arg(default_value = "127.0.0.1:4222", env = "SUBWIRE_LISTEN")]
    pub addr: String,
    /// Per-session delivery queue capacity.
    #[arg(long, default_value = "64")]
    pub sink_queue: usize,
    /// Broker name announced in INFO.
    #[arg(long, default_value = "subwire-memory")]
    pub name: String,
}

#[derive(Args, Debug)]
pub struct PubArgs {
    /// Backend to connect to: `host:port`, or `exec:<program> [args...]`.
    pub target: String,
    /// Subject to publish on.
    pub subject: String,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Maximum time to wait for the backend (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct SubArgs {
    /// Backend to connect to: `host:port`, or `exec:<program> [args...]`.
    pub target: String,
    /// Subject to subscribe to.
    pub subject: String,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Maximum time to wait for the backend (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[cfg(unix)]
#[derive(Args, Debug, Default)]
pub struct InterfacesArgs {
    /// Only list interfaces that are up and multicast-capable.
    #[arg(long)]
    pub multicast: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Where `pub`/`sub` find their backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tcp(String),
    Exec { program: String, args: Vec<String> },
}

impl Target {
    pub fn parse(input: &str) -> CliResult<Self> {
        let input = input.trim();
        if let Some(command) = input.strip_prefix("exec:") {
            let mut words = command.split_whitespace().map(str::to_string);
            let program = words
                .next()
                .ok_or_else(|| CliError::new(USAGE, "exec: target needs a program"))?;
            return Ok(Self::Exec {
                program,
                args: words.collect(),
            });
        }
        if input.is_empty() {
            return Err(CliError::new(USAGE, "target must not be empty"));
        }
        Ok(Self::Tcp(input.to_string()))
    }

    pub async fn open(&self) -> Result<subwire_client::Client, subwire_client::ClientError> {
        match self {
            Self::Tcp(addr) => subwire_client::Client::connect_tcp(addr).await,
            Self::Exec { program, args } => subwire_client::Client::spawn(program, args),
        }
    }
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("fast").is_err());
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
    }

    #[test]
    fn targets_parse() {
        assert_eq!(
            Target::parse("127.0.0.1:4222").unwrap(),
            Target::Tcp("127.0.0.1:4222".to_string())
        );
        assert_eq!(
            Target::parse("exec:subwire stdio --backend memory").unwrap(),
            Target::Exec {
                program: "subwire".to_string(),
                args: vec!["stdio".into(), "--backend".into(), "memory".into()],
            }
        );
        assert!(Target::parse("exec:").is_err());
        assert!(Target::parse("  ").is_err());
    }
}
