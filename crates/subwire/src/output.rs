use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
#[cfg(unix)]
use subwire_transport::InterfaceAddr;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    subject: &'a str,
    payload_size: usize,
    payload: String,
    timestamp: String,
}

pub fn print_message(subject: &str, payload: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                subject,
                payload_size: payload.len(),
                payload: payload_preview(payload),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SUBJECT", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    subject.to_string(),
                    payload.len().to_string(),
                    payload_preview(payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "subject={} size={} payload={}",
                subject,
                payload.len(),
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => {
            let mut out = std::io::stdout();
            let _ = out.write_all(payload);
            let _ = out.write_all(b"\n");
            let _ = out.flush();
        }
    }
}

#[derive(Serialize)]
struct ListeningOutput {
    event: &'static str,
    addr: String,
}

/// Announce the bound address on stdout so callers binding port 0 can find it.
pub fn print_listening(addr: SocketAddr, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ListeningOutput {
                event: "listening",
                addr: addr.to_string(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => println!("listening on {addr}"),
        OutputFormat::Raw => println!("{addr}"),
    }
    let _ = std::io::stdout().flush();
}

#[cfg(unix)]
#[derive(Serialize)]
struct InterfaceOutput<'a> {
    name: &'a str,
    addr: String,
    up: bool,
    loopback: bool,
    multicast: bool,
}

#[cfg(unix)]
pub fn print_interfaces(interfaces: &[InterfaceAddr], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out: Vec<InterfaceOutput<'_>> = interfaces
                .iter()
                .map(|iface| InterfaceOutput {
                    name: &iface.name,
                    addr: iface.addr.to_string(),
                    up: iface.up,
                    loopback: iface.loopback,
                    multicast: iface.multicast,
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "[]".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["NAME", "ADDRESS", "FLAGS"]);
            for iface in interfaces {
                table.add_row(vec![
                    iface.name.clone(),
                    iface.addr.to_string(),
                    interface_flags(iface),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for iface in interfaces {
                println!("{} {} {}", iface.name, iface.addr, interface_flags(iface));
            }
        }
    }
}

#[cfg(unix)]
fn interface_flags(iface: &InterfaceAddr) -> String {
    let mut flags = Vec::new();
    if iface.up {
        flags.push("up");
    }
    if iface.loopback {
        flags.push("loopback");
    }
    if iface.multicast {
        flags.push("multicast");
    }
    flags.join(",")
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
