//! Choosing which watch to connect to.
//!
//! Command-line options win over the `PEBBLE_PHONE` and `PEBBLE_QEMU`
//! environment variables; with none of them set there is nothing to connect to.

use std::path::Path;

use crate::cli::{EmulatorPlatform, SharedArgs};
use crate::error::ConnectionError;
use crate::transport::Transport;

pub const DEFAULT_PHONE_PORT: u16 = 9000;
pub const DEFAULT_QEMU_PORT: u16 = 12344;
const DEFAULT_QEMU_HOST: &str = "127.0.0.1";

/// Where the watch lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    Phone { host: String, port: u16 },
    Qemu { host: String, port: u16 },
    Emulator(EmulatorPlatform),
}

impl ConnectionTarget {
    /// Resolve from the shared options, falling back to the environment.
    pub fn resolve(
        args: &SharedArgs,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConnectionError> {
        if let Some(phone) = &args.phone {
            return parse_phone(phone);
        }
        if let Some(qemu) = &args.qemu {
            return parse_qemu(qemu);
        }
        if let Some(platform) = args.emulator {
            return Ok(Self::Emulator(platform));
        }
        if let Some(phone) = env("PEBBLE_PHONE") {
            return parse_phone(&phone);
        }
        if let Some(qemu) = env("PEBBLE_QEMU") {
            return parse_qemu(&qemu);
        }
        Err(ConnectionError::NotSpecified)
    }

    /// Only a managed emulator needs the persist directory.
    pub fn transport(&self, persist_dir: Option<&Path>) -> Result<Transport, ConnectionError> {
        Ok(match self {
            Self::Phone { host, port } => Transport::WebSocket {
                host: host.clone(),
                port: *port,
            },
            Self::Qemu { host, port } => Transport::Qemu {
                host: host.clone(),
                port: *port,
            },
            Self::Emulator(platform) => {
                let dir = persist_dir.ok_or_else(|| {
                    ConnectionError::EmulatorState("no SDK directory to look up running emulators".into())
                })?;
                Transport::managed_emulator(*platform, dir)
            }
        })
    }
}

/// Split `host[:port]`. The port only counts when there are exactly two parts.
fn split_host_port(value: &str, default_port: u16) -> Result<(String, u16), ConnectionError> {
    let parts: Vec<&str> = value.split(':').collect();
    let port = if parts.len() == 2 {
        parts[1]
            .trim()
            .parse()
            .map_err(|_| ConnectionError::InvalidPort(value.to_string()))?
    } else {
        default_port
    };
    Ok((parts[0].to_string(), port))
}

fn parse_phone(value: &str) -> Result<ConnectionTarget, ConnectionError> {
    let (host, port) = split_host_port(value, DEFAULT_PHONE_PORT)?;
    Ok(ConnectionTarget::Phone { host, port })
}

fn parse_qemu(value: &str) -> Result<ConnectionTarget, ConnectionError> {
    let (mut host, port) = split_host_port(value, DEFAULT_QEMU_PORT)?;
    if host.is_empty() {
        host = DEFAULT_QEMU_HOST.to_string();
    }
    Ok(ConnectionTarget::Qemu { host, port })
}
