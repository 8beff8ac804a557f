//! Error types for update checks and watch connections.

use thiserror::Error;

/// Failure of a single update check request.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{status} ({reason})")]
    Status { status: u16, reason: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Failure to resolve or open a watch connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("No pebble connection specified.")]
    NotSpecified,

    #[error("Invalid port in '{0}'")]
    InvalidPort(String),

    #[error("Failed to connect to {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("WebSocket handshake with {target} failed: {reason}")]
    Handshake { target: String, reason: String },

    #[error("No running {0} emulator found. Start one before connecting with --emulator.")]
    EmulatorNotRunning(String),

    #[error("Failed to read emulator state: {0}")]
    EmulatorState(String),

    #[error("WebSocket protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed by the watch")]
    Closed,
}
