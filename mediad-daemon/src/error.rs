use std::net::SocketAddr;

use thiserror::Error;

/// Error surface for the daemon runtime, request server and diagnostics.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind request server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] mediad_core::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to install handler for {signal}: {source}")]
    Signal {
        signal: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("request protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (nothing listening on {addr})")]
    NotRunning { addr: SocketAddr },
}

pub(crate) fn io_err(context: impl Into<String>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        context: context.into(),
        source,
    }
}
