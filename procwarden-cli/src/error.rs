//! Centralized CLI error handling with user-friendly messages.

use procwarden::agent::AgentError;
use procwarden::rpc::RpcError;
use std::io;
use thiserror::Error;

/// Errors surfaced to the CLI user.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to initialize logging: {0}")]
    LoggingInit(#[source] io::Error),

    #[error("can't reach {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("can't listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}
