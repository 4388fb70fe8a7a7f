//! RPC façade over a bidirectional stream.
//!
//! The wire protocol is a stream of newline-delimited JSON objects, one per
//! message, with reads and writes interleaved on a single duplex
//! connection. A client sends
//!
//! ```json
//! { "method_name": "rpc/agent.StartProcess", "request": { "program_name": "echoer v1" } }
//! ```
//!
//! and the server answers
//!
//! ```json
//! { "response": { "process_id": "osprocess.process.…" }, "error": "" }
//! ```
//!
//! `error` is the empty string on success; any non-empty value denotes
//! failure and the response body is to be ignored. Requests are serviced in
//! arrival order per connection; concurrent connections are independent.

use crate::backend::{ProcessId, ProgramId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use thiserror::Error;

mod client;
mod server;

pub use client::AgentClient;
pub use server::AgentServer;

// =============================================================================
// Method names
// =============================================================================

pub const METHOD_START_PROCESS: &str = "rpc/agent.StartProcess";
pub const METHOD_STOP_PROCESS: &str = "rpc/agent.StopProcess";
pub const METHOD_LIST_ALL: &str = "rpc/agent.ListAll";

// =============================================================================
// Envelopes
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RequestEnvelope {
    pub method_name: String,
    #[serde(default)]
    pub request: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ResponseEnvelope {
    #[serde(default)]
    pub response: serde_json::Value,
    #[serde(default)]
    pub error: String,
}

impl ResponseEnvelope {
    pub(crate) fn success(response: serde_json::Value) -> Self {
        Self {
            response,
            error: String::new(),
        }
    }

    pub(crate) fn failure(error: impl Into<String>) -> Self {
        Self {
            response: serde_json::Value::Null,
            error: error.into(),
        }
    }
}

// =============================================================================
// Method payloads
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartProcessRequest {
    pub program_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartProcessResponse {
    pub process_id: ProcessId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopProcessRequest {
    pub process_id: ProcessId,
    /// Stop timeout in nanoseconds.
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopProcessResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListAllRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListAllResponse {
    #[serde(rename = "Running")]
    pub running: HashMap<ProgramId, Vec<ProcessId>>,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by the RPC client and server plumbing.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("reading rpc message: {0}")]
    Read(#[source] io::Error),

    #[error("sending rpc message: {0}")]
    Write(#[source] io::Error),

    #[error("decoding rpc message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("encoding rpc message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,

    /// The remote reported a failure through the error field.
    #[error("{0}")]
    Remote(String),
}
