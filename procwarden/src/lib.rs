//! Procwarden - per-machine supervisor for long-running programs
//!
//! This library implements the agent half of a fleet supervisor: the
//! component that owns the concrete processes on one machine. A central
//! supervisor (out of scope here) tells each agent what to keep running;
//! the agent spawns and monitors the actual program instances through a
//! pluggable container [`backend`], restarts them when they die
//! unexpectedly, and cycles them under a configurable [`agent::policy`]
//! when the operator requests a rolling restart or an upgrade.
//!
//! # High-Level API
//!
//! ```ignore
//! use procwarden::agent::Agent;
//! use procwarden::backend::{Backend, LoggedBackend, OsBackend};
//! use procwarden::config::PolicySettings;
//!
//! let backend = LoggedBackend::new(OsBackend::new());
//! let program_id = backend.program_id("echoer v1");
//! let agent = Agent::new(backend);
//!
//! let process_id = agent.start_process(&program_id).await?;
//! let policy = PolicySettings::default().build();
//! agent.restart_program(&policy, &program_id).await?;
//! ```
//!
//! The [`rpc`] module exposes the same operations over a newline-delimited
//! JSON stream for remote drivers.

pub mod agent;
pub mod backend;
pub mod config;
pub mod logging;
pub mod rpc;

/// Version of the procwarden library and CLI.
///
/// Synchronized across all components in the workspace; defined in
/// `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
