//! Container backend contract.
//!
//! A backend is the runtime that realizes programs and processes for the
//! agent. It exposes two logical sub-services:
//!
//! - the **program service** (`pull`, `get`, `remove`) resolves a
//!   [`ProgramId`] into a concrete artifact (an executable looked up on the
//!   host, a container image, ...);
//! - the **process service** (`create`) allocates a not-yet-running
//!   [`Process`] from a resolved [`Program`].
//!
//! The agent is generic over the backend, so IDs stay opaque to the agent
//! while remaining concrete within their backend. An ID minted by one
//! backend is never accepted by another; backends reject foreign IDs with a
//! descriptive error rather than a panic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub mod fake;
pub mod logging;
pub mod osprocess;

pub use fake::{BackendCall, FakeBackend};
pub use logging::LoggedBackend;
pub use osprocess::{Installer, NopInstaller, OsBackend};

// =============================================================================
// Identifiers
// =============================================================================

/// Names a template for execution (an image, an executable with arguments).
///
/// The textual form is stable and injective per backend, e.g.
/// `osprocess.program.echoer v1`. Serializes transparently as text.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramId(String);

impl ProgramId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one running instance of a program.
///
/// Unique within the agent for the lifetime of the instance, and stable
/// across in-place restarts performed by the lifecycle controller.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The program is not available at the backend.
    #[error("program {0} is not installed")]
    ProgramNotFound(ProgramId),

    /// A program ID from a different backend's namespace was presented.
    #[error("program ID {0} does not belong to the {1} backend")]
    ForeignProgramId(ProgramId, &'static str),

    /// Installing or uninstalling the program artifact failed.
    #[error("installing program {name}: {reason}")]
    InstallFailed { name: String, reason: String },

    /// The process has no live execution to operate on.
    #[error("process {0} has no live execution")]
    NotRunning(ProcessId),

    /// The current execution ended abnormally.
    #[error("process {id} exited abnormally: {status}")]
    AbnormalExit { id: ProcessId, status: String },

    /// An OS-level operation failed.
    #[error("{operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },

    /// Any other backend-specific failure.
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    pub(crate) fn io(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }
}

// =============================================================================
// Capability traits
// =============================================================================

/// A resolved, backend-specific artifact produced by pulling or getting a
/// [`ProgramId`]. Immutable once obtained.
pub trait Program: Clone + Send + Sync + 'static {
    /// The ID this artifact was resolved from.
    fn id(&self) -> &ProgramId;
}

/// A live execution of a program.
///
/// `start` may be called again after an exit to restart in place; the
/// implementation releases any previous execution handle before re-launching
/// and the [`ProcessId`] stays stable. At most one `wait` is outstanding at
/// a time.
#[async_trait]
pub trait Process: Send + Sync + 'static {
    fn id(&self) -> &ProcessId;

    /// The ID of the program this process executes.
    fn program_id(&self) -> &ProgramId;

    /// Begins (or re-begins) execution.
    async fn start(&self) -> Result<(), BackendError>;

    /// Requests graceful termination and returns promptly. The timeout is
    /// advisory to the backend; the agent enforces the hard bound.
    async fn stop(&self, timeout: Duration) -> Result<(), BackendError>;

    /// Forces termination.
    async fn kill(&self) -> Result<(), BackendError>;

    /// Blocks until the current execution exits. An error means the exit
    /// itself was anomalous; callers treat any return as "the execution
    /// ended".
    async fn wait(&self) -> Result<(), BackendError>;
}

/// The capability surface the agent consumes from a runtime.
///
/// Backends tolerate concurrent calls on different processes; concurrent
/// calls on the same process only ever come from that process's lifecycle
/// controller.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Program: Program;
    type Process: Process;

    /// Translates a human-readable program name into this backend's ID
    /// namespace.
    fn program_id(&self, name: &str) -> ProgramId;

    // --- program service ---

    /// Ensures the artifact exists locally, fetching it if absent.
    async fn pull(&self, id: &ProgramId) -> Result<Self::Program, BackendError>;

    /// Returns the artifact if already available; `None` signals absence
    /// without error.
    async fn get(&self, id: &ProgramId) -> Result<Option<Self::Program>, BackendError>;

    /// Releases the artifact; idempotent if absent.
    async fn remove(&self, id: &ProgramId) -> Result<(), BackendError>;

    // --- process service ---

    /// Allocates a not-yet-running instance and assigns its [`ProcessId`].
    async fn create(&self, program: &Self::Program) -> Result<Self::Process, BackendError>;
}
