//! Error types for agent operations.

use crate::backend::{BackendError, ProcessId, ProgramId};
use thiserror::Error;

/// Errors surfaced by the agent's public operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The referenced process is not in the index.
    #[error("no such process: {0}")]
    ProcessNotFound(ProcessId),

    /// The referenced program is not available at the backend.
    #[error("program {0} is not present")]
    ProgramNotPresent(ProgramId),

    /// The program has no live processes to cycle.
    #[error("no instance of program {0} is running")]
    NoInstances(ProgramId),

    /// A newly created process collided with an existing process ID.
    #[error("process is already managed: {0}")]
    AlreadyManaged(ProcessId),

    /// A backend call failed; the context says which operation.
    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: BackendError,
    },

    /// An operation under a multi-item policy failed. At most one
    /// representative underlying error is carried.
    #[error("{policy}, {action} process {index}: {source}")]
    Policy {
        policy: &'static str,
        action: &'static str,
        index: usize,
        #[source]
        source: Box<AgentError>,
    },

    /// A breadcrumb wrapped around an inner failure.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<AgentError>,
    },

    /// An index invariant was violated. Never silently ignored.
    #[error("internal inconsistency: {0}")]
    Inconsistent(String),
}

impl AgentError {
    pub(crate) fn backend(context: impl Into<String>, source: BackendError) -> Self {
        Self::Backend {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn policy(
        policy: &'static str,
        action: &'static str,
        index: usize,
        source: AgentError,
    ) -> Self {
        Self::Policy {
            policy,
            action,
            index,
            source: Box::new(source),
        }
    }

    pub(crate) fn context(context: impl Into<String>, source: AgentError) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_error_carries_breadcrumb() {
        let inner = AgentError::ProcessNotFound(ProcessId::new("p1"));
        let err = AgentError::policy("rolling restart", "stopping", 2, inner);
        let rendered = err.to_string();
        assert!(rendered.contains("rolling restart"));
        assert!(rendered.contains("stopping process 2"));
        assert!(rendered.contains("no such process: p1"));
    }

    #[test]
    fn test_backend_error_carries_context() {
        let err = AgentError::backend(
            "pulling program",
            BackendError::ProgramNotFound(ProgramId::new("g")),
        );
        assert!(err.to_string().starts_with("pulling program:"));
    }
}
