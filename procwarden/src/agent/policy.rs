//! Restart and upgrade policies.
//!
//! A policy sequences two index-parameterized operations, `stop(i)` and
//! `start(i)`, over `count` items, and exposes the effective stop timeout.
//! Policies compose as decorators:
//!
//! ```ignore
//! use procwarden::agent::{AllAtOnce, StartBeforeStop, StopTimeout};
//!
//! let policy = StopTimeout::new(StartBeforeStop::new(AllAtOnce), Duration::from_secs(1));
//! agent.restart_program(&policy, &program_id).await?;
//! ```

use super::error::AgentError;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

/// The index-parameterized operations a policy sequences.
#[async_trait]
pub trait CycleOps: Send + Sync {
    /// Stops (and forgets) the `i`-th item.
    async fn stop(&self, index: usize) -> Result<(), AgentError>;

    /// Starts a replacement for the `i`-th item.
    async fn start(&self, index: usize) -> Result<(), AgentError>;
}

/// Tells the agent how to restart or upgrade instances of a running
/// program.
#[async_trait]
pub trait RestartPolicy: Send + Sync {
    /// Effective timeout handed to each stop operation.
    fn timeout(&self) -> Duration {
        Duration::ZERO
    }

    /// Drives `stop`/`start` over `count` items.
    async fn run(&self, count: usize, ops: &dyn CycleOps) -> Result<(), AgentError>;
}

#[async_trait]
impl<P> RestartPolicy for Arc<P>
where
    P: RestartPolicy + ?Sized,
{
    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    async fn run(&self, count: usize, ops: &dyn CycleOps) -> Result<(), AgentError> {
        (**self).run(count, ops).await
    }
}

// =============================================================================
// Built-in policies
// =============================================================================

/// Cycles every item concurrently; no ordering guarantee between items.
///
/// On failure, one representative error is surfaced and the rest are
/// dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllAtOnce;

#[async_trait]
impl RestartPolicy for AllAtOnce {
    async fn run(&self, count: usize, ops: &dyn CycleOps) -> Result<(), AgentError> {
        let cycles = (0..count).map(|index| async move {
            if let Err(error) = ops.stop(index).await {
                return Err(AgentError::policy("one-shot restart", "stopping", index, error));
            }
            if let Err(error) = ops.start(index).await {
                return Err(AgentError::policy("one-shot restart", "starting", index, error));
            }
            Ok(())
        });
        join_all(cycles)
            .await
            .into_iter()
            .find(|outcome| outcome.is_err())
            .unwrap_or(Ok(()))
    }
}

/// Cycles one item at a time, in order, aborting on the first error.
#[derive(Clone, Copy, Debug, Default)]
pub struct Rolling;

#[async_trait]
impl RestartPolicy for Rolling {
    async fn run(&self, count: usize, ops: &dyn CycleOps) -> Result<(), AgentError> {
        for index in 0..count {
            if let Err(error) = ops.stop(index).await {
                return Err(AgentError::policy("rolling restart", "stopping", index, error));
            }
            if let Err(error) = ops.start(index).await {
                return Err(AgentError::policy("rolling restart", "starting", index, error));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Decorators
// =============================================================================

/// Overrides the effective stop timeout of the wrapped policy. Ordering is
/// untouched.
#[derive(Clone, Debug)]
pub struct StopTimeout<P> {
    inner: P,
    timeout: Duration,
}

impl<P: RestartPolicy> StopTimeout<P> {
    pub fn new(inner: P, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<P: RestartPolicy> RestartPolicy for StopTimeout<P> {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, count: usize, ops: &dyn CycleOps) -> Result<(), AgentError> {
        self.inner.run(count, ops).await
    }
}

/// Starts the replacement before stopping the current instance, by swapping
/// the roles of the `stop` and `start` callbacks as seen by the wrapped
/// policy. Wrapping twice restores the original order.
#[derive(Clone, Debug)]
pub struct StartBeforeStop<P> {
    inner: P,
}

impl<P: RestartPolicy> StartBeforeStop<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

struct Swapped<'a> {
    ops: &'a dyn CycleOps,
}

#[async_trait]
impl CycleOps for Swapped<'_> {
    async fn stop(&self, index: usize) -> Result<(), AgentError> {
        self.ops.start(index).await
    }

    async fn start(&self, index: usize) -> Result<(), AgentError> {
        self.ops.stop(index).await
    }
}

#[async_trait]
impl<P: RestartPolicy> RestartPolicy for StartBeforeStop<P> {
    fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    async fn run(&self, count: usize, ops: &dyn CycleOps) -> Result<(), AgentError> {
        self.inner.run(count, &Swapped { ops }).await
    }
}
