//! Logging decorator for backends.
//!
//! Wraps any [`Backend`] and traces every operation with its outcome, so a
//! deployment can observe the exact call sequence the agent drives without
//! the backend itself knowing about logging.

use super::{Backend, BackendError, Process, ProcessId, Program, ProgramId};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A backend whose every call is logged.
pub struct LoggedBackend<B> {
    inner: B,
}

impl<B: Backend> LoggedBackend<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<B: Backend> Backend for LoggedBackend<B> {
    type Program = B::Program;
    type Process = LoggedProcess<B::Process>;

    fn program_id(&self, name: &str) -> ProgramId {
        self.inner.program_id(name)
    }

    async fn pull(&self, id: &ProgramId) -> Result<Self::Program, BackendError> {
        debug!(program_id = %id, "pulling program");
        match self.inner.pull(id).await {
            Ok(program) => {
                info!(program_id = %id, "pulled program");
                Ok(program)
            }
            Err(error) => {
                warn!(program_id = %id, error = %error, "failed pulling program");
                Err(error)
            }
        }
    }

    async fn get(&self, id: &ProgramId) -> Result<Option<Self::Program>, BackendError> {
        match self.inner.get(id).await {
            Ok(program) => {
                debug!(program_id = %id, found = program.is_some(), "got program");
                Ok(program)
            }
            Err(error) => {
                warn!(program_id = %id, error = %error, "failed getting program");
                Err(error)
            }
        }
    }

    async fn remove(&self, id: &ProgramId) -> Result<(), BackendError> {
        match self.inner.remove(id).await {
            Ok(()) => {
                info!(program_id = %id, "removed program");
                Ok(())
            }
            Err(error) => {
                warn!(program_id = %id, error = %error, "failed removing program");
                Err(error)
            }
        }
    }

    async fn create(&self, program: &Self::Program) -> Result<Self::Process, BackendError> {
        match self.inner.create(program).await {
            Ok(process) => {
                info!(program_id = %program.id(), process_id = %process.id(), "created process");
                Ok(LoggedProcess { inner: process })
            }
            Err(error) => {
                warn!(program_id = %program.id(), error = %error, "failed creating process");
                Err(error)
            }
        }
    }
}

/// A process whose every call is logged.
pub struct LoggedProcess<P> {
    inner: P,
}

impl<P: Process> LoggedProcess<P> {
    fn log_outcome(&self, operation: &str, result: &Result<(), BackendError>) {
        match result {
            Ok(()) => debug!(process_id = %self.inner.id(), "{operation} done"),
            Err(error) => {
                warn!(process_id = %self.inner.id(), error = %error, "{operation} failed")
            }
        }
    }
}

#[async_trait]
impl<P: Process> Process for LoggedProcess<P> {
    fn id(&self) -> &ProcessId {
        self.inner.id()
    }

    fn program_id(&self) -> &ProgramId {
        self.inner.program_id()
    }

    async fn start(&self) -> Result<(), BackendError> {
        debug!(process_id = %self.inner.id(), "starting process");
        let result = self.inner.start().await;
        self.log_outcome("starting process", &result);
        result
    }

    async fn stop(&self, timeout: Duration) -> Result<(), BackendError> {
        debug!(process_id = %self.inner.id(), timeout_ms = timeout.as_millis(), "stopping process");
        let result = self.inner.stop(timeout).await;
        self.log_outcome("stopping process", &result);
        result
    }

    async fn kill(&self) -> Result<(), BackendError> {
        debug!(process_id = %self.inner.id(), "killing process");
        let result = self.inner.kill().await;
        self.log_outcome("killing process", &result);
        result
    }

    async fn wait(&self) -> Result<(), BackendError> {
        let result = self.inner.wait().await;
        self.log_outcome("waiting for process", &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FakeBackend;

    #[tokio::test]
    async fn test_logged_backend_passes_calls_through() {
        let fake = FakeBackend::new();
        let logged = LoggedBackend::new(fake.clone());

        let id = logged.program_id("echoer v1");
        let program = logged.pull(&id).await.unwrap();
        let process = logged.create(&program).await.unwrap();
        process.start().await.unwrap();
        assert!(fake.is_running(process.id()));

        process.kill().await.unwrap();
        assert!(!fake.is_running(process.id()));
    }

    #[tokio::test]
    async fn test_logged_backend_passes_errors_through() {
        let fake = FakeBackend::new();
        let id = fake.program_id("flaky");
        fake.fail_next_pull(&id);

        let logged = LoggedBackend::new(fake);
        assert!(logged.pull(&id).await.is_err());
    }
}
