//! Per-process lifecycle controller.
//!
//! Every process the agent starts is wrapped in a [`ManagedProcess`] that
//! hosts two cooperating background activities for the life of the process:
//!
//! - the **keep-alive activity** waits on the process and relaunches it in
//!   place when it exits unexpectedly, retrying on a fixed cadence;
//! - the **drain activity** listens on a single-slot stop mailbox and tears
//!   the process down with graceful-then-forceful semantics.
//!
//! The two interleave only through the done-signal: once a drain begins, the
//! keep-alive observes the signal on its next loop and quits instead of
//! relaunching. There is a deliberate race window in which the keep-alive
//! may have just relaunched the process; the drain then stops or kills that
//! new invocation, which is the intended outcome.
//!
//! Activities never call back into the agent's locks; errors that arise
//! after the public call returned are reported through an [`ErrorSink`].

use super::error::AgentError;
use crate::backend::{Backend, Process, ProcessId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Fixed delay between relaunch attempts of the keep-alive activity.
pub(crate) const RELAUNCH_RETRY_DELAY: Duration = Duration::from_millis(500);

// =============================================================================
// Error sink
// =============================================================================

/// Capability for reporting errors that arise out-of-band, after the public
/// call that spawned the work has already returned.
pub trait ErrorSink: Send + Sync + 'static {
    fn report(&self, error: AgentError);
}

/// Default sink: log the error and move on.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, error: AgentError) {
        error!(error = %error, "unexpected error");
    }
}

// =============================================================================
// Managed process
// =============================================================================

struct StopRequest {
    timeout: Duration,
    done: oneshot::Sender<()>,
}

/// A process plus its supervising activities.
///
/// Created exclusively by the agent when a process starts; dropped from the
/// index after a stop request has drained. The activities hold shared
/// references that outlive the index entry.
pub struct ManagedProcess<B: Backend> {
    program: B::Program,
    process: Arc<B::Process>,
    stop_tx: mpsc::Sender<StopRequest>,
    drained: CancellationToken,
}

impl<B: Backend> ManagedProcess<B> {
    /// Wraps a just-started process and spawns its two activities.
    pub(crate) fn manage(
        program: B::Program,
        process: B::Process,
        errors: Arc<dyn ErrorSink>,
    ) -> Arc<Self> {
        let process = Arc::new(process);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let done = CancellationToken::new();
        let drained = CancellationToken::new();

        tokio::spawn(keep_alive(
            Arc::clone(&process),
            done.clone(),
            Arc::clone(&errors),
        ));
        tokio::spawn(drain(
            Arc::clone(&process),
            stop_rx,
            done,
            drained.clone(),
            errors,
        ));

        Arc::new(Self {
            program,
            process,
            stop_tx,
            drained,
        })
    }

    pub fn process_id(&self) -> &ProcessId {
        self.process.id()
    }

    pub fn program(&self) -> &B::Program {
        &self.program
    }

    /// Requests a drain with the given stop timeout and waits until it
    /// completes.
    ///
    /// The mailbox holds a single request; a concurrent duplicate does not
    /// race a second teardown but blocks on the same drained-signal, so
    /// every caller observes the real completion.
    pub(crate) async fn stop(&self, timeout: Duration) {
        let (done_tx, done_rx) = oneshot::channel();
        let request = StopRequest {
            timeout,
            done: done_tx,
        };
        match self.stop_tx.try_send(request) {
            Ok(()) => {
                let _ = done_rx.await;
            }
            Err(_) => self.drained.cancelled().await,
        }
    }
}

// =============================================================================
// Keep-alive activity
// =============================================================================

async fn keep_alive<P: Process>(
    process: Arc<P>,
    done: CancellationToken,
    errors: Arc<dyn ErrorSink>,
) {
    loop {
        let exited = process.wait().await;
        if done.is_cancelled() {
            return; // expected to die
        }
        if let Err(cause) = exited {
            errors.report(AgentError::backend(
                format!("waiting for process {}", process.id()),
                cause,
            ));
        }

        // Relaunch in place; the process ID stays stable.
        loop {
            match process.start().await {
                Ok(()) => {
                    debug!(process_id = %process.id(), "relaunched process");
                    break;
                }
                Err(cause) => {
                    if done.is_cancelled() {
                        return; // expected to die
                    }
                    errors.report(AgentError::backend(
                        format!("trying to restart process {}", process.id()),
                        cause,
                    ));
                    tokio::time::sleep(RELAUNCH_RETRY_DELAY).await;
                }
            }
        }
    }
}

// =============================================================================
// Drain activity
// =============================================================================

async fn drain<P: Process>(
    process: Arc<P>,
    mut stop_rx: mpsc::Receiver<StopRequest>,
    done: CancellationToken,
    drained: CancellationToken,
    errors: Arc<dyn ErrorSink>,
) {
    let Some(request) = stop_rx.recv().await else {
        return; // owner went away without ever requesting a stop
    };

    // From here on, any exit the keep-alive observes is expected.
    done.cancel();

    let mut graceful = false;
    if !request.timeout.is_zero() {
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let stopper = Arc::clone(&process);
        let stop_errors = Arc::clone(&errors);
        let timeout = request.timeout;
        tokio::spawn(async move {
            match stopper.stop(timeout).await {
                Ok(()) => {
                    let _ = stopped_tx.send(());
                }
                Err(cause) => stop_errors.report(AgentError::backend(
                    format!("stopping process {}", stopper.id()),
                    cause,
                )),
            }
        });

        // Give it a chance to stop cleanly.
        graceful = tokio::select! {
            _ = tokio::time::sleep(request.timeout) => false,
            outcome = stopped_rx => outcome.is_ok(),
        };
    }

    if !graceful {
        if let Err(cause) = process.kill().await {
            errors.report(AgentError::backend(
                format!("killing process {}", process.id()),
                cause,
            ));
        }
    }

    let _ = request.done.send(());
    drained.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend as _, BackendCall, FakeBackend, Process as _};
    use std::sync::Mutex;

    /// Sink that collects reported errors for assertions.
    #[derive(Default)]
    struct CollectingSink {
        reports: Mutex<Vec<String>>,
    }

    impl ErrorSink for CollectingSink {
        fn report(&self, error: AgentError) {
            self.reports.lock().unwrap().push(error.to_string());
        }
    }

    async fn managed_process(
        backend: &FakeBackend,
    ) -> (Arc<ManagedProcess<FakeBackend>>, Arc<CollectingSink>) {
        let program = backend.pull(&backend.program_id("echoer v1")).await.unwrap();
        let process = backend.create(&program).await.unwrap();
        process.start().await.unwrap();
        let sink = Arc::new(CollectingSink::default());
        let managed = ManagedProcess::manage(program, process, sink.clone());
        (managed, sink)
    }

    async fn until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_exit_is_relaunched_under_same_id() {
        let backend = FakeBackend::new();
        let (managed, _sink) = managed_process(&backend).await;
        let id = managed.process_id().clone();
        assert_eq!(backend.start_count(&id), 1);

        backend.terminate(&id);
        until(|| backend.start_count(&id) == 2).await;
        assert!(backend.is_running(&id));

        managed.stop(Duration::ZERO).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaunch_retries_on_fixed_cadence() {
        let backend = FakeBackend::new();
        let (managed, sink) = managed_process(&backend).await;
        let id = managed.process_id().clone();

        backend.fail_next_starts(&id, 2);
        backend.terminate(&id);

        until(|| backend.start_count(&id) == 2).await;
        // Two failed attempts were reported before the successful one.
        assert_eq!(sink.reports.lock().unwrap().len(), 3); // wait error + 2 start errors

        managed.stop(Duration::ZERO).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_within_timeout_skips_kill() {
        let backend = FakeBackend::new();
        let (managed, _sink) = managed_process(&backend).await;
        let id = managed.process_id().clone();

        managed.stop(Duration::from_secs(1)).await;

        let calls = backend.calls();
        assert!(calls.contains(&BackendCall::Stop(id.clone(), Duration::from_secs(1))));
        assert!(!calls.iter().any(|call| matches!(call, BackendCall::Kill(_))));
        assert!(!backend.is_running(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_kills_immediately() {
        let backend = FakeBackend::new();
        let (managed, _sink) = managed_process(&backend).await;
        let id = managed.process_id().clone();

        managed.stop(Duration::ZERO).await;

        let calls = backend.calls();
        assert!(!calls.iter().any(|call| matches!(call, BackendCall::Stop(..))));
        assert!(calls.contains(&BackendCall::Kill(id.clone())));
        assert!(!backend.is_running(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_stop_escalates_to_kill_after_timeout() {
        let backend = FakeBackend::new();
        backend.set_stop_terminates(false);
        let (managed, _sink) = managed_process(&backend).await;
        let id = managed.process_id().clone();

        managed.stop(Duration::from_millis(50)).await;

        let calls = backend.calls();
        assert!(calls.contains(&BackendCall::Stop(id.clone(), Duration::from_millis(50))));
        assert!(calls.contains(&BackendCall::Kill(id.clone())));
        assert!(!backend.is_running(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_stop_observes_real_completion() {
        let backend = FakeBackend::new();
        backend.set_stop_terminates(false);
        let (managed, _sink) = managed_process(&backend).await;
        let id = managed.process_id().clone();

        let first = {
            let managed = Arc::clone(&managed);
            tokio::spawn(async move { managed.stop(Duration::from_millis(100)).await })
        };
        let second = {
            let managed = Arc::clone(&managed);
            tokio::spawn(async move { managed.stop(Duration::from_millis(100)).await })
        };

        first.await.unwrap();
        second.await.unwrap();

        // Only one teardown ran: one stop request, one kill.
        let kills = backend
            .calls()
            .iter()
            .filter(|call| matches!(call, BackendCall::Kill(_)))
            .count();
        assert_eq!(kills, 1);
        assert!(!backend.is_running(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_drain_returns_immediately() {
        let backend = FakeBackend::new();
        let (managed, _sink) = managed_process(&backend).await;

        managed.stop(Duration::from_secs(1)).await;
        // The drain is gone; a late stop must not hang.
        managed.stop(Duration::from_secs(1)).await;
    }
}
