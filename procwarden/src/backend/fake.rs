//! Scripted in-memory backend for tests.
//!
//! Records every call it receives so tests can assert on the externally
//! observable sequence, and lets tests script failures and external process
//! deaths. Processes "run" until an exit is injected by `stop`, `kill`, or
//! [`FakeBackend::terminate`].
//!
//! ID forms: `fake.program.<name>` and `fake.process.<n>`.

use super::{Backend, BackendError, Process, ProcessId, Program, ProgramId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const PROGRAM_PREFIX: &str = "fake.program.";
const PROCESS_PREFIX: &str = "fake.process.";

/// One observed backend call, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    Pull(ProgramId),
    Get(ProgramId),
    Remove(ProgramId),
    Create(ProgramId),
    Start(ProcessId),
    Stop(ProcessId, Duration),
    Kill(ProcessId),
    Wait(ProcessId),
}

#[derive(Clone, Copy, Debug)]
enum ExitKind {
    Clean,
    Crashed,
}

/// In-memory backend with a recorded call log.
///
/// Clones share the same state, so a test can keep a handle while the agent
/// owns another.
#[derive(Clone)]
pub struct FakeBackend {
    shared: Arc<Shared>,
}

struct Shared {
    calls: Mutex<Vec<BackendCall>>,
    installed: Mutex<HashSet<ProgramId>>,
    fail_pull: Mutex<HashSet<ProgramId>>,
    fail_create: Mutex<HashSet<ProgramId>>,
    processes: Mutex<HashMap<ProcessId, Arc<ProcessState>>>,
    /// Whether a graceful stop makes the process exit. When false the
    /// process ignores the request and the stop call blocks past its
    /// advisory timeout, so only a kill brings the process down.
    stop_terminates: AtomicBool,
    next_process: AtomicU64,
}

struct ProcessState {
    id: ProcessId,
    program_id: ProgramId,
    running: AtomicBool,
    starts: AtomicU64,
    fail_starts: AtomicU32,
    exit_tx: mpsc::UnboundedSender<ExitKind>,
    exit_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ExitKind>>,
}

impl ProcessState {
    fn exit(&self, kind: ExitKind) -> Result<(), BackendError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(BackendError::NotRunning(self.id.clone()));
        }
        let _ = self.exit_tx.send(kind);
        Ok(())
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                calls: Mutex::new(Vec::new()),
                installed: Mutex::new(HashSet::new()),
                fail_pull: Mutex::new(HashSet::new()),
                fail_create: Mutex::new(HashSet::new()),
                processes: Mutex::new(HashMap::new()),
                stop_terminates: AtomicBool::new(true),
                next_process: AtomicU64::new(1),
            }),
        }
    }

    fn record(&self, call: BackendCall) {
        if let Ok(mut calls) = self.shared.calls.lock() {
            calls.push(call);
        }
    }

    fn state(&self, id: &ProcessId) -> Option<Arc<ProcessState>> {
        self.shared
            .processes
            .lock()
            .ok()
            .and_then(|processes| processes.get(id).cloned())
    }

    // --- scripting -----------------------------------------------------------

    /// Makes the program available without going through `pull`.
    pub fn register(&self, name: &str) -> ProgramId {
        let id = self.program_id(name);
        if let Ok(mut installed) = self.shared.installed.lock() {
            installed.insert(id.clone());
        }
        id
    }

    /// Makes the next `pull` of this program fail.
    pub fn fail_next_pull(&self, id: &ProgramId) {
        if let Ok(mut fail) = self.shared.fail_pull.lock() {
            fail.insert(id.clone());
        }
    }

    /// Makes the next `create` of a process of this program fail.
    pub fn fail_next_create(&self, id: &ProgramId) {
        if let Ok(mut fail) = self.shared.fail_create.lock() {
            fail.insert(id.clone());
        }
    }

    /// Makes the next `n` starts of this process fail.
    pub fn fail_next_starts(&self, id: &ProcessId, n: u32) {
        if let Some(state) = self.state(id) {
            state.fail_starts.store(n, Ordering::SeqCst);
        }
    }

    /// When false, graceful stop requests are delivered but ignored: the
    /// stop call outlives its advisory timeout and the process stays up.
    pub fn set_stop_terminates(&self, terminates: bool) {
        self.shared
            .stop_terminates
            .store(terminates, Ordering::SeqCst);
    }

    /// Simulates the process dying outside the agent's control.
    pub fn terminate(&self, id: &ProcessId) {
        if let Some(state) = self.state(id) {
            let _ = state.exit(ExitKind::Crashed);
        }
    }

    // --- observation ---------------------------------------------------------

    /// Snapshot of all calls observed so far.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.shared
            .calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.shared.calls.lock() {
            calls.clear();
        }
    }

    pub fn is_running(&self, id: &ProcessId) -> bool {
        self.state(id)
            .map(|state| state.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Number of successful starts of this process across its lifetime.
    pub fn start_count(&self, id: &ProcessId) -> u64 {
        self.state(id)
            .map(|state| state.starts.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn is_installed(&self, id: &ProgramId) -> bool {
        self.shared
            .installed
            .lock()
            .map(|installed| installed.contains(id))
            .unwrap_or(false)
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    type Program = FakeProgram;
    type Process = FakeProcess;

    fn program_id(&self, name: &str) -> ProgramId {
        ProgramId::new(format!("{PROGRAM_PREFIX}{name}"))
    }

    async fn pull(&self, id: &ProgramId) -> Result<Self::Program, BackendError> {
        self.record(BackendCall::Pull(id.clone()));
        let scripted_failure = self
            .shared
            .fail_pull
            .lock()
            .map(|mut fail| fail.remove(id))
            .unwrap_or(false);
        if scripted_failure {
            return Err(BackendError::Other(format!("scripted pull failure for {id}")));
        }
        if let Ok(mut installed) = self.shared.installed.lock() {
            installed.insert(id.clone());
        }
        Ok(FakeProgram { id: id.clone() })
    }

    async fn get(&self, id: &ProgramId) -> Result<Option<Self::Program>, BackendError> {
        self.record(BackendCall::Get(id.clone()));
        Ok(self
            .is_installed(id)
            .then(|| FakeProgram { id: id.clone() }))
    }

    async fn remove(&self, id: &ProgramId) -> Result<(), BackendError> {
        self.record(BackendCall::Remove(id.clone()));
        if let Ok(mut installed) = self.shared.installed.lock() {
            installed.remove(id);
        }
        Ok(())
    }

    async fn create(&self, program: &Self::Program) -> Result<Self::Process, BackendError> {
        self.record(BackendCall::Create(program.id.clone()));
        let scripted_failure = self
            .shared
            .fail_create
            .lock()
            .map(|mut fail| fail.remove(&program.id))
            .unwrap_or(false);
        if scripted_failure {
            return Err(BackendError::Other(format!(
                "scripted create failure for {}",
                program.id
            )));
        }
        let n = self.shared.next_process.fetch_add(1, Ordering::SeqCst);
        let id = ProcessId::new(format!("{PROCESS_PREFIX}{n}"));
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ProcessState {
            id: id.clone(),
            program_id: program.id.clone(),
            running: AtomicBool::new(false),
            starts: AtomicU64::new(0),
            fail_starts: AtomicU32::new(0),
            exit_tx,
            exit_rx: tokio::sync::Mutex::new(exit_rx),
        });
        if let Ok(mut processes) = self.shared.processes.lock() {
            processes.insert(id, Arc::clone(&state));
        }
        Ok(FakeProcess {
            state,
            backend: self.clone(),
        })
    }
}

/// Artifact resolved by the fake backend; just the ID.
#[derive(Clone, Debug)]
pub struct FakeProgram {
    id: ProgramId,
}

impl Program for FakeProgram {
    fn id(&self) -> &ProgramId {
        &self.id
    }
}

/// A scripted process instance.
pub struct FakeProcess {
    state: Arc<ProcessState>,
    backend: FakeBackend,
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> &ProcessId {
        &self.state.id
    }

    fn program_id(&self) -> &ProgramId {
        &self.state.program_id
    }

    async fn start(&self) -> Result<(), BackendError> {
        self.backend.record(BackendCall::Start(self.state.id.clone()));
        if self.state.fail_starts.load(Ordering::SeqCst) > 0 {
            self.state.fail_starts.fetch_sub(1, Ordering::SeqCst);
            return Err(BackendError::Other(format!(
                "scripted start failure for {}",
                self.state.id
            )));
        }
        if self.state.running.swap(true, Ordering::SeqCst) {
            return Err(BackendError::Other(format!(
                "process {} is already running",
                self.state.id
            )));
        }
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, timeout: Duration) -> Result<(), BackendError> {
        self.backend
            .record(BackendCall::Stop(self.state.id.clone(), timeout));
        if !self.backend.shared.stop_terminates.load(Ordering::SeqCst) {
            // The process ignores the request; the call drags on past the
            // advisory timeout without the execution ending.
            tokio::time::sleep(timeout + Duration::from_millis(50)).await;
            return Ok(());
        }
        self.state.exit(ExitKind::Clean)
    }

    async fn kill(&self) -> Result<(), BackendError> {
        self.backend.record(BackendCall::Kill(self.state.id.clone()));
        self.state.exit(ExitKind::Crashed)
    }

    async fn wait(&self) -> Result<(), BackendError> {
        self.backend.record(BackendCall::Wait(self.state.id.clone()));
        let mut exit_rx = self.state.exit_rx.lock().await;
        match exit_rx.recv().await {
            Some(ExitKind::Clean) => Ok(()),
            Some(ExitKind::Crashed) => Err(BackendError::AbnormalExit {
                id: self.state.id.clone(),
                status: "terminated".to_string(),
            }),
            None => Err(BackendError::NotRunning(self.state.id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pull_installs_program() {
        let backend = FakeBackend::new();
        let id = backend.program_id("echoer v1");
        assert!(backend.get(&id).await.unwrap().is_none());

        backend.pull(&id).await.unwrap();
        assert!(backend.get(&id).await.unwrap().is_some());

        backend.remove(&id).await.unwrap();
        assert!(backend.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_process_runs_until_killed() {
        let backend = FakeBackend::new();
        let program = backend.pull(&backend.program_id("echoer v1")).await.unwrap();
        let process = backend.create(&program).await.unwrap();

        process.start().await.unwrap();
        assert!(backend.is_running(process.id()));

        process.kill().await.unwrap();
        assert!(!backend.is_running(process.id()));
        assert!(process.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_graceful_stop_is_a_clean_exit() {
        let backend = FakeBackend::new();
        let program = backend.pull(&backend.program_id("echoer v1")).await.unwrap();
        let process = backend.create(&program).await.unwrap();
        process.start().await.unwrap();

        process.stop(Duration::from_secs(1)).await.unwrap();
        assert!(process.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_call_log_records_sequence() {
        let backend = FakeBackend::new();
        let id = backend.program_id("echoer v1");
        let program = backend.pull(&id).await.unwrap();
        let process = backend.create(&program).await.unwrap();
        process.start().await.unwrap();

        let calls = backend.calls();
        assert_eq!(
            calls,
            vec![
                BackendCall::Pull(id.clone()),
                BackendCall::Create(id),
                BackendCall::Start(process.id().clone()),
            ]
        );
    }

    #[tokio::test]
    async fn test_scripted_start_failures_run_out() {
        let backend = FakeBackend::new();
        let program = backend.pull(&backend.program_id("echoer v1")).await.unwrap();
        let process = backend.create(&program).await.unwrap();
        backend.fail_next_starts(process.id(), 2);

        assert!(process.start().await.is_err());
        assert!(process.start().await.is_err());
        assert!(process.start().await.is_ok());
    }
}
