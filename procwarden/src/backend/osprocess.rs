//! Backend that spawns plain OS processes.
//!
//! A program name is an executable followed by fixed arguments, e.g.
//! `"echoer v1"`. The first token is resolved through `$PATH` (or used as a
//! path when it contains a separator); the rest become the argv of every
//! process spawned from the program. Spawned processes inherit the agent's
//! stdout and stderr.
//!
//! ID forms: `osprocess.program.<name>` and `osprocess.process.<uuid>`.
//! In-place restart releases the previous child handle and re-spawns under
//! the same process ID.

use super::{Backend, BackendError, Process, ProcessId, Program, ProgramId};
use async_trait::async_trait;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

const PROGRAM_PREFIX: &str = "osprocess.program.";
const PROCESS_PREFIX: &str = "osprocess.process.";
const BACKEND_NAME: &str = "osprocess";

// =============================================================================
// Installer seam
// =============================================================================

/// Knows how to install programs into `$PATH`.
///
/// The backend consults this when `pull` cannot find the executable and when
/// `remove` releases a program.
#[async_trait]
pub trait Installer: Send + Sync + 'static {
    async fn install(&self, name: &str) -> Result<(), BackendError>;
    async fn uninstall(&self, name: &str) -> Result<(), BackendError>;
}

/// Installer that refuses to install or uninstall anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopInstaller;

#[async_trait]
impl Installer for NopInstaller {
    async fn install(&self, name: &str) -> Result<(), BackendError> {
        Err(BackendError::InstallFailed {
            name: name.to_string(),
            reason: "nop installer cannot install".to_string(),
        })
    }

    async fn uninstall(&self, name: &str) -> Result<(), BackendError> {
        Err(BackendError::InstallFailed {
            name: name.to_string(),
            reason: "nop installer cannot uninstall".to_string(),
        })
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Backend that executes programs as regular OS processes.
pub struct OsBackend<I = NopInstaller> {
    installer: I,
}

impl OsBackend<NopInstaller> {
    /// Creates a backend that can only run programs already on `$PATH`.
    pub fn new() -> Self {
        Self::with_installer(NopInstaller)
    }
}

impl Default for OsBackend<NopInstaller> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Installer> OsBackend<I> {
    pub fn with_installer(installer: I) -> Self {
        Self { installer }
    }

    fn program_name<'a>(&self, id: &'a ProgramId) -> Result<&'a str, BackendError> {
        id.as_str()
            .strip_prefix(PROGRAM_PREFIX)
            .ok_or_else(|| BackendError::ForeignProgramId(id.clone(), BACKEND_NAME))
    }

    fn resolve(&self, id: &ProgramId) -> Result<Option<OsProgram>, BackendError> {
        let name = self.program_name(id)?;
        let mut argv = name.split_whitespace();
        let Some(executable) = argv.next() else {
            return Err(BackendError::Other(format!("program {id} has an empty name")));
        };
        let Some(path) = lookup_executable(executable) else {
            return Ok(None);
        };
        Ok(Some(OsProgram {
            id: id.clone(),
            path,
            args: argv.map(str::to_string).collect(),
        }))
    }
}

#[async_trait]
impl<I: Installer> Backend for OsBackend<I> {
    type Program = OsProgram;
    type Process = OsProcess;

    fn program_id(&self, name: &str) -> ProgramId {
        ProgramId::new(format!("{PROGRAM_PREFIX}{name}"))
    }

    async fn pull(&self, id: &ProgramId) -> Result<Self::Program, BackendError> {
        if let Some(program) = self.resolve(id)? {
            return Ok(program);
        }
        let name = self.program_name(id)?;
        self.installer.install(name).await?;
        self.resolve(id)?
            .ok_or_else(|| BackendError::ProgramNotFound(id.clone()))
    }

    async fn get(&self, id: &ProgramId) -> Result<Option<Self::Program>, BackendError> {
        self.resolve(id)
    }

    async fn remove(&self, id: &ProgramId) -> Result<(), BackendError> {
        let name = self.program_name(id)?;
        self.installer.uninstall(name).await
    }

    async fn create(&self, program: &Self::Program) -> Result<Self::Process, BackendError> {
        let id = ProcessId::new(format!("{PROCESS_PREFIX}{}", Uuid::new_v4()));
        debug!(process_id = %id, program_id = %program.id, "allocated process");
        Ok(OsProcess {
            id,
            program: program.clone(),
            child: Mutex::new(None),
            pid: AtomicI32::new(0),
        })
    }
}

/// Looks up `executable` the way the shell would: directly when the name
/// contains a path separator, otherwise through each `$PATH` entry.
fn lookup_executable(executable: &str) -> Option<PathBuf> {
    if executable.contains('/') {
        let path = PathBuf::from(executable);
        return is_executable_file(&path).then_some(path);
    }
    let search_path = env::var_os("PATH")?;
    env::split_paths(&search_path).find_map(|dir| {
        let candidate = dir.join(executable);
        is_executable_file(&candidate).then_some(candidate)
    })
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

// =============================================================================
// Program & process
// =============================================================================

/// An executable resolved from `$PATH` plus its fixed arguments.
#[derive(Clone, Debug)]
pub struct OsProgram {
    id: ProgramId,
    path: PathBuf,
    args: Vec<String>,
}

impl Program for OsProgram {
    fn id(&self) -> &ProgramId {
        &self.id
    }
}

/// A spawned OS process.
///
/// The child handle lives in a slot so `wait` can own the blocking wait
/// while `stop`/`kill` signal the recorded pid concurrently.
pub struct OsProcess {
    id: ProcessId,
    program: OsProgram,
    child: Mutex<Option<Child>>,
    pid: AtomicI32,
}

impl OsProcess {
    fn signal(&self, signal: i32, name: &str) -> Result<(), BackendError> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid <= 0 {
            return Err(BackendError::NotRunning(self.id.clone()));
        }
        let rc = unsafe { libc::kill(pid, signal) };
        if rc != 0 {
            return Err(BackendError::io(
                format!("sending {name} to pid {pid}"),
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Process for OsProcess {
    fn id(&self) -> &ProcessId {
        &self.id
    }

    fn program_id(&self) -> &ProgramId {
        &self.program.id
    }

    async fn start(&self) -> Result<(), BackendError> {
        let mut slot = self.child.lock().await;
        // Release any previous execution handle before re-launching.
        slot.take();

        let child = Command::new(&self.program.path)
            .args(&self.program.args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| {
                BackendError::io(format!("spawning {}", self.program.path.display()), source)
            })?;
        let pid = child.id().map(|pid| pid as i32).unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);
        debug!(process_id = %self.id, pid, "spawned OS process");
        *slot = Some(child);
        Ok(())
    }

    async fn stop(&self, _timeout: Duration) -> Result<(), BackendError> {
        self.signal(libc::SIGTERM, "SIGTERM")
    }

    async fn kill(&self) -> Result<(), BackendError> {
        self.signal(libc::SIGKILL, "SIGKILL")
    }

    async fn wait(&self) -> Result<(), BackendError> {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return Err(BackendError::NotRunning(self.id.clone()));
        };
        let status = child
            .wait()
            .await
            .map_err(|source| BackendError::io(format!("waiting for process {}", self.id), source))?;
        if status.success() {
            Ok(())
        } else {
            Err(BackendError::AbnormalExit {
                id: self.id.clone(),
                status: status.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_id_uses_osprocess_namespace() {
        let backend = OsBackend::new();
        let id = backend.program_id("echoer v1");
        assert_eq!(id.as_str(), "osprocess.program.echoer v1");
    }

    #[tokio::test]
    async fn test_foreign_program_id_is_rejected() {
        let backend = OsBackend::new();
        let foreign = ProgramId::new("docker.program.redis");
        let err = backend.get(&foreign).await.unwrap_err();
        assert!(matches!(err, BackendError::ForeignProgramId(_, "osprocess")));
    }

    #[tokio::test]
    async fn test_get_missing_executable_returns_none() {
        let backend = OsBackend::new();
        let id = backend.program_id("procwarden-test-definitely-not-installed");
        assert!(backend.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_missing_executable_fails_with_nop_installer() {
        let backend = OsBackend::new();
        let id = backend.program_id("procwarden-test-definitely-not-installed");
        let err = backend.pull(&id).await.unwrap_err();
        assert!(matches!(err, BackendError::InstallFailed { .. }));
    }

    #[tokio::test]
    async fn test_pull_resolves_program_from_path() {
        let backend = OsBackend::new();
        let id = backend.program_id("sh -c true");
        let program = backend.pull(&id).await.unwrap();
        assert_eq!(program.id(), &id);
        assert_eq!(program.args, vec!["-c".to_string(), "true".to_string()]);
    }

    #[tokio::test]
    async fn test_successful_execution_waits_clean() {
        let backend = OsBackend::new();
        let id = backend.program_id("true");
        let program = backend.pull(&id).await.unwrap();
        let process = backend.create(&program).await.unwrap();
        process.start().await.unwrap();
        process.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_execution_waits_abnormal() {
        let backend = OsBackend::new();
        let id = backend.program_id("false");
        let program = backend.pull(&id).await.unwrap();
        let process = backend.create(&program).await.unwrap();
        process.start().await.unwrap();
        let err = process.wait().await.unwrap_err();
        assert!(matches!(err, BackendError::AbnormalExit { .. }));
    }

    #[tokio::test]
    async fn test_stop_terminates_long_running_process() {
        let backend = OsBackend::new();
        let id = backend.program_id("sleep 30");
        let program = backend.pull(&id).await.unwrap();
        let process = backend.create(&program).await.unwrap();
        process.start().await.unwrap();
        process.stop(Duration::from_secs(1)).await.unwrap();
        // SIGTERM death is an anomalous exit, but wait must return.
        let waited = tokio::time::timeout(Duration::from_secs(5), process.wait()).await;
        assert!(waited.is_ok());
    }

    #[tokio::test]
    async fn test_restart_in_place_keeps_process_id() {
        let backend = OsBackend::new();
        let id = backend.program_id("true");
        let program = backend.pull(&id).await.unwrap();
        let process = backend.create(&program).await.unwrap();
        let process_id = process.id().clone();

        process.start().await.unwrap();
        process.wait().await.unwrap();
        process.start().await.unwrap();
        assert_eq!(process.id(), &process_id);
        let _ = process.wait().await;
    }

    #[tokio::test]
    async fn test_signal_before_start_reports_not_running() {
        let backend = OsBackend::new();
        let id = backend.program_id("true");
        let program = backend.pull(&id).await.unwrap();
        let process = backend.create(&program).await.unwrap();
        let err = process.kill().await.unwrap_err();
        assert!(matches!(err, BackendError::NotRunning(_)));
    }
}
