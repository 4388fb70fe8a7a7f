//! The per-machine agent: the authority over which processes exist.
//!
//! The [`Agent`] keeps an in-memory index mapping programs to their live
//! managed processes and exposes the public supervision API: start, stop,
//! restart, and upgrade, in single-process and program-wide variants.
//!
//! # Architecture
//!
//! ```text
//! caller ──► Agent ──► Backend (pull/get/remove, create)
//!              │
//!              ├─► AgentIndex: ProgramId → {ProcessId → ManagedProcess}
//!              │                ProcessId → ManagedProcess
//!              │
//!              └─► RestartPolicy drives stop(i)/start(i) over a snapshot
//!
//! ManagedProcess ──► keep-alive + drain activities ──► Process
//! ```
//!
//! # Locking
//!
//! Public operations are totally ordered by an operation lock. Backend
//! calls that may block on the network (`pull`, `get`) happen before it is
//! taken; only bookkeeping and cheap backend calls happen inside. The index
//! maps live behind their own short-lived lock so a concurrent policy
//! (AllAtOnce) can interleave its per-item bookkeeping soundly. Lifecycle
//! activities take neither lock; they report errors through the agent's
//! [`ErrorSink`] only.

pub mod error;
pub mod managed;
pub mod policy;

pub use error::AgentError;
pub use managed::{ErrorSink, TracingErrorSink};
pub use policy::{AllAtOnce, CycleOps, RestartPolicy, Rolling, StartBeforeStop, StopTimeout};

use crate::backend::{Backend, Process, ProcessId, Program, ProgramId};
use async_trait::async_trait;
use managed::ManagedProcess;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

type Managed<B> = Arc<ManagedProcess<B>>;

// =============================================================================
// Index
// =============================================================================

/// The two mappings, maintained in lockstep.
struct AgentIndex<B: Backend> {
    /// Live managed processes grouped by their program. A group is never
    /// empty; the last drop deletes it.
    instances: HashMap<ProgramId, HashMap<ProcessId, Managed<B>>>,
    /// Flat index for O(1) lookup by process.
    started: HashMap<ProcessId, Managed<B>>,
}

impl<B: Backend> AgentIndex<B> {
    fn new() -> Self {
        Self {
            instances: HashMap::new(),
            started: HashMap::new(),
        }
    }

    fn record(&mut self, managed: Managed<B>) {
        let program_id = managed.program().id().clone();
        let process_id = managed.process_id().clone();
        self.started.insert(process_id.clone(), Arc::clone(&managed));
        self.instances
            .entry(program_id)
            .or_default()
            .insert(process_id, managed);
    }

    /// Removes the entry from both maps. Returns the program ID when this
    /// was its last instance.
    fn remove(&mut self, managed: &Managed<B>) -> Result<Option<ProgramId>, AgentError> {
        let program_id = managed.program().id().clone();
        let process_id = managed.process_id().clone();
        let Some(group) = self.instances.get_mut(&program_id) else {
            return Err(AgentError::Inconsistent(format!(
                "program {program_id} is missing from the instance index"
            )));
        };
        self.started.remove(&process_id);
        group.remove(&process_id);
        if group.is_empty() {
            self.instances.remove(&program_id);
            return Ok(Some(program_id));
        }
        Ok(None)
    }
}

// =============================================================================
// Agent
// =============================================================================

/// Supervises programs: spawns their processes through a [`Backend`] and
/// keeps them running until told otherwise.
pub struct Agent<B: Backend> {
    backend: Arc<B>,
    errors: Arc<dyn ErrorSink>,
    /// Totally orders the public operations.
    op_lock: Mutex<()>,
    index: Mutex<AgentIndex<B>>,
}

impl<B: Backend> Agent<B> {
    /// Creates an agent that executes programs through `backend`, reporting
    /// out-of-band errors to the log.
    pub fn new(backend: B) -> Self {
        Self::with_error_sink(backend, Arc::new(TracingErrorSink))
    }

    pub fn with_error_sink(backend: B, errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            backend: Arc::new(backend),
            errors,
            op_lock: Mutex::new(()),
            index: Mutex::new(AgentIndex::new()),
        }
    }

    /// The backend this agent drives.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    // --- general API ---------------------------------------------------------

    /// Snapshot of all programs and their currently instantiated processes.
    pub async fn list_all(&self) -> HashMap<ProgramId, Vec<ProcessId>> {
        let _op = self.op_lock.lock().await;
        let index = self.index.lock().await;
        index
            .instances
            .iter()
            .map(|(program_id, group)| (program_id.clone(), group.keys().cloned().collect()))
            .collect()
    }

    /// Restarts every program in the index under the policy.
    pub async fn restart_all(&self, policy: &dyn RestartPolicy) -> Result<(), AgentError> {
        let _op = self.op_lock.lock().await;
        let program_ids: Vec<ProgramId> =
            { self.index.lock().await.instances.keys().cloned().collect() };

        for program_id in program_ids {
            let program = self
                .backend
                .get(&program_id)
                .await
                .map_err(|cause| {
                    AgentError::backend(
                        format!("restarting all processes, retrieving program {program_id}"),
                        cause,
                    )
                })?
                .ok_or_else(|| {
                    AgentError::Inconsistent(format!(
                        "program {program_id} has live processes but is absent from the backend"
                    ))
                })?;
            self.cycle(policy, &program, &program).await.map_err(|cause| {
                AgentError::context(
                    format!("restarting all processes, cycling program {program_id}"),
                    cause,
                )
            })?;
        }
        Ok(())
    }

    // --- process-scoped API --------------------------------------------------

    /// Starts a process running the given program and returns its ID.
    pub async fn start_process(&self, id: &ProgramId) -> Result<ProcessId, AgentError> {
        // The pull may block on the network; do it before the lock.
        let program = self
            .backend
            .pull(id)
            .await
            .map_err(|cause| AgentError::backend("pulling program", cause))?;
        let _op = self.op_lock.lock().await;
        self.start_instance(&program).await
    }

    /// Stops a running process and forgets it.
    pub async fn stop_process(&self, id: &ProcessId, timeout: Duration) -> Result<(), AgentError> {
        let _op = self.op_lock.lock().await;
        let managed = self
            .lookup(id)
            .await
            .ok_or_else(|| AgentError::ProcessNotFound(id.clone()))?;
        managed.stop(timeout).await;
        self.drop_instance(&managed).await?;
        info!(process_id = %id, "process stopped");
        Ok(())
    }

    /// Restarts a single process under the policy.
    pub async fn restart_process(
        &self,
        policy: &dyn RestartPolicy,
        id: &ProcessId,
    ) -> Result<(), AgentError> {
        let _op = self.op_lock.lock().await;
        let managed = self
            .lookup(id)
            .await
            .ok_or_else(|| AgentError::ProcessNotFound(id.clone()))?;
        let target = managed.program().clone();
        let run = CycleRun {
            agent: self,
            snapshot: vec![managed],
            target,
            timeout: policy.timeout(),
        };
        policy.run(1, &run).await
    }

    /// Upgrades a single process to a new program.
    pub async fn upgrade_process(
        &self,
        policy: &dyn RestartPolicy,
        id: &ProcessId,
        to: &ProgramId,
    ) -> Result<(), AgentError> {
        let target = self
            .backend
            .pull(to)
            .await
            .map_err(|cause| AgentError::backend("pulling program to upgrade to", cause))?;
        let _op = self.op_lock.lock().await;
        let managed = self
            .lookup(id)
            .await
            .ok_or_else(|| AgentError::ProcessNotFound(id.clone()))?;
        let run = CycleRun {
            agent: self,
            snapshot: vec![managed],
            target,
            timeout: policy.timeout(),
        };
        policy.run(1, &run).await
    }

    // --- program-scoped API --------------------------------------------------

    /// All running instances of the program. Unknown programs yield an
    /// empty list; presence is a separate question (`Backend::get`).
    pub async fn list_program(&self, id: &ProgramId) -> Vec<ProcessId> {
        let _op = self.op_lock.lock().await;
        let index = self.index.lock().await;
        index
            .instances
            .get(id)
            .map(|group| group.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Stops every process of the program, one after the other.
    pub async fn stop_program(&self, id: &ProgramId, timeout: Duration) -> Result<(), AgentError> {
        let _op = self.op_lock.lock().await;
        let group: Vec<Managed<B>> = {
            let index = self.index.lock().await;
            index
                .instances
                .get(id)
                .map(|group| group.values().cloned().collect())
                .unwrap_or_default()
        };
        for managed in group {
            managed.stop(timeout).await;
            self.drop_instance(&managed).await?;
        }
        info!(program_id = %id, "program stopped");
        Ok(())
    }

    /// Restarts the processes running a program while respecting a policy.
    pub async fn restart_program(
        &self,
        policy: &dyn RestartPolicy,
        id: &ProgramId,
    ) -> Result<(), AgentError> {
        let program = self
            .backend
            .get(id)
            .await
            .map_err(|cause| AgentError::backend("getting program to restart", cause))?
            .ok_or_else(|| AgentError::ProgramNotPresent(id.clone()))?;
        let _op = self.op_lock.lock().await;
        self.cycle(policy, &program, &program).await
    }

    /// Upgrades all instances of one program to another while respecting
    /// the policy.
    pub async fn upgrade_program(
        &self,
        policy: &dyn RestartPolicy,
        from: &ProgramId,
        to: &ProgramId,
    ) -> Result<(), AgentError> {
        let from_program = self
            .backend
            .get(from)
            .await
            .map_err(|cause| AgentError::backend("getting program to upgrade", cause))?
            .ok_or_else(|| AgentError::ProgramNotPresent(from.clone()))?;
        let to_program = self
            .backend
            .pull(to)
            .await
            .map_err(|cause| AgentError::backend("pulling program to upgrade to", cause))?;

        // Programs are pulled before locking.
        let _op = self.op_lock.lock().await;
        self.cycle(policy, &from_program, &to_program).await
    }

    // --- internals -----------------------------------------------------------

    async fn lookup(&self, id: &ProcessId) -> Option<Managed<B>> {
        self.index.lock().await.started.get(id).cloned()
    }

    /// Creates, starts, and records one process of `program`.
    async fn start_instance(&self, program: &B::Program) -> Result<ProcessId, AgentError> {
        let process = self
            .backend
            .create(program)
            .await
            .map_err(|cause| AgentError::backend("creating process", cause))?;
        process
            .start()
            .await
            .map_err(|cause| AgentError::backend("starting process", cause))?;
        let process_id = process.id().clone();

        let mut index = self.index.lock().await;
        if index.started.contains_key(&process_id) {
            return Err(AgentError::AlreadyManaged(process_id));
        }
        let managed =
            ManagedProcess::<B>::manage(program.clone(), process, Arc::clone(&self.errors));
        index.record(managed);
        info!(process_id = %process_id, program_id = %program.id(), "process started");
        Ok(process_id)
    }

    /// Forgets a drained process. When the last instance of a program goes
    /// away, asks the backend to release the artifact (best effort).
    async fn drop_instance(&self, managed: &Managed<B>) -> Result<(), AgentError> {
        let last_of_program = { self.index.lock().await.remove(managed)? };
        if let Some(program_id) = last_of_program {
            if let Err(cause) = self.backend.remove(&program_id).await {
                self.errors.report(AgentError::backend(
                    format!("cleaning up no longer used program {program_id}"),
                    cause,
                ));
            }
        }
        Ok(())
    }

    /// Transitions every instance of `from` to a fresh process of `to`
    /// under the policy.
    async fn cycle(
        &self,
        policy: &dyn RestartPolicy,
        from: &B::Program,
        to: &B::Program,
    ) -> Result<(), AgentError> {
        let snapshot: Vec<Managed<B>> = {
            let index = self.index.lock().await;
            let Some(group) = index.instances.get(from.id()) else {
                return Err(AgentError::NoInstances(from.id().clone()));
            };
            group.values().cloned().collect()
        };
        let count = snapshot.len();
        debug!(from = %from.id(), to = %to.id(), count, "cycling processes");
        let run = CycleRun {
            agent: self,
            snapshot,
            target: to.clone(),
            timeout: policy.timeout(),
        };
        policy.run(count, &run).await
    }
}

/// One policy-driven cycle over a snapshot of managed processes.
struct CycleRun<'a, B: Backend> {
    agent: &'a Agent<B>,
    snapshot: Vec<Managed<B>>,
    target: B::Program,
    timeout: Duration,
}

#[async_trait]
impl<B: Backend> CycleOps for CycleRun<'_, B> {
    async fn stop(&self, index: usize) -> Result<(), AgentError> {
        let Some(managed) = self.snapshot.get(index) else {
            return Err(AgentError::Inconsistent(format!(
                "cycle index {index} is out of range for {} snapshotted processes",
                self.snapshot.len()
            )));
        };
        managed.stop(self.timeout).await;
        self.agent.drop_instance(managed).await
    }

    async fn start(&self, _index: usize) -> Result<(), AgentError> {
        self.agent.start_instance(&self.target).await.map(|_| ())
    }
}
