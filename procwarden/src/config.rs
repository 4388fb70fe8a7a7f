//! Agent runtime settings.
//!
//! Encodes the operator-facing knobs: which restart policy drives program
//! cycles, how long a graceful stop may take, and how the agent reaches its
//! supervisor. Defaults match the stock agent daemon composition:
//! all-at-once, start-before-stop, one second stop timeout.

use crate::agent::{AllAtOnce, RestartPolicy, Rolling, StartBeforeStop, StopTimeout};
use std::sync::Arc;
use std::time::Duration;

/// Default graceful-stop timeout for policy-driven cycles.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Default supervisor address the agent dials.
pub const DEFAULT_SUPERVISOR_ADDR: &str = "127.0.0.1:1337";

/// Default timeout when dialing the supervisor.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between reconnection attempts to the supervisor.
pub const DEFAULT_REDIAL_DELAY: Duration = Duration::from_secs(1);

/// Base ordering strategy for multi-process cycles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PolicyKind {
    /// Cycle every instance concurrently.
    #[default]
    AllAtOnce,
    /// Cycle one instance at a time.
    Rolling,
}

/// Composition of the restart policy the agent applies.
#[derive(Clone, Debug)]
pub struct PolicySettings {
    pub kind: PolicyKind,
    /// Start the replacement before stopping the old instance.
    pub start_before_stop: bool,
    pub stop_timeout: Duration,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            kind: PolicyKind::AllAtOnce,
            start_before_stop: true,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl PolicySettings {
    /// Builds the composed policy.
    pub fn build(&self) -> Arc<dyn RestartPolicy> {
        let base: Arc<dyn RestartPolicy> = match self.kind {
            PolicyKind::AllAtOnce => Arc::new(AllAtOnce),
            PolicyKind::Rolling => Arc::new(Rolling),
        };
        let ordered: Arc<dyn RestartPolicy> = if self.start_before_stop {
            Arc::new(StartBeforeStop::new(base))
        } else {
            base
        };
        Arc::new(StopTimeout::new(ordered, self.stop_timeout))
    }
}

/// How the agent daemon connects to the outside world.
#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub policy: PolicySettings,
    /// Supervisor address to dial; the agent keeps reconnecting.
    pub supervisor_addr: String,
    pub dial_timeout: Duration,
    pub redial_delay: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            policy: PolicySettings::default(),
            supervisor_addr: DEFAULT_SUPERVISOR_ADDR.to_string(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            redial_delay: DEFAULT_REDIAL_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_composition() {
        let settings = PolicySettings::default();
        assert_eq!(settings.kind, PolicyKind::AllAtOnce);
        assert!(settings.start_before_stop);

        let policy = settings.build();
        assert_eq!(policy.timeout(), DEFAULT_STOP_TIMEOUT);
    }

    #[test]
    fn test_stop_timeout_override_survives_composition() {
        let settings = PolicySettings {
            kind: PolicyKind::Rolling,
            start_before_stop: false,
            stop_timeout: Duration::from_secs(30),
        };
        assert_eq!(settings.build().timeout(), Duration::from_secs(30));
    }
}
