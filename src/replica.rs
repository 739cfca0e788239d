//! Replica handles
//!
//! A `ReplicaHandle` tracks one replica's liveness and drives its
//! transitions through the `ReplicaLauncher`. Every transition is bounded by
//! the configured timeout; missing it is fatal to the scenario.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::info;

use crate::error::{HarnessError, Result};
use crate::protocol::{LaunchError, ProcessInfo, ReplicaId, ReplicaLauncher};

/// Interval between liveness checks while a transition completes
const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Running,
    Stopped,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaState::Running => write!(f, "running"),
            ReplicaState::Stopped => write!(f, "stopped"),
        }
    }
}

/// One cluster node, owned by the cluster controller
pub struct ReplicaHandle {
    id: ReplicaId,
    state: ReplicaState,
    process: Option<ProcessInfo>,
    launcher: Arc<dyn ReplicaLauncher>,
    transition_timeout: Duration,
}

impl ReplicaHandle {
    /// Create a handle for a replica that has not been started yet
    pub fn new(
        id: ReplicaId,
        launcher: Arc<dyn ReplicaLauncher>,
        transition_timeout: Duration,
    ) -> Self {
        ReplicaHandle {
            id,
            state: ReplicaState::Stopped,
            process: None,
            launcher,
            transition_timeout,
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ReplicaState::Running
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.transition(ReplicaState::Running).await?;
        info!(replica = %self.id, pid = ?self.process.as_ref().and_then(|p| p.pid), "Started replica");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.transition(ReplicaState::Stopped).await?;
        info!(replica = %self.id, "Stopped replica");
        Ok(())
    }

    pub async fn restart(&mut self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Ask the launcher whether the replica is alive and update the
    /// recorded state to match
    pub async fn refresh(&mut self) -> ReplicaState {
        self.state = if self.launcher.is_running(self.id).await {
            ReplicaState::Running
        } else {
            ReplicaState::Stopped
        };
        self.state
    }

    async fn transition(&mut self, target: ReplicaState) -> Result<()> {
        let launcher = self.launcher.clone();
        let id = self.id;
        let want_running = target == ReplicaState::Running;

        let work = async move {
            let process = if want_running {
                Some(launcher.start(id).await?)
            } else {
                launcher.stop(id).await?;
                None
            };
            while launcher.is_running(id).await != want_running {
                sleep(LIVENESS_POLL_INTERVAL).await;
            }
            Ok::<_, LaunchError>(process)
        };

        match timeout(self.transition_timeout, work).await {
            Ok(Ok(process)) => {
                self.process = process;
                self.state = target;
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HarnessError::ReplicaTransitionTimeout {
                replica: id,
                target,
                timeout: self.transition_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Launcher whose replicas never come up
    struct StuckLauncher;

    #[async_trait]
    impl ReplicaLauncher for StuckLauncher {
        async fn start(&self, replica: ReplicaId) -> std::result::Result<ProcessInfo, LaunchError> {
            Ok(ProcessInfo { replica, pid: None })
        }

        async fn stop(&self, _replica: ReplicaId) -> std::result::Result<(), LaunchError> {
            Ok(())
        }

        async fn is_running(&self, _replica: ReplicaId) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_times_out_when_replica_never_runs() {
        let mut replica = ReplicaHandle::new(ReplicaId(2), Arc::new(StuckLauncher), Duration::from_secs(1));

        let err = replica.start().await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::ReplicaTransitionTimeout {
                replica: ReplicaId(2),
                target: ReplicaState::Running,
                ..
            }
        ));
        assert_eq!(replica.state(), ReplicaState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_of_stopped_replica_is_noop() {
        let mut replica = ReplicaHandle::new(ReplicaId(0), Arc::new(StuckLauncher), Duration::from_secs(1));
        replica.stop().await.unwrap();
        assert!(!replica.is_running());
        assert_eq!(replica.refresh().await, ReplicaState::Stopped);
    }
}
