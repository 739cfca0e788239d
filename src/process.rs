//! Child-process replica launcher
//!
//! Each replica runs as one child process built from a command template.
//! Children are killed on stop and when the launcher is dropped.

use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::protocol::{LaunchError, ProcessInfo, ReplicaId, ReplicaLauncher};

/// Command line for one replica; `{id}` in an argument is replaced by the
/// replica's index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>) -> Self {
        CommandTemplate {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn render(&self, replica: ReplicaId) -> Vec<String> {
        let id = replica.index().to_string();
        self.args.iter().map(|arg| arg.replace("{id}", &id)).collect()
    }
}

pub struct ProcessLauncher {
    template: CommandTemplate,
    replicas: BTreeSet<ReplicaId>,
    children: Mutex<HashMap<ReplicaId, Child>>,
}

impl ProcessLauncher {
    /// Launcher for replicas `0..n`
    pub fn new(template: CommandTemplate, n: usize) -> Self {
        ProcessLauncher {
            template,
            replicas: (0..n).map(|i| ReplicaId(i as u16)).collect(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn check_known(&self, replica: ReplicaId) -> Result<(), LaunchError> {
        if self.replicas.contains(&replica) {
            Ok(())
        } else {
            Err(LaunchError::Unknown(replica))
        }
    }
}

/// Whether the child has not exited yet
fn alive(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

#[async_trait]
impl ReplicaLauncher for ProcessLauncher {
    async fn start(&self, replica: ReplicaId) -> Result<ProcessInfo, LaunchError> {
        self.check_known(replica)?;
        let mut children = self.children.lock().await;

        if let Some(child) = children.get_mut(&replica) {
            if alive(child) {
                return Ok(ProcessInfo {
                    replica,
                    pid: child.id(),
                });
            }
        }

        let child = Command::new(&self.template.program)
            .args(self.template.render(replica))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                replica,
                program: self.template.program.clone(),
                source,
            })?;

        let pid = child.id();
        info!(%replica, ?pid, program = %self.template.program, "Spawned replica");
        children.insert(replica, child);
        Ok(ProcessInfo { replica, pid })
    }

    async fn stop(&self, replica: ReplicaId) -> Result<(), LaunchError> {
        self.check_known(replica)?;
        let Some(mut child) = self.children.lock().await.remove(&replica) else {
            return Ok(());
        };

        if alive(&mut child) {
            child
                .kill()
                .await
                .map_err(|source| LaunchError::Kill { replica, source })?;
            info!(%replica, "Killed replica");
        } else {
            warn!(%replica, "Replica had already exited");
        }
        Ok(())
    }

    async fn is_running(&self, replica: ReplicaId) -> bool {
        self.children
            .lock()
            .await
            .get_mut(&replica)
            .is_some_and(alive)
    }
}
