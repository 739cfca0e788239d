//! Cluster controller
//!
//! `ClusterController` owns the replica handles, the client handles and the
//! protocol observation state (last seen view per replica, recorded commit
//! path per sequence number). All mutations of that state go through its
//! methods and are serialized by one async lock, so fault injection and
//! polling never interleave their updates even when issued concurrently.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use lincheck::{ClientId, History, Linearization, LinearizabilityChecker};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::client::ClientHandle;
use crate::config::{BftConfig, ClusterConfig};
use crate::error::{HarnessError, Result};
use crate::observer::PathObserver;
use crate::protocol::{
    Collaborators, CommitPath, ProtocolIntrospection, ReplicaId, SeqNum, View,
};
use crate::recorder::HistoryRecorder;
use crate::replica::{ReplicaHandle, ReplicaState};

/// Faults still in place
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultSnapshot {
    pub stopped: Vec<ReplicaId>,
    pub partitions: usize,
}

impl FaultSnapshot {
    pub fn is_clean(&self) -> bool {
        self.stopped.is_empty() && self.partitions == 0
    }
}

type Partition = (Vec<ReplicaId>, Vec<ReplicaId>);

/// Mutable state shared by fault injection and observation
struct ControllerState {
    replicas: BTreeMap<ReplicaId, ReplicaHandle>,
    /// Highest view each replica has reported
    views: BTreeMap<ReplicaId, View>,
    /// Commit path per sequence number; never changes once recorded
    paths: BTreeMap<SeqNum, CommitPath>,
    /// Partitions installed and not yet healed
    partitions: Vec<Partition>,
}

impl ControllerState {
    fn replica(&mut self, id: ReplicaId) -> Result<&mut ReplicaHandle> {
        self.replicas
            .get_mut(&id)
            .ok_or(HarnessError::UnknownReplica(id))
    }

    fn stopped(&self) -> Vec<ReplicaId> {
        self.replicas
            .values()
            .filter(|r| !r.is_running())
            .map(|r| r.id())
            .collect()
    }
}

/// Drives one cluster through a scenario
pub struct ClusterController {
    config: ClusterConfig,
    collaborators: Collaborators,
    recorder: Arc<HistoryRecorder>,
    clients: Vec<Arc<ClientHandle>>,
    state: Mutex<ControllerState>,
}

impl ClusterController {
    /// Create a controller; no replica is started yet
    pub fn new(config: ClusterConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let replicas = (0..config.bft.n())
            .map(|i| {
                let id = ReplicaId(i as u16);
                let handle = ReplicaHandle::new(
                    id,
                    collaborators.launcher.clone(),
                    config.transition_timeout,
                );
                (id, handle)
            })
            .collect();

        let recorder = Arc::new(HistoryRecorder::new());
        let clients = (0..config.num_clients)
            .map(|i| {
                Arc::new(ClientHandle::new(
                    ClientId::new(i as u64),
                    config.client.clone(),
                    collaborators.transport.clone(),
                    recorder.clone(),
                ))
            })
            .collect();

        Ok(ClusterController {
            config,
            collaborators,
            recorder,
            clients,
            state: Mutex::new(ControllerState {
                replicas,
                views: BTreeMap::new(),
                paths: BTreeMap::new(),
                partitions: Vec::new(),
            }),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn bft(&self) -> BftConfig {
        self.config.bft
    }

    pub fn recorder(&self) -> &Arc<HistoryRecorder> {
        &self.recorder
    }

    /// Path observer using the configured evaluation period and tolerance
    pub fn observer(&self) -> PathObserver<'_> {
        PathObserver::new(self)
    }

    // --- Replica lifecycle ---

    pub async fn start_all(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        for replica in state.replicas.values_mut() {
            replica.start().await?;
        }
        info!(n = self.config.bft.n(), "All replicas started");
        Ok(())
    }

    pub async fn start(&self, id: ReplicaId) -> Result<()> {
        self.state.lock().await.replica(id)?.start().await
    }

    pub async fn stop(&self, id: ReplicaId) -> Result<()> {
        self.state.lock().await.replica(id)?.stop().await
    }

    pub async fn restart(&self, id: ReplicaId) -> Result<()> {
        self.state.lock().await.replica(id)?.restart().await
    }

    pub async fn is_running(&self, id: ReplicaId) -> Result<bool> {
        Ok(self.state.lock().await.replica(id)?.is_running())
    }

    pub async fn running_replicas(&self) -> Vec<ReplicaId> {
        let state = self.state.lock().await;
        state
            .replicas
            .values()
            .filter(|r| r.is_running())
            .map(|r| r.id())
            .collect()
    }

    /// Every replica id except those in `without`
    pub fn all_replicas(&self, without: &BTreeSet<ReplicaId>) -> Vec<ReplicaId> {
        (0..self.config.bft.n())
            .map(|i| ReplicaId(i as u16))
            .filter(|id| !without.contains(id))
            .collect()
    }

    /// Running replicas eligible for fault injection
    pub async fn select_unstable(&self, excluding: &BTreeSet<ReplicaId>) -> Vec<ReplicaId> {
        self.running_replicas()
            .await
            .into_iter()
            .filter(|id| !excluding.contains(id))
            .collect()
    }

    // --- Views ---

    /// Poll one replica's view and remember it
    pub async fn get_view(&self, id: ReplicaId) -> Result<View> {
        if id.index() >= self.config.bft.n() {
            return Err(HarnessError::UnknownReplica(id));
        }
        let view = self
            .collaborators
            .introspection
            .get_view(id)
            .await
            .map_err(HarnessError::Introspection)?;

        let mut state = self.state.lock().await;
        let seen = state.views.entry(id).or_default();
        *seen = (*seen).max(view);
        Ok(view)
    }

    /// Highest view `id` has reported so far
    pub async fn last_seen_view(&self, id: ReplicaId) -> Option<View> {
        self.state.lock().await.views.get(&id).copied()
    }

    /// Primary of the current view, as reported by the first running replica
    /// that answers
    pub async fn primary(&self) -> Result<ReplicaId> {
        let mut last_err = None;
        for id in self.running_replicas().await {
            match self.get_view(id).await {
                Ok(view) => return Ok(view.primary(self.config.bft.n())),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(HarnessError::Introspection(
            crate::protocol::TransportError::NoPrimary,
        )))
    }

    /// Poll `id` until its view satisfies `predicate`
    ///
    /// Errors while polling (e.g. the replica is restarting) are retried
    /// until the timeout.
    pub async fn wait_for_view<P>(&self, id: ReplicaId, predicate: P, timeout: Duration) -> Result<View>
    where
        P: Fn(View) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut last_view = None;

        loop {
            match self.get_view(id).await {
                Ok(view) if predicate(view) => {
                    debug!(replica = %id, %view, "View predicate satisfied");
                    return Ok(view);
                }
                Ok(view) => last_view = Some(view),
                Err(HarnessError::UnknownReplica(id)) => return Err(HarnessError::UnknownReplica(id)),
                Err(e) => debug!(replica = %id, error = %e, "View poll failed"),
            }

            if Instant::now() >= deadline {
                return Err(HarnessError::ViewTimeout {
                    replica: id,
                    last_view,
                    timeout,
                });
            }
            sleep(self.config.view_poll_interval).await;
        }
    }

    // --- Commit paths ---

    pub async fn last_committed_seq_num(&self) -> Result<SeqNum> {
        self.collaborators
            .introspection
            .get_last_committed_seq_num()
            .await
            .map_err(HarnessError::Introspection)
    }

    /// Commit path of every sequence number in `[from, to)`
    ///
    /// Newly reported classifications are recorded; a replica reporting a
    /// different path for an already recorded sequence number is an error.
    /// Replicas are queried without holding the controller lock, which is
    /// taken only to reconcile the answers with what was recorded.
    pub async fn classify(&self, from: SeqNum, to: SeqNum) -> Result<Vec<Option<CommitPath>>> {
        let introspection: &dyn ProtocolIntrospection = self.collaborators.introspection.as_ref();
        let mut reported = Vec::new();
        let mut seq = from;
        while seq < to {
            let path = introspection
                .get_path_classification(seq)
                .await
                .map_err(HarnessError::Introspection)?;
            reported.push((seq, path));
            seq = seq.next();
        }

        let mut state = self.state.lock().await;
        let mut paths = Vec::with_capacity(reported.len());
        for (seq, reported) in reported {
            let path = match (state.paths.get(&seq).copied(), reported) {
                (Some(recorded), Some(reported)) if recorded != reported => {
                    return Err(HarnessError::InconsistentPath {
                        seq,
                        recorded,
                        reported,
                    });
                }
                (Some(recorded), _) => Some(recorded),
                (None, Some(reported)) => {
                    state.paths.insert(seq, reported);
                    Some(reported)
                }
                (None, None) => None,
            };
            paths.push(path);
        }

        Ok(paths)
    }

    // --- Network faults ---

    /// Block all traffic between `a` and `b` until [`ClusterController::heal`]
    pub async fn partition(&self, a: &[ReplicaId], b: &[ReplicaId]) -> Result<()> {
        let mut state = self.state.lock().await;
        for id in a.iter().chain(b) {
            if id.index() >= self.config.bft.n() {
                return Err(HarnessError::UnknownReplica(*id));
            }
        }
        self.collaborators
            .network
            .block(a, b)
            .await
            .map_err(HarnessError::Network)?;
        state.partitions.push((a.to_vec(), b.to_vec()));
        info!(?a, ?b, "Partitioned replicas");
        Ok(())
    }

    /// Remove every partition installed so far
    ///
    /// Every partition is attempted; those that fail to heal stay recorded
    /// and the first error is returned.
    pub async fn heal(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut first_err = None;
        let mut failed = Vec::new();
        while let Some((a, b)) = state.partitions.pop() {
            match self.collaborators.network.unblock(&a, &b).await {
                Ok(()) => info!(?a, ?b, "Healed partition"),
                Err(e) => {
                    warn!(?a, ?b, error = %e, "Failed to heal partition");
                    first_err.get_or_insert(HarnessError::Network(e));
                    failed.push((a, b));
                }
            }
        }
        failed.reverse();
        state.partitions = failed;
        first_err.map_or(Ok(()), Err)
    }

    /// Stopped replicas and partitions currently in place
    pub async fn leaked_faults(&self) -> FaultSnapshot {
        let state = self.state.lock().await;
        FaultSnapshot {
            stopped: state.stopped(),
            partitions: state.partitions.len(),
        }
    }

    /// Run a scenario body, then undo the faults it left behind
    ///
    /// Partitions are healed and every replica that was running on entry is
    /// restarted, whether the body succeeds, fails or panics. A panic is
    /// resumed after teardown.
    pub async fn scoped<F, Fut, T>(self: &Arc<Self>, body: F) -> Result<T>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let running_at_entry = self.running_replicas().await;

        let outcome = AssertUnwindSafe(body(self.clone())).catch_unwind().await;
        let teardown = self.teardown(&running_at_entry).await;

        match outcome {
            Err(panic) => {
                if let Err(e) = teardown {
                    warn!(error = %e, "Teardown after panic failed");
                }
                std::panic::resume_unwind(panic)
            }
            Ok(Err(e)) => {
                if let Err(teardown_err) = teardown {
                    warn!(error = %teardown_err, "Teardown after failed scenario failed");
                }
                Err(e)
            }
            Ok(Ok(value)) => teardown.map(|()| value),
        }
    }

    /// Heal every partition and bring back every replica in
    /// `running_at_entry`, attempting all of them before reporting the
    /// first failure
    async fn teardown(&self, running_at_entry: &[ReplicaId]) -> Result<()> {
        let mut first_err = self.heal().await.err();
        for &id in running_at_entry {
            if let Err(e) = self.revive(id).await {
                warn!(replica = %id, error = %e, "Failed to restart replica during teardown");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Start `id` unless the launcher reports it alive
    async fn revive(&self, id: ReplicaId) -> Result<()> {
        let mut state = self.state.lock().await;
        let replica = state.replica(id)?;
        if replica.refresh().await == ReplicaState::Stopped {
            info!(replica = %id, "Restarting replica stopped during scenario");
            replica.start().await?;
        }
        Ok(())
    }

    // --- Clients ---

    pub fn clients(&self) -> &[Arc<ClientHandle>] {
        &self.clients
    }

    pub fn client(&self, index: usize) -> Option<Arc<ClientHandle>> {
        self.clients.get(index).cloned()
    }

    pub fn random_client<R: Rng>(&self, rng: &mut R) -> Arc<ClientHandle> {
        // At least one client exists; validated in `new`
        self.clients[rng.random_range(0..self.clients.len())].clone()
    }

    /// `count` distinct clients in random order (all of them if fewer exist)
    pub fn random_clients<R: Rng>(&self, count: usize, rng: &mut R) -> Vec<Arc<ClientHandle>> {
        let amount = count.min(self.clients.len());
        rand::seq::index::sample(rng, self.clients.len(), amount)
            .into_iter()
            .map(|i| self.clients[i].clone())
            .collect()
    }

    // --- History ---

    pub fn history(&self) -> History {
        self.recorder.snapshot()
    }

    /// Validate the recorded history and check it for linearizability
    pub fn check_linearizability(&self) -> Result<Linearization> {
        let history = self.history();
        history.validate()?;
        let linearization = LinearizabilityChecker::check(&history)?;
        info!(ops = history.len(), "History is linearizable");
        Ok(linearization)
    }
}
