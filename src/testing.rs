//! In-process simulated BFT cluster for tests
//!
//! `SimCluster` plays all four collaborator roles at once: it launches and
//! stops replicas, serves the client API, reports views and commit paths,
//! and blocks links between replicas. Its commit-path model follows the
//! protocol's quorum rules:
//!
//! - a write needs `2f + c + 1` replicas reachable from the primary, and
//!   takes the fast path only when `n - c` of them are
//! - after a view change, and after the first replica drops out of full
//!   participation, commits stay on the slow path for one evaluation period
//! - a primary that stays down, or cut off from a slow quorum, for
//!   `view_change_timeout` is replaced by the next replica that can reach one
//!
//! All delays use tokio time, so tests run under paused time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lincheck::{ClientId, Key, Value};
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::BftConfig;
use crate::protocol::{
    ClientTransport, Collaborators, CommitPath, LaunchError, NetworkControl, ProcessInfo,
    ProtocolIntrospection, ReadReply, ReadRequest, ReplicaId, ReplicaLauncher, RequestId, SeqNum,
    TransportError, View, WriteReply, WriteRequest,
};

/// Install a fmt subscriber honouring `RUST_LOG`; repeated calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub bft: BftConfig,
    /// Commits that must pass without instability before the fast path resumes
    pub evaluation_period: u64,
    /// How long the primary may be down before the view changes
    pub view_change_timeout: Duration,
    pub commit_latency: Duration,
    /// Extra pre-execution time of a long-running write
    pub long_exec_duration: Duration,
    /// Delay before answering a request the cluster cannot serve
    pub unavailable_backoff: Duration,
}

impl SimConfig {
    pub fn new(bft: BftConfig) -> Self {
        SimConfig {
            bft,
            evaluation_period: 64,
            view_change_timeout: Duration::from_secs(1),
            commit_latency: Duration::from_millis(10),
            long_exec_duration: Duration::from_secs(8),
            unavailable_backoff: Duration::from_millis(20),
        }
    }

    pub fn with_evaluation_period(mut self, period: u64) -> Self {
        self.evaluation_period = period;
        self
    }

    pub fn with_long_exec_duration(mut self, duration: Duration) -> Self {
        self.long_exec_duration = duration;
        self
    }

    pub fn with_view_change_timeout(mut self, timeout: Duration) -> Self {
        self.view_change_timeout = timeout;
        self
    }
}

struct SimState {
    running: BTreeSet<ReplicaId>,
    /// Blocked links, keyed by ordered pair; a link may be blocked by
    /// several partitions at once
    blocked: BTreeMap<(ReplicaId, ReplicaId), usize>,
    view: View,
    store: BTreeMap<Key, (Value, SeqNum)>,
    last_committed: SeqNum,
    paths: BTreeMap<SeqNum, CommitPath>,
    degraded_until: SeqNum,
    view_change_until: SeqNum,
    full_participation: bool,
    /// Last reply per client, for retransmissions
    replies: HashMap<ClientId, (u64, WriteReply)>,
    primary_down_since: Option<Instant>,
}

fn link(a: ReplicaId, b: ReplicaId) -> (ReplicaId, ReplicaId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl SimState {
    fn is_blocked(&self, a: ReplicaId, b: ReplicaId) -> bool {
        self.blocked.contains_key(&link(a, b))
    }

    /// Running replicas the primary can reach, itself included
    fn participants(&self, primary: ReplicaId) -> usize {
        self.running
            .iter()
            .filter(|&&r| r == primary || !self.is_blocked(primary, r))
            .count()
    }
}

/// Handle to a simulated cluster; clones share the same cluster
#[derive(Clone)]
pub struct SimCluster {
    config: Arc<SimConfig>,
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    /// A cluster with every replica stopped
    pub fn new(config: SimConfig) -> Self {
        SimCluster {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(SimState {
                running: BTreeSet::new(),
                blocked: BTreeMap::new(),
                view: View(0),
                store: BTreeMap::new(),
                last_committed: SeqNum(0),
                paths: BTreeMap::new(),
                degraded_until: SeqNum(0),
                view_change_until: SeqNum(0),
                full_participation: true,
                replies: HashMap::new(),
                primary_down_since: None,
            })),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::from_shared(Arc::new(self.clone()))
    }

    pub fn is_replica_running(&self, id: ReplicaId) -> bool {
        self.state.lock().running.contains(&id)
    }

    pub fn is_blocked(&self, a: ReplicaId, b: ReplicaId) -> bool {
        self.state.lock().is_blocked(a, b)
    }

    pub fn current_view(&self) -> View {
        self.state.lock().view
    }

    pub fn committed_value(&self, key: &str) -> Option<Value> {
        self.state.lock().store.get(key).map(|(value, _)| value.clone())
    }

    /// Pretend the cluster committed one sequence number per entry of `trace`
    pub fn inject_commit_trace(&self, trace: &[CommitPath]) {
        let mut state = self.state.lock();
        for &path in trace {
            let seq = state.last_committed.next();
            state.paths.insert(seq, path);
            state.last_committed = seq;
        }
    }

    /// Report a different path for an already committed sequence number
    pub fn rewrite_commit_path(&self, seq: SeqNum, path: CommitPath) {
        self.state.lock().paths.insert(seq, path);
    }

    fn check_known(&self, id: ReplicaId) -> Result<(), TransportError> {
        if id.index() < self.config.bft.n() {
            Ok(())
        } else {
            Err(TransportError::NodeNotFound(id))
        }
    }

    /// A replica can lead when it runs and reaches a slow quorum
    fn can_lead(&self, state: &SimState, replica: ReplicaId) -> bool {
        state.running.contains(&replica)
            && state.participants(replica) >= self.config.bft.slow_quorum()
    }

    /// Replace a primary that has been down or cut off from a slow quorum
    /// for the view-change timeout
    fn maybe_change_view(&self, state: &mut SimState) {
        let n = self.config.bft.n();
        if self.can_lead(state, state.view.primary(n)) {
            state.primary_down_since = None;
            return;
        }

        let now = Instant::now();
        let since = *state.primary_down_since.get_or_insert(now);
        if now.duration_since(since) < self.config.view_change_timeout {
            return;
        }

        let Some(view) = (1..n as u64)
            .map(|step| View(state.view.0 + step))
            .find(|view| self.can_lead(state, view.primary(n)))
        else {
            return;
        };

        let old = state.view;
        state.view = view;
        state.view_change_until =
            SeqNum(state.last_committed.next().0 + self.config.evaluation_period);
        state.primary_down_since = None;
        info!(from = %old, to = %state.view, primary = %state.view.primary(n), "View changed");
    }

    fn commit_path(&self, state: &mut SimState, seq: SeqNum, participants: usize) -> CommitPath {
        let full = participants == self.config.bft.n();
        if full {
            state.full_participation = true;
        } else if state.full_participation {
            state.full_participation = false;
            state.degraded_until = SeqNum(seq.0 + self.config.evaluation_period);
        }

        let fast = participants >= self.config.bft.fast_quorum()
            && seq >= state.view_change_until
            && (full || seq >= state.degraded_until);
        if fast {
            CommitPath::Fast
        } else {
            CommitPath::Slow
        }
    }

    fn order(&self, request_id: RequestId, request: &WriteRequest) -> Result<WriteReply, TransportError> {
        let mut state = self.state.lock();
        if let Some((seq, reply)) = state.replies.get(&request_id.client) {
            if *seq == request_id.seq {
                return Ok(reply.clone());
            }
        }

        self.maybe_change_view(&mut state);
        let primary = state.view.primary(self.config.bft.n());
        if !state.running.contains(&primary) {
            return Err(TransportError::NoPrimary);
        }
        let participants = state.participants(primary);
        let needed = self.config.bft.slow_quorum();
        if participants < needed {
            return Err(TransportError::NoQuorum { needed });
        }

        let conflict = request.read_set.iter().any(|key| {
            state
                .store
                .get(key)
                .is_some_and(|(_, version)| *version > request.read_version)
        });
        let reply = if conflict {
            WriteReply {
                success: false,
                seq_num: None,
            }
        } else {
            let seq = state.last_committed.next();
            for (key, value) in &request.writes {
                state.store.insert(key.clone(), (value.clone(), seq));
            }
            state.last_committed = seq;
            let path = self.commit_path(&mut state, seq, participants);
            state.paths.insert(seq, path);
            debug!(%seq, ?path, participants, "Committed");
            WriteReply {
                success: true,
                seq_num: Some(seq),
            }
        };

        state
            .replies
            .insert(request_id.client, (request_id.seq, reply.clone()));
        Ok(reply)
    }
}

#[async_trait]
impl ReplicaLauncher for SimCluster {
    async fn start(&self, replica: ReplicaId) -> Result<ProcessInfo, LaunchError> {
        self.check_known(replica)
            .map_err(|_| LaunchError::Unknown(replica))?;
        self.state.lock().running.insert(replica);
        Ok(ProcessInfo { replica, pid: None })
    }

    async fn stop(&self, replica: ReplicaId) -> Result<(), LaunchError> {
        self.check_known(replica)
            .map_err(|_| LaunchError::Unknown(replica))?;
        let mut state = self.state.lock();
        state.running.remove(&replica);
        if state.view.primary(self.config.bft.n()) == replica {
            state.primary_down_since = Some(Instant::now());
        }
        Ok(())
    }

    async fn is_running(&self, replica: ReplicaId) -> bool {
        self.is_replica_running(replica)
    }
}

#[async_trait]
impl ClientTransport for SimCluster {
    async fn write(
        &self,
        request_id: RequestId,
        request: &WriteRequest,
        pre_process: bool,
    ) -> Result<WriteReply, TransportError> {
        if pre_process && request.long_exec {
            sleep(self.config.long_exec_duration).await;
        }

        match self.order(request_id, request) {
            Ok(reply) => {
                sleep(self.config.commit_latency).await;
                Ok(reply)
            }
            Err(e) => {
                sleep(self.config.unavailable_backoff).await;
                Err(e)
            }
        }
    }

    async fn read(&self, _client: ClientId, request: &ReadRequest) -> Result<ReadReply, TransportError> {
        let reply = {
            let mut state = self.state.lock();
            self.maybe_change_view(&mut state);
            let needed = self.config.bft.read_quorum();
            if state.running.len() < needed {
                Err(TransportError::NoQuorum { needed })
            } else {
                Ok(match request {
                    ReadRequest::Keys(keys) => ReadReply::Values(
                        keys.iter()
                            .map(|key| {
                                let value = state.store.get(key).map(|(value, _)| value.clone());
                                (key.clone(), value)
                            })
                            .collect(),
                    ),
                    ReadRequest::LastCommittedSeqNum => {
                        ReadReply::LastCommittedSeqNum(state.last_committed)
                    }
                })
            }
        };

        match reply {
            Ok(reply) => {
                sleep(self.config.commit_latency).await;
                Ok(reply)
            }
            Err(e) => {
                sleep(self.config.unavailable_backoff).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ProtocolIntrospection for SimCluster {
    async fn get_view(&self, replica: ReplicaId) -> Result<View, TransportError> {
        self.check_known(replica)?;
        let mut state = self.state.lock();
        self.maybe_change_view(&mut state);
        if state.running.contains(&replica) {
            Ok(state.view)
        } else {
            Err(TransportError::ConnectionFailed)
        }
    }

    async fn get_path_classification(
        &self,
        seq: SeqNum,
    ) -> Result<Option<CommitPath>, TransportError> {
        Ok(self.state.lock().paths.get(&seq).copied())
    }

    async fn get_last_committed_seq_num(&self) -> Result<SeqNum, TransportError> {
        Ok(self.state.lock().last_committed)
    }
}

#[async_trait]
impl NetworkControl for SimCluster {
    async fn block(&self, a: &[ReplicaId], b: &[ReplicaId]) -> Result<(), TransportError> {
        for &id in a.iter().chain(b) {
            self.check_known(id)?;
        }
        let mut state = self.state.lock();
        for &x in a {
            for &y in b.iter().filter(|&&y| y != x) {
                *state.blocked.entry(link(x, y)).or_default() += 1;
            }
        }
        Ok(())
    }

    async fn unblock(&self, a: &[ReplicaId], b: &[ReplicaId]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        for &x in a {
            for &y in b.iter().filter(|&&y| y != x) {
                let key = link(x, y);
                if let Some(count) = state.blocked.get_mut(&key) {
                    *count -= 1;
                    if *count == 0 {
                        state.blocked.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
