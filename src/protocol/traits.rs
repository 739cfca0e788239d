//! Interfaces to the replica processes, their client API and the network

use std::sync::Arc;

use async_trait::async_trait;
use lincheck::ClientId;
use thiserror::Error;

use crate::protocol::messages::{
    CommitPath, ReadReply, ReadRequest, ReplicaId, RequestId, SeqNum, View, WriteReply,
    WriteRequest,
};

/// Process-level control over replicas
#[async_trait]
pub trait ReplicaLauncher: Send + Sync {
    /// Start the replica; starting a running replica is a no-op
    async fn start(&self, replica: ReplicaId) -> Result<ProcessInfo, LaunchError>;

    /// Stop the replica; stopping a stopped replica is a no-op
    async fn stop(&self, replica: ReplicaId) -> Result<(), LaunchError>;

    /// Liveness query
    async fn is_running(&self, replica: ReplicaId) -> bool;
}

/// Client API of the replicated key-value service
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Submit a write, optionally for pre-execution
    async fn write(
        &self,
        request_id: RequestId,
        request: &WriteRequest,
        pre_process: bool,
    ) -> Result<WriteReply, TransportError>;

    /// Submit a read
    async fn read(&self, client: ClientId, request: &ReadRequest)
        -> Result<ReadReply, TransportError>;
}

/// Read access to consensus state
#[async_trait]
pub trait ProtocolIntrospection: Send + Sync {
    /// View the replica currently reports
    async fn get_view(&self, replica: ReplicaId) -> Result<View, TransportError>;

    /// Commit path of a sequence number, `None` if it has not been reported yet
    async fn get_path_classification(
        &self,
        seq: SeqNum,
    ) -> Result<Option<CommitPath>, TransportError>;

    /// Highest sequence number committed by the cluster
    async fn get_last_committed_seq_num(&self) -> Result<SeqNum, TransportError>;
}

/// Link-level fault injection between replica subsets
#[async_trait]
pub trait NetworkControl: Send + Sync {
    /// Drop all traffic between every replica of `a` and every replica of `b`
    async fn block(&self, a: &[ReplicaId], b: &[ReplicaId]) -> Result<(), TransportError>;

    /// Reverse a previous [`NetworkControl::block`]
    async fn unblock(&self, a: &[ReplicaId], b: &[ReplicaId]) -> Result<(), TransportError>;
}

/// Handle to a started replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub replica: ReplicaId,
    /// OS process id, when the replica runs as a child process
    pub pid: Option<u32>,
}

/// Errors that can occur while talking to replicas
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection to the target replica failed
    #[error("connection to replica failed")]
    ConnectionFailed,
    /// Request timed out
    #[error("request timed out")]
    Timeout,
    /// Target replica not configured
    #[error("{0} not found")]
    NodeNotFound(ReplicaId),
    /// The current primary is unreachable
    #[error("no primary available")]
    NoPrimary,
    /// Not enough replicas to serve the request
    #[error("fewer than {needed} replicas reachable")]
    NoQuorum { needed: usize },
    /// Reply could not be decoded
    #[error("malformed reply: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether resending the same request may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed
                | TransportError::Timeout
                | TransportError::NoPrimary
                | TransportError::NoQuorum { .. }
        )
    }
}

/// Errors starting or stopping replica processes
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{0} is not part of the cluster")]
    Unknown(ReplicaId),

    #[error("failed to spawn {program} for {replica}: {source}")]
    Spawn {
        replica: ReplicaId,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to kill {replica}: {source}")]
    Kill {
        replica: ReplicaId,
        #[source]
        source: std::io::Error,
    },
}

/// Everything the controller needs from the outside world
#[derive(Clone)]
pub struct Collaborators {
    pub launcher: Arc<dyn ReplicaLauncher>,
    pub transport: Arc<dyn ClientTransport>,
    pub introspection: Arc<dyn ProtocolIntrospection>,
    pub network: Arc<dyn NetworkControl>,
}

impl Collaborators {
    /// Use one backend for all four roles
    pub fn from_shared<B>(backend: Arc<B>) -> Self
    where
        B: ReplicaLauncher + ClientTransport + ProtocolIntrospection + NetworkControl + 'static,
    {
        Collaborators {
            launcher: backend.clone(),
            transport: backend.clone(),
            introspection: backend.clone(),
            network: backend,
        }
    }
}
