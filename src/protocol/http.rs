//! JSON-over-HTTP adapter for replicas exposing the client API
//!
//! Every replica serves:
//!
//! - `POST /kv/write` with a [`WriteEnvelope`], replying [`WriteReply`]
//! - `POST /kv/read` with a [`ReadEnvelope`], replying [`ReadReply`]
//! - `GET /status`, replying [`ReplicaStatus`]
//! - `POST /commit_path` with a [`PathQuery`], replying [`PathReport`]
//! - `GET /last_committed`, replying [`LastCommitted`]
//!
//! A replica that cannot serve a request because it has no primary answers
//! `503 Service Unavailable`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lincheck::ClientId;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::messages::{
    CommitPath, ReadReply, ReadRequest, ReplicaId, RequestId, SeqNum, View, WriteReply,
    WriteRequest,
};
use crate::protocol::traits::{ClientTransport, ProtocolIntrospection, TransportError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteEnvelope {
    pub request_id: RequestId,
    pub request: WriteRequest,
    pub pre_process: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadEnvelope {
    pub client: ClientId,
    pub request: ReadRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub replica: ReplicaId,
    pub view: View,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PathQuery {
    pub seq: SeqNum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathReport {
    pub seq: SeqNum,
    pub path: Option<CommitPath>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastCommitted {
    pub seq: SeqNum,
}

/// Client API and introspection over HTTP
///
/// Cluster-wide requests go to one replica at a time, moving on to the next
/// one when a connection fails.
pub struct HttpReplicaApi {
    /// Replica id to address (e.g. "127.0.0.1:8001")
    replicas: BTreeMap<ReplicaId, String>,
    client: reqwest::Client,
    /// Index of the replica cluster-wide requests go to first
    cursor: AtomicUsize,
}

impl HttpReplicaApi {
    pub fn new(replicas: BTreeMap<ReplicaId, String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpReplicaApi {
            replicas,
            client,
            cursor: AtomicUsize::new(0),
        })
    }

    async fn call<B, R>(&self, replica: ReplicaId, path: &str, body: Option<&B>) -> Result<R, TransportError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let addr = self
            .replicas
            .get(&replica)
            .ok_or(TransportError::NodeNotFound(replica))?;
        let url = format!("http://{}{}", addr, path);

        let request = match body {
            Some(body) => self.client.post(&url).json(body),
            None => self.client.get(&url),
        };
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::ConnectionFailed
            }
        })?;

        match response.status() {
            status if status.is_success() => response
                .json::<R>()
                .await
                .map_err(|e| TransportError::Decode(e.to_string())),
            StatusCode::SERVICE_UNAVAILABLE => Err(TransportError::NoPrimary),
            status => Err(TransportError::Decode(format!("{} answered {}", replica, status))),
        }
    }

    /// Send to the current replica, failing over on connection errors
    async fn call_any<B, R>(&self, path: &str, body: Option<&B>) -> Result<R, TransportError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let ids: Vec<ReplicaId> = self.replicas.keys().copied().collect();
        if ids.is_empty() {
            return Err(TransportError::ConnectionFailed);
        }

        for _ in 0..ids.len() {
            let index = self.cursor.load(Ordering::SeqCst) % ids.len();
            let replica = ids[index];
            match self.call(replica, path, body).await {
                Err(TransportError::ConnectionFailed) => {
                    debug!(%replica, path, "Connection failed, trying next replica");
                    let _ = self.cursor.compare_exchange(
                        index,
                        (index + 1) % ids.len(),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
                other => return other,
            }
        }
        Err(TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl ClientTransport for HttpReplicaApi {
    async fn write(
        &self,
        request_id: RequestId,
        request: &WriteRequest,
        pre_process: bool,
    ) -> Result<WriteReply, TransportError> {
        let envelope = WriteEnvelope {
            request_id,
            request: request.clone(),
            pre_process,
        };
        self.call_any("/kv/write", Some(&envelope)).await
    }

    async fn read(&self, client: ClientId, request: &ReadRequest) -> Result<ReadReply, TransportError> {
        let envelope = ReadEnvelope {
            client,
            request: request.clone(),
        };
        self.call_any("/kv/read", Some(&envelope)).await
    }
}

#[async_trait]
impl ProtocolIntrospection for HttpReplicaApi {
    async fn get_view(&self, replica: ReplicaId) -> Result<View, TransportError> {
        let status: ReplicaStatus = self.call(replica, "/status", None::<&()>).await?;
        Ok(status.view)
    }

    async fn get_path_classification(
        &self,
        seq: SeqNum,
    ) -> Result<Option<CommitPath>, TransportError> {
        let report: PathReport = self.call_any("/commit_path", Some(&PathQuery { seq })).await?;
        if report.seq != seq {
            return Err(TransportError::Decode(format!(
                "asked for the path of {}, got {}",
                seq, report.seq
            )));
        }
        Ok(report.path)
    }

    async fn get_last_committed_seq_num(&self) -> Result<SeqNum, TransportError> {
        let last: LastCommitted = self.call_any("/last_committed", None::<&()>).await?;
        Ok(last.seq)
    }
}
