//! BFT client handles
//!
//! A `ClientHandle` issues reads and writes against the cluster and records
//! each one in the shared history. Requests from one client are strictly
//! serial; a call that is cancelled mid-flight is recorded as abandoned and
//! leaves the handle usable.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lincheck::{ClientId, Key, OpKind, OpResult, Value};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{FailureReason, HarnessError, Result};
use crate::protocol::{
    ClientTransport, ReadReply, ReadRequest, RequestId, SeqNum, TransportError, WriteReply,
    WriteRequest,
};
use crate::recorder::HistoryRecorder;

/// One logical BFT client
pub struct ClientHandle {
    id: ClientId,
    /// Timing configuration, replaceable between calls
    config: RwLock<ClientConfig>,
    transport: Arc<dyn ClientTransport>,
    recorder: Arc<HistoryRecorder>,
    /// Sequence of the next request id
    next_req_seq: AtomicU64,
    /// Held for the duration of a call so requests never overlap
    in_flight: Mutex<()>,
}

impl ClientHandle {
    pub fn new(
        id: ClientId,
        config: ClientConfig,
        transport: Arc<dyn ClientTransport>,
        recorder: Arc<HistoryRecorder>,
    ) -> Self {
        ClientHandle {
            id,
            config: RwLock::new(config),
            transport,
            recorder,
            next_req_seq: AtomicU64::new(1),
            in_flight: Mutex::new(()),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn config(&self) -> ClientConfig {
        self.config.read().clone()
    }

    /// Replace the timing configuration for subsequent calls
    pub fn set_config(&self, config: ClientConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    fn next_request_id(&self) -> RequestId {
        RequestId {
            client: self.id,
            seq: self.next_req_seq.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Submit a write and wait for the cluster to accept it
    ///
    /// A reply with `success = false` is returned as an `OperationFailure`
    /// with reason `Rejected`.
    pub async fn write(&self, request: &WriteRequest, pre_process: bool) -> Result<WriteReply> {
        let _serial = self.in_flight.lock().await;
        let config = self.config();
        let request_id = self.next_request_id();
        let pending = self.recorder.begin(
            self.id,
            OpKind::Write {
                writes: request.writes.clone(),
            },
            pre_process,
        );

        let outcome = self
            .send_with_retries(&config, || {
                self.transport.write(request_id, request, pre_process)
            })
            .await;

        match outcome {
            Ok(reply) if reply.success => {
                pending.complete(OpResult::WriteOk {
                    seq_num: reply.seq_num.map(|seq| seq.0),
                });
                Ok(reply)
            }
            Ok(_) => {
                let op = pending.complete(OpResult::Rejected);
                Err(self.failure(Some(op), FailureReason::Rejected))
            }
            Err(reason) => {
                let op = pending.complete(OpResult::Indeterminate(reason.to_string()));
                Err(self.failure(Some(op), reason))
            }
        }
    }

    /// Read the current values of `keys`
    pub async fn read(&self, keys: &[Key]) -> Result<BTreeMap<Key, Option<Value>>> {
        let _serial = self.in_flight.lock().await;
        let config = self.config();
        let pending = self.recorder.begin(
            self.id,
            OpKind::Read {
                keys: keys.to_vec(),
            },
            false,
        );
        let request = ReadRequest::Keys(keys.to_vec());

        let outcome = self
            .send_with_retries(&config, || self.transport.read(self.id, &request))
            .await
            .and_then(|reply| match reply {
                ReadReply::Values(values) => Ok(values),
                other => Err(FailureReason::Transport(TransportError::Decode(format!(
                    "expected values, got {:?}",
                    other
                )))),
            });

        match outcome {
            Ok(values) => {
                pending.complete(OpResult::ReadOk(values.clone()));
                Ok(values)
            }
            Err(reason) => {
                let op = pending.complete(OpResult::Indeterminate(reason.to_string()));
                Err(self.failure(Some(op), reason))
            }
        }
    }

    /// Read a single key
    pub async fn read_key(&self, key: &str) -> Result<Option<Value>> {
        let mut values = self.read(&[key.to_string()]).await?;
        Ok(values.remove(key).flatten())
    }

    /// Ask the cluster for its last committed sequence number
    ///
    /// Not a key-value operation, so it is not recorded in the history.
    pub async fn read_last_committed_seq_num(&self) -> Result<SeqNum> {
        let _serial = self.in_flight.lock().await;
        let config = self.config();
        let request = ReadRequest::LastCommittedSeqNum;

        let reply = self
            .send_with_retries(&config, || self.transport.read(self.id, &request))
            .await
            .map_err(|reason| self.failure(None, reason))?;

        match reply {
            ReadReply::LastCommittedSeqNum(seq) => Ok(seq),
            other => Err(self.failure(
                None,
                FailureReason::Transport(TransportError::Decode(format!(
                    "expected a sequence number, got {:?}",
                    other
                ))),
            )),
        }
    }

    fn failure(&self, op: Option<u64>, reason: FailureReason) -> HarnessError {
        HarnessError::OperationFailure {
            client: self.id,
            op,
            reason,
        }
    }

    /// Run `attempt` until it succeeds, fails permanently, exhausts the
    /// retry count or overruns the request timeout
    async fn send_with_retries<T, F, Fut>(
        &self,
        config: &ClientConfig,
        mut attempt: F,
    ) -> std::result::Result<T, FailureReason>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        let deadline = Instant::now() + config.request_timeout;

        let retries = async {
            let mut attempts: u32 = 0;
            loop {
                attempts += 1;
                match attempt().await {
                    Ok(reply) => return Ok(reply),
                    Err(e) if e.is_retriable() && attempts <= config.retry_count => {
                        debug!(client = %self.id, attempt = attempts, error = %e, "Retrying request");
                        sleep(config.retry_timeout).await;
                    }
                    Err(e) if e.is_retriable() => {
                        return Err(FailureReason::RetriesExhausted { attempts, last: e })
                    }
                    Err(e) => return Err(FailureReason::Transport(e)),
                }
            }
        };

        match timeout_at(deadline, retries).await {
            Ok(result) => result,
            Err(_) => Err(FailureReason::Timeout(config.request_timeout)),
        }
    }
}
