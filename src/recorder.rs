//! History recording for client operations
//!
//! Every client call is stamped with its invocation and completion time
//! (microseconds since the recorder was created, on the tokio clock) and
//! appended to a shared `History`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lincheck::{ClientId, History, OpId, OpKind, OpResult, Operation, Timestamp};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Result recorded for an operation whose future was dropped mid-flight
pub const ABANDONED: &str = "abandoned";

/// Shared history of one test run
pub struct HistoryRecorder {
    history: Mutex<History>,
    start: Instant,
    next_op_id: AtomicU64,
}

impl Default for HistoryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryRecorder {
    pub fn new() -> Self {
        HistoryRecorder {
            history: Mutex::new(History::new()),
            start: Instant::now(),
            next_op_id: AtomicU64::new(1),
        }
    }

    /// Current time relative to the start of the run
    pub fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.start.elapsed().as_micros() as u64)
    }

    fn next_id(&self) -> OpId {
        self.next_op_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Record the invocation of an operation
    ///
    /// The returned guard must be completed with the operation's result. If
    /// it is dropped first, the operation is recorded as indeterminate.
    pub fn begin(self: &Arc<Self>, client: ClientId, kind: OpKind, pre_execute: bool) -> PendingOp {
        PendingOp {
            recorder: self.clone(),
            id: self.next_id(),
            client,
            kind: Some(kind),
            pre_execute,
            invoke_ts: self.now(),
        }
    }

    /// Add a completed operation
    pub fn record(&self, op: Operation) {
        self.history.lock().add(op);
    }

    /// Copy of everything recorded so far
    pub fn snapshot(&self) -> History {
        self.history.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An invoked operation awaiting its result
pub struct PendingOp {
    recorder: Arc<HistoryRecorder>,
    id: OpId,
    client: ClientId,
    kind: Option<OpKind>,
    pre_execute: bool,
    invoke_ts: Timestamp,
}

impl PendingOp {
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Record the response and return the operation id
    pub fn complete(mut self, result: OpResult) -> OpId {
        self.finish(result)
    }

    fn finish(&mut self, result: OpResult) -> OpId {
        if let Some(kind) = self.kind.take() {
            let mut op = Operation::new(
                self.id,
                self.client,
                kind,
                self.invoke_ts,
                self.recorder.now(),
                result,
            );
            op.pre_execute = self.pre_execute;
            self.recorder.record(op);
        }
        self.id
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        if self.kind.is_some() {
            self.finish(OpResult::Indeterminate(ABANDONED.to_string()));
        }
    }
}
