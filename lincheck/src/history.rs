//! History types for recording concurrent operations
//!
//! Provides types for tracking the timing and results of concurrent key-value
//! operations during linearizability testing. Reads and writes may touch
//! several keys at once; the checker consumes per-key projections of them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key of the replicated key-value store
pub type Key = String;

/// Value stored under a key
pub type Value = String;

/// Unique identifier of an operation within one history
pub type OpId = u64;

/// Microsecond timestamp relative to test start
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Create a timestamp from microseconds
    pub fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    /// Get the value in microseconds
    pub fn as_micros(&self) -> u64 {
        self.0
    }
}

/// Client/process identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Create a new client ID
    pub fn new(id: u64) -> Self {
        ClientId(id)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Operation type against the key-value store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Read of one or more keys
    Read { keys: Vec<Key> },
    /// Atomic write of one or more key/value pairs
    Write { writes: Vec<(Key, Value)> },
}

/// Result of an operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpResult {
    /// Read returned these values (None = key not found)
    ReadOk(BTreeMap<Key, Option<Value>>),
    /// Write acknowledged, with the sequence number the cluster assigned to it
    WriteOk { seq_num: Option<u64> },
    /// Write definitively refused by the cluster; it has no effect
    Rejected,
    /// Outcome unknown (timeout, exhausted retries, abandoned mid-flight)
    Indeterminate(String),
}

/// A completed operation with timing interval
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation ID
    pub id: OpId,
    /// Client that performed the operation
    pub client_id: ClientId,
    /// Type of operation (read or write)
    pub kind: OpKind,
    /// Whether the request was submitted for pre-execution
    pub pre_execute: bool,
    /// When operation started (invocation time)
    pub invoke_ts: Timestamp,
    /// When operation completed (response time)
    pub complete_ts: Timestamp,
    /// What was returned
    pub result: OpResult,
}

impl Operation {
    /// Create a new operation
    pub fn new(
        id: OpId,
        client_id: ClientId,
        kind: OpKind,
        invoke_ts: Timestamp,
        complete_ts: Timestamp,
        result: OpResult,
    ) -> Self {
        Operation {
            id,
            client_id,
            kind,
            pre_execute: false,
            invoke_ts,
            complete_ts,
            result,
        }
    }

    /// Mark the operation as submitted for pre-execution
    pub fn pre_executed(mut self) -> Self {
        self.pre_execute = true;
        self
    }

    /// Sequence number of an acknowledged write, if the cluster reported one
    pub fn seq_num(&self) -> Option<u64> {
        match self.result {
            OpResult::WriteOk { seq_num } => seq_num,
            _ => None,
        }
    }

    /// Keys this operation touches
    pub fn keys(&self) -> Vec<&str> {
        match &self.kind {
            OpKind::Read { keys } => keys.iter().map(String::as_str).collect(),
            OpKind::Write { writes } => writes.iter().map(|(k, _)| k.as_str()).collect(),
        }
    }

    /// Project this operation onto a single key.
    ///
    /// Returns `None` when the operation does not touch `key` or carries no
    /// information about it (rejected writes, failed reads).
    pub fn project(&self, key: &str) -> Option<KeyEvent> {
        let (action, optional) = match (&self.kind, &self.result) {
            (OpKind::Read { keys }, OpResult::ReadOk(values)) => {
                if !keys.iter().any(|k| k == key) {
                    return None;
                }
                (KeyAction::Read(values.get(key).cloned().flatten()), false)
            }
            (OpKind::Write { writes }, OpResult::WriteOk { .. }) => {
                (KeyAction::Write(last_write_to(writes, key)?), false)
            }
            (OpKind::Write { writes }, OpResult::Indeterminate(_)) => {
                (KeyAction::Write(last_write_to(writes, key)?), true)
            }
            _ => return None,
        };

        Some(KeyEvent {
            op_id: self.id,
            invoke_ts: self.invoke_ts,
            complete_ts: self.complete_ts,
            action,
            optional,
        })
    }
}

fn last_write_to(writes: &[(Key, Value)], key: &str) -> Option<Value> {
    writes
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

/// Effect of an operation on a single key
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyAction {
    /// The operation observed this value
    Read(Option<Value>),
    /// The operation installed this value
    Write(Value),
}

/// Projection of one operation onto one key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    /// Operation this event was projected from
    pub op_id: OpId,
    pub invoke_ts: Timestamp,
    pub complete_ts: Timestamp,
    pub action: KeyAction,
    /// Indeterminate writes may or may not have taken effect
    pub optional: bool,
}

impl KeyEvent {
    pub fn is_write(&self) -> bool {
        matches!(self.action, KeyAction::Write(_))
    }
}

/// A structurally malformed history
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("operation {op} completed at {complete}us before it was invoked at {invoke}us")]
    CompletionBeforeInvocation { op: OpId, invoke: u64, complete: u64 },

    #[error("operations {first} and {second} were both assigned sequence number {seq_num}")]
    DuplicateSeqNum { seq_num: u64, first: OpId, second: OpId },

    #[error(
        "operation {earlier} completed before operation {later} started, \
         but got a higher sequence number"
    )]
    SeqNumOrder { earlier: OpId, later: OpId },
}

/// Collection of operations from a test run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct History {
    /// All completed operations
    ops: Vec<Operation>,
}

impl History {
    /// Create a new empty history
    pub fn new() -> Self {
        History { ops: Vec::new() }
    }

    /// Add a completed operation to the history
    pub fn add(&mut self, op: Operation) {
        self.ops.push(op);
    }

    /// Get all operations
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    /// Get number of operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if history is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Get operations sorted by invoke time
    pub fn sorted_by_invoke_time(&self) -> Vec<&Operation> {
        let mut sorted: Vec<_> = self.ops.iter().collect();
        sorted.sort_by_key(|op| (op.invoke_ts, op.id));
        sorted
    }

    /// Get unique keys from all operations
    pub fn unique_keys(&self) -> BTreeSet<&str> {
        self.ops.iter().flat_map(|op| op.keys()).collect()
    }

    /// Per-key projection of the history, ordered by invocation time
    pub fn events_for_key(&self, key: &str) -> Vec<KeyEvent> {
        let mut events: Vec<_> = self.ops.iter().filter_map(|op| op.project(key)).collect();
        events.sort_by_key(|e| (e.invoke_ts, e.op_id));
        events
    }

    /// Check the structural invariants every recorded history must satisfy.
    ///
    /// Completion never precedes invocation, acknowledged writes carry
    /// distinct sequence numbers, and sequence numbers respect real-time order.
    pub fn validate(&self) -> Result<(), HistoryError> {
        for op in &self.ops {
            if op.complete_ts < op.invoke_ts {
                return Err(HistoryError::CompletionBeforeInvocation {
                    op: op.id,
                    invoke: op.invoke_ts.0,
                    complete: op.complete_ts.0,
                });
            }
        }

        let mut by_seq: Vec<(u64, &Operation)> = self
            .ops
            .iter()
            .filter_map(|op| op.seq_num().map(|seq| (seq, op)))
            .collect();
        by_seq.sort_by_key(|(seq, op)| (*seq, op.id));

        for pair in by_seq.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(HistoryError::DuplicateSeqNum {
                    seq_num: pair[0].0,
                    first: pair[0].1.id,
                    second: pair[1].1.id,
                });
            }
        }

        for (i, (_, lower)) in by_seq.iter().enumerate() {
            for (_, higher) in &by_seq[i + 1..] {
                if higher.complete_ts < lower.invoke_ts {
                    return Err(HistoryError::SeqNumOrder {
                        earlier: higher.id,
                        later: lower.id,
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(id: u64, key: &str, value: &str, invoke: u64, complete: u64) -> Operation {
        Operation::new(
            id,
            ClientId(1),
            OpKind::Write {
                writes: vec![(key.to_string(), value.to_string())],
            },
            Timestamp(invoke),
            Timestamp(complete),
            OpResult::WriteOk { seq_num: None },
        )
    }

    fn read(id: u64, key: &str, value: Option<&str>, invoke: u64, complete: u64) -> Operation {
        let mut values = BTreeMap::new();
        values.insert(key.to_string(), value.map(str::to_string));
        Operation::new(
            id,
            ClientId(1),
            OpKind::Read {
                keys: vec![key.to_string()],
            },
            Timestamp(invoke),
            Timestamp(complete),
            OpResult::ReadOk(values),
        )
    }

    fn with_seq(mut op: Operation, seq: u64) -> Operation {
        op.result = OpResult::WriteOk { seq_num: Some(seq) };
        op
    }

    #[test]
    fn test_timestamp_ordering() {
        let t1 = Timestamp(100);
        let t2 = Timestamp(200);
        assert!(t1 < t2);
        assert_eq!(t1, Timestamp::from_micros(100));
        assert_eq!(t2.as_micros(), 200);
    }

    #[test]
    fn test_multi_key_write_projects_onto_each_key() {
        let op = Operation::new(
            7,
            ClientId(2),
            OpKind::Write {
                writes: vec![
                    ("a".to_string(), "1".to_string()),
                    ("b".to_string(), "2".to_string()),
                ],
            },
            Timestamp(10),
            Timestamp(20),
            OpResult::WriteOk { seq_num: Some(4) },
        )
        .pre_executed();

        let a = op.project("a").unwrap();
        let b = op.project("b").unwrap();
        assert_eq!(a.action, KeyAction::Write("1".to_string()));
        assert_eq!(b.action, KeyAction::Write("2".to_string()));
        assert_eq!(a.op_id, 7);
        assert!(!a.optional);
        assert!(op.project("c").is_none());
        assert!(op.pre_execute);
    }

    #[test]
    fn test_projection_skips_rejected_and_marks_indeterminate() {
        let mut rejected = write(1, "x", "a", 0, 10);
        rejected.result = OpResult::Rejected;
        assert!(rejected.project("x").is_none());

        let mut unknown = write(2, "x", "b", 0, 10);
        unknown.result = OpResult::Indeterminate("timeout".to_string());
        assert!(unknown.project("x").unwrap().optional);

        let mut failed_read = read(3, "x", None, 0, 10);
        failed_read.result = OpResult::Indeterminate("timeout".to_string());
        assert!(failed_read.project("x").is_none());
    }

    #[test]
    fn test_history_sorted_by_invoke_time() {
        let mut history = History::new();
        history.add(read(2, "x", Some("a"), 300, 400));
        history.add(write(1, "x", "a", 100, 200));

        let sorted = history.sorted_by_invoke_time();
        assert_eq!(sorted[0].id, 1);
        assert_eq!(sorted[1].id, 2);
        assert_eq!(history.len(), 2);
        assert!(!history.is_empty());
    }

    #[test]
    fn test_unique_keys_and_projection() {
        let mut history = History::new();
        history.add(write(1, "x", "a", 0, 10));
        history.add(write(2, "y", "b", 0, 10));
        history.add(read(3, "x", Some("a"), 20, 30));

        let keys: Vec<_> = history.unique_keys().into_iter().collect();
        assert_eq!(keys, vec!["x", "y"]);
        assert_eq!(history.events_for_key("x").len(), 2);
        assert_eq!(history.events_for_key("y").len(), 1);
    }

    #[test]
    fn test_validate_accepts_well_formed_history() {
        let mut history = History::new();
        history.add(with_seq(write(1, "x", "a", 0, 10), 1));
        history.add(with_seq(write(2, "x", "b", 5, 15), 2));
        history.add(with_seq(write(3, "y", "c", 20, 30), 3));
        assert_eq!(history.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_inverted_interval() {
        let mut history = History::new();
        history.add(write(1, "x", "a", 50, 10));
        assert!(matches!(
            history.validate(),
            Err(HistoryError::CompletionBeforeInvocation { op: 1, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_seq_num() {
        let mut history = History::new();
        history.add(with_seq(write(1, "x", "a", 0, 10), 4));
        history.add(with_seq(write(2, "y", "b", 0, 10), 4));
        assert!(matches!(
            history.validate(),
            Err(HistoryError::DuplicateSeqNum { seq_num: 4, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_seq_num_against_real_time() {
        let mut history = History::new();
        // Op 1 finished before op 2 started yet was ordered after it.
        history.add(with_seq(write(1, "x", "a", 0, 10), 9));
        history.add(with_seq(write(2, "x", "b", 20, 30), 3));
        assert_eq!(
            history.validate(),
            Err(HistoryError::SeqNumOrder { earlier: 1, later: 2 })
        );
    }
}
