//! Identifiers and wire messages of the replicated key-value service

use std::collections::BTreeMap;
use std::fmt;

use lincheck::{ClientId, Key, Value};
use serde::{Deserialize, Serialize};

/// Replica index, 0-based and stable for the lifetime of a cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u16);

impl ReplicaId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica-{}", self.0)
    }
}

/// Consensus view; the primary of view `v` is replica `v mod n`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct View(pub u64);

impl View {
    /// Primary replica of this view in a cluster of `n` replicas
    pub fn primary(&self, n: usize) -> ReplicaId {
        ReplicaId((self.0 % n.max(1) as u64) as u16)
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view {}", self.0)
    }
}

/// Consensus sequence number; committed writes start at 1
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeqNum(pub u64);

impl SeqNum {
    pub fn next(self) -> SeqNum {
        SeqNum(self.0 + 1)
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-client request identifier; a retransmission reuses the same id
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    pub client: ClientId,
    pub seq: u64,
}

/// Commit protocol used for a sequence number
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitPath {
    Fast,
    Slow,
}

/// Conditional multi-key write
///
/// The write is rejected if any key of `read_set` was written after
/// `read_version`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub writes: Vec<(Key, Value)>,
    pub read_set: Vec<Key>,
    pub read_version: SeqNum,
    /// Ask the replica to spend extra time executing this request
    pub long_exec: bool,
}

impl WriteRequest {
    pub fn new(writes: Vec<(Key, Value)>) -> Self {
        WriteRequest {
            writes,
            ..Default::default()
        }
    }

    pub fn with_read_set(mut self, keys: Vec<Key>, version: SeqNum) -> Self {
        self.read_set = keys;
        self.read_version = version;
        self
    }

    pub fn long_running(mut self) -> Self {
        self.long_exec = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReply {
    pub success: bool,
    /// Sequence number the write committed at, if it was accepted
    pub seq_num: Option<SeqNum>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadRequest {
    Keys(Vec<Key>),
    LastCommittedSeqNum,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadReply {
    Values(BTreeMap<Key, Option<Value>>),
    LastCommittedSeqNum(SeqNum),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_rotates_with_view() {
        assert_eq!(View(0).primary(4), ReplicaId(0));
        assert_eq!(View(5).primary(4), ReplicaId(1));
        assert_eq!(View(7).primary(7), ReplicaId(0));
    }

    #[test]
    fn test_write_request_builders() {
        let request = WriteRequest::new(vec![("a".into(), "1".into())])
            .with_read_set(vec!["b".into()], SeqNum(3))
            .long_running();

        assert_eq!(request.read_set, vec!["b".to_string()]);
        assert_eq!(request.read_version, SeqNum(3));
        assert!(request.long_exec);
    }

    #[test]
    fn test_messages_serialize_as_json() {
        let reply = ReadReply::LastCommittedSeqNum(SeqNum(42));
        let json = serde_json::to_string(&reply).unwrap();
        let back: ReadReply = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reply);
    }
}
