//! BFT cluster verification harness
//!
//! Drives a cluster of BFT key-value replicas through concurrent workloads and
//! fault scenarios, observes which commit path (fast or slow) the consensus
//! protocol uses, and checks the recorded client history for linearizability.

pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod observer;
pub mod process;
pub mod protocol;
pub mod recorder;
pub mod replica;
pub mod task_group;
pub mod workload;

/// Simulated cluster backend for integration tests.
pub mod testing;

pub use client::ClientHandle;
pub use cluster::{ClusterController, FaultSnapshot};
pub use config::{BftConfig, ClientConfig, ClusterConfig, ObserverConfig, WorkloadConfig};
pub use error::{FailureReason, HarnessError, Result};
pub use observer::{PathCounts, PathObserver, PathProperty};
pub use recorder::HistoryRecorder;
pub use replica::{ReplicaHandle, ReplicaState};
pub use task_group::TaskGroup;
pub use workload::WorkloadGenerator;
