//! Collaborator interfaces between the harness and a BFT cluster
//!
//! - `traits`: launcher, client transport, introspection and network control
//! - `messages`: identifiers and request/reply types on the wire
//! - `http`: JSON-over-HTTP adapter for replicas exposing the client API

pub mod http;
pub mod messages;
pub mod traits;

pub use messages::{
    CommitPath, ReadReply, ReadRequest, ReplicaId, RequestId, SeqNum, View, WriteReply,
    WriteRequest,
};
pub use traits::{
    ClientTransport, Collaborators, LaunchError, NetworkControl, ProcessInfo,
    ProtocolIntrospection, ReplicaLauncher, TransportError,
};
