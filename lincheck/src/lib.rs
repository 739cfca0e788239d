//! Linearizability checking for replicated key-value histories
//!
//! Records the invocation/completion interval of every client operation and
//! decides, post hoc, whether a legal sequential order exists. Uses the
//! Wing-Gong Linearizability (WGL) search, applied per key: a multi-key
//! operation is projected onto each key it touches and every projection is
//! checked as an independent read/write register.

pub mod checker;
pub mod history;

pub use checker::{CheckResult, Linearization, LinearizabilityChecker, Violation, ViolationKind};
pub use history::{
    ClientId, History, HistoryError, Key, KeyAction, KeyEvent, OpId, OpKind, OpResult, Operation,
    Timestamp, Value,
};
