//! Wing-Gong Linearizability (WGL) checker
//!
//! Implements the WGL algorithm for checking linearizability of concurrent
//! operations against a key-value store. Every key is checked as an independent
//! register over the per-key projection of the history. Indeterminate writes
//! (timed out, abandoned) may or may not have been committed, so they are
//! optional in the linearization search.

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use crate::history::{History, Key, KeyAction, KeyEvent, OpId, Timestamp, Value};

/// Outcome of a linearizability check
pub type CheckResult = Result<Linearization, Violation>;

/// Witnessing order for a linearizable history, per key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Linearization {
    /// Operation IDs in a valid linearization order, for every key
    pub by_key: BTreeMap<Key, Vec<OpId>>,
}

impl Linearization {
    /// Order found for one key
    pub fn order_for(&self, key: &str) -> Option<&[OpId]> {
        self.by_key.get(key).map(Vec::as_slice)
    }

    /// Total number of placed per-key events
    pub fn len(&self) -> usize {
        self.by_key.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counterexample proving that no legal order exists
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("key '{key}': {kind}")]
pub struct Violation {
    pub key: Key,
    pub kind: ViolationKind,
}

impl Violation {
    /// The read that could not be explained
    pub fn read(&self) -> OpId {
        match self.kind {
            ViolationKind::NeverWritten { read, .. }
            | ViolationKind::StaleRead { read, .. }
            | ViolationKind::NoLinearization { read, .. } => read,
        }
    }
}

/// The conflicting operations behind a [`Violation`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViolationKind {
    #[error("read {read} returned {value:?}, which was never written")]
    NeverWritten { read: OpId, value: Value },

    #[error("read {read} returned a stale value: write {write} had completed before it started")]
    StaleRead { read: OpId, write: OpId },

    #[error("no valid linearization: read {read} conflicts with write {write:?}")]
    NoLinearization { write: Option<OpId>, read: OpId },
}

/// Register model for a single key
#[derive(Clone, Debug, Default)]
struct RegisterModel {
    /// Current value (None = key doesn't exist / initial state)
    value: Option<Value>,
    /// Operation that installed the current value
    last_writer: Option<OpId>,
}

impl RegisterModel {
    fn apply_write(&mut self, op: OpId, value: &str) {
        self.value = Some(value.to_string());
        self.last_writer = Some(op);
    }

    fn check_read(&self, expected: &Option<Value>) -> bool {
        self.value == *expected
    }
}

/// WGL linearizability checker
pub struct LinearizabilityChecker;

impl LinearizabilityChecker {
    /// Check if a multi-key history is linearizable
    ///
    /// Verifies linearizability for each key independently. Errored write
    /// operations are treated as "indeterminate": the checker tries to find a
    /// valid linearization both with and without them.
    pub fn check(history: &History) -> CheckResult {
        let mut linearization = Linearization::default();

        for key in history.unique_keys() {
            let events = history.events_for_key(key);
            if events.is_empty() {
                continue;
            }
            let order = Self::check_key(key, &events)?;
            linearization.by_key.insert(key.to_string(), order);
        }

        Ok(linearization)
    }

    /// Check the projection of a history onto a single key
    ///
    /// 1. Quick check: all read values must have been written (or be initial)
    /// 2. Quick check: no read may return a value overwritten before it began
    /// 3. Backtracking search, memoizing dead states
    pub fn check_key(key: &str, events: &[KeyEvent]) -> Result<Vec<OpId>, Violation> {
        let violation = |kind| Violation {
            key: key.to_string(),
            kind,
        };

        let mut events: Vec<KeyEvent> = events.to_vec();
        events.sort_by_key(|e| (e.invoke_ts, e.op_id));

        if let Some(kind) = Self::find_unwritten_read(&events) {
            return Err(violation(kind));
        }
        if let Some(kind) = Self::find_stale_read(&events) {
            return Err(violation(kind));
        }

        // Indeterminate writes could have committed at any point after their
        // invocation, so their interval extends to the end of the history.
        let max_ts = events.iter().map(|e| e.complete_ts).max().unwrap_or(Timestamp(0));
        for event in events.iter_mut().filter(|e| e.optional) {
            event.complete_ts = max_ts;
        }

        let mut search = Search::new(&events);
        let required = events.iter().filter(|e| !e.optional).count();
        if search.run(required) {
            Ok(search.order)
        } else {
            let (write, read) = search
                .deepest_conflict
                .map(|c| (c.write, c.read))
                .unwrap_or_else(|| (None, events[0].op_id));
            Err(violation(ViolationKind::NoLinearization { write, read }))
        }
    }

    fn find_unwritten_read(events: &[KeyEvent]) -> Option<ViolationKind> {
        let written: HashSet<&str> = events
            .iter()
            .filter_map(|e| match &e.action {
                KeyAction::Write(value) => Some(value.as_str()),
                KeyAction::Read(_) => None,
            })
            .collect();

        events.iter().find_map(|e| match &e.action {
            KeyAction::Read(Some(value)) if !e.optional && !written.contains(value.as_str()) => {
                Some(ViolationKind::NeverWritten {
                    read: e.op_id,
                    value: value.clone(),
                })
            }
            _ => None,
        })
    }

    /// A read is stale when a confirmed write strictly after the write it
    /// observed (or after the initial state) completed before the read began.
    /// Only applies when the observed value was written exactly once.
    fn find_stale_read(events: &[KeyEvent]) -> Option<ViolationKind> {
        let confirmed_writes: Vec<(&KeyEvent, &str)> = events
            .iter()
            .filter_map(|e| match &e.action {
                KeyAction::Write(v) if !e.optional => Some((e, v.as_str())),
                _ => None,
            })
            .collect();

        for read in events.iter().filter(|e| !e.optional) {
            let KeyAction::Read(observed) = &read.action else {
                continue;
            };

            let overwritten_after = match observed {
                None => Timestamp(0),
                Some(value) => {
                    let mut writers = events.iter().filter(
                        |e| matches!(&e.action, KeyAction::Write(v) if v == value),
                    );
                    match (writers.next(), writers.next()) {
                        (Some(writer), None) if !writer.optional => writer.complete_ts,
                        _ => continue,
                    }
                }
            };

            let newer = confirmed_writes.iter().find(|(w, v)| {
                observed.as_deref() != Some(*v)
                    && (observed.is_none() || w.invoke_ts > overwritten_after)
                    && w.complete_ts < read.invoke_ts
            });
            if let Some((write, _)) = newer {
                return Some(ViolationKind::StaleRead {
                    read: read.op_id,
                    write: write.op_id,
                });
            }
        }

        None
    }
}

#[derive(Clone, Copy, Debug)]
struct Conflict {
    depth: usize,
    write: Option<OpId>,
    read: OpId,
    read_invoke: Timestamp,
}

/// One level of the search: the candidates for the next placement and the
/// register state they would be applied to
struct Frame {
    candidates: Vec<usize>,
    next: usize,
    model: RegisterModel,
    frontier: Timestamp,
    remaining: usize,
    /// Memo key of this level, marked dead once every candidate fails
    state: (Vec<u64>, Option<Value>),
    /// Event placed to reach this level
    entered_by: Option<usize>,
}

/// Backtracking state for one key
///
/// The search keeps its own stack of frames, so its depth is bounded by
/// memory rather than by the thread's stack.
struct Search<'a> {
    events: &'a [KeyEvent],
    placed: Vec<u64>,
    /// (placed set, register value) states already proven to be dead ends
    dead: HashSet<(Vec<u64>, Option<Value>)>,
    order: Vec<OpId>,
    deepest_conflict: Option<Conflict>,
}

impl<'a> Search<'a> {
    fn new(events: &'a [KeyEvent]) -> Self {
        Search {
            events,
            placed: vec![0; events.len().div_ceil(64)],
            dead: HashSet::new(),
            order: Vec::with_capacity(events.len()),
            deepest_conflict: None,
        }
    }

    fn is_placed(&self, i: usize) -> bool {
        self.placed[i / 64] & (1 << (i % 64)) != 0
    }

    fn toggle(&mut self, i: usize) {
        self.placed[i / 64] ^= 1 << (i % 64);
    }

    /// Returns true if a valid linearization placing `required` events was
    /// found; the order is accumulated in `self.order`.
    fn run(&mut self, required: usize) -> bool {
        if required == 0 {
            return true;
        }
        let events = self.events;
        let mut stack = match self.enter(RegisterModel::default(), Timestamp(0), required, None) {
            Some(root) => vec![root],
            None => return false,
        };

        while let Some(frame) = stack.last_mut() {
            let Some(i) = frame.candidates.get(frame.next).copied() else {
                // Every candidate failed: this level is a dead end
                if let Some(frame) = stack.pop() {
                    self.dead.insert(frame.state);
                    if let Some(i) = frame.entered_by {
                        self.order.pop();
                        self.toggle(i);
                    }
                }
                continue;
            };
            frame.next += 1;

            let event = &events[i];
            let next = match &event.action {
                KeyAction::Write(value) => {
                    let mut next = frame.model.clone();
                    next.apply_write(event.op_id, value);
                    next
                }
                KeyAction::Read(observed) => {
                    if !frame.model.check_read(observed) {
                        let depth = self.order.len();
                        self.note_conflict(&frame.model, event, depth);
                        continue;
                    }
                    frame.model.clone()
                }
            };
            let remaining = if event.optional { frame.remaining } else { frame.remaining - 1 };
            let frontier = frame.frontier.max(event.invoke_ts);

            self.toggle(i);
            self.order.push(event.op_id);
            if remaining == 0 {
                return true;
            }
            match self.enter(next, frontier, remaining, Some(i)) {
                Some(child) => stack.push(child),
                None => {
                    self.order.pop();
                    self.toggle(i);
                }
            }
        }

        false
    }

    /// Build the frame for the current placed set, or `None` if that state
    /// is already known to be a dead end
    ///
    /// `frontier` is the latest invocation among placed events: nothing that
    /// completed before it may be placed after it.
    fn enter(
        &self,
        model: RegisterModel,
        frontier: Timestamp,
        remaining: usize,
        entered_by: Option<usize>,
    ) -> Option<Frame> {
        let state = (self.placed.clone(), model.value.clone());
        if self.dead.contains(&state) {
            return None;
        }
        let events = self.events;

        // Some required event MUST be linearized before the earliest pending
        // completion, so only events invoked before it are candidates.
        let min_complete = (0..events.len())
            .filter(|&i| !self.is_placed(i) && !events[i].optional)
            .map(|i| events[i].complete_ts)
            .min()
            .unwrap_or(Timestamp(u64::MAX));

        // Events are sorted by invocation, so the candidates form a prefix
        let mut candidates: Vec<usize> = (0..events.len())
            .take_while(|&i| events[i].invoke_ts <= min_complete)
            .filter(|&i| !self.is_placed(i) && events[i].complete_ts >= frontier)
            .collect();

        // Earlier invocations first, writes before reads
        candidates.sort_by(|&a, &b| {
            let (ea, eb) = (&events[a], &events[b]);
            ea.invoke_ts
                .cmp(&eb.invoke_ts)
                .then_with(|| eb.is_write().cmp(&ea.is_write()))
        });

        Some(Frame {
            candidates,
            next: 0,
            model,
            frontier,
            remaining,
            state,
            entered_by,
        })
    }

    fn note_conflict(&mut self, model: &RegisterModel, read: &KeyEvent, depth: usize) {
        let candidate = Conflict {
            depth,
            write: model.last_writer,
            read: read.op_id,
            read_invoke: read.invoke_ts,
        };
        let replace = match self.deepest_conflict {
            None => true,
            Some(current) => {
                candidate.depth > current.depth
                    || (candidate.depth == current.depth
                        && candidate.read_invoke < current.read_invoke)
            }
        };
        if replace {
            self.deepest_conflict = Some(candidate);
        }
    }
}
