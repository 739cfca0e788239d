//! Tests for the WGL linearizability checker.
//!
//! These tests verify the checker itself using manually constructed and
//! randomly generated histories, without requiring a real cluster.

use std::collections::BTreeMap;

use lincheck::{
    ClientId, History, LinearizabilityChecker, OpKind, OpResult, Operation, Timestamp,
    ViolationKind,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn write(id: u64, client: u64, writes: &[(&str, &str)], invoke: u64, complete: u64) -> Operation {
    Operation::new(
        id,
        ClientId::new(client),
        OpKind::Write {
            writes: writes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        },
        Timestamp::from_micros(invoke),
        Timestamp::from_micros(complete),
        OpResult::WriteOk { seq_num: Some(id) },
    )
}

fn read(id: u64, client: u64, key: &str, value: Option<&str>, invoke: u64, complete: u64) -> Operation {
    let mut values = BTreeMap::new();
    values.insert(key.to_string(), value.map(str::to_string));
    Operation::new(
        id,
        ClientId::new(client),
        OpKind::Read {
            keys: vec![key.to_string()],
        },
        Timestamp::from_micros(invoke),
        Timestamp::from_micros(complete),
        OpResult::ReadOk(values),
    )
}

/// Test that the checker correctly validates sequential operations.
#[test]
fn test_sequential_operations() {
    let mut history = History::new();
    history.add(write(1, 1, &[("x", "a")], 0, 100));
    history.add(read(2, 1, "x", Some("a"), 200, 300));

    let lin = LinearizabilityChecker::check(&history).unwrap();
    assert_eq!(lin.order_for("x"), Some(&[1, 2][..]));
}

/// Test that the checker correctly rejects stale reads.
#[test]
fn test_rejects_stale_read() {
    let mut history = History::new();
    history.add(write(1, 1, &[("x", "a")], 0, 100));
    history.add(read(2, 2, "x", None, 200, 300));

    let violation = LinearizabilityChecker::check(&history).unwrap_err();
    assert_eq!(violation.read(), 2);
}

/// A read observing a value no write ever produced is reported with that read.
#[test]
fn test_read_of_unproduced_value_identifies_the_read() {
    let mut history = History::new();
    history.add(write(1, 1, &[("k1", "v1"), ("k2", "v2")], 0, 100));
    history.add(write(2, 2, &[("k1", "v3"), ("k3", "v4")], 50, 150));
    history.add(read(3, 3, "k1", Some("v3"), 200, 260));
    history.add(read(4, 4, "k2", Some("phantom"), 210, 270));

    let violation = LinearizabilityChecker::check(&history).unwrap_err();
    assert_eq!(violation.key, "k2");
    assert_eq!(violation.read(), 4);
    assert_eq!(
        violation.kind,
        ViolationKind::NeverWritten {
            read: 4,
            value: "phantom".to_string()
        }
    );
}

/// Test that the checker handles concurrent pre-executed writes across clients.
#[test]
fn test_concurrent_pre_executed_writes() {
    let mut history = History::new();
    for client in 0..10u64 {
        let value = format!("v{}", client);
        history.add(
            write(client + 1, client, &[("hot", value.as_str())], 0, 1_000).pre_executed(),
        );
    }
    history.add(read(11, 0, "hot", Some("v7"), 2_000, 2_100));

    let lin = LinearizabilityChecker::check(&history).unwrap();
    let order = lin.order_for("hot").unwrap();
    assert_eq!(order.len(), 11);
    assert_eq!(order[9], 8);
    assert_eq!(order[10], 11);
}

/// Replays a strictly sequential history and reports whether every read
/// returned the latest write.
fn sequentially_consistent(history: &History) -> bool {
    let mut store: BTreeMap<String, String> = BTreeMap::new();
    for op in history.sorted_by_invoke_time() {
        match (&op.kind, &op.result) {
            (OpKind::Write { writes }, OpResult::WriteOk { .. }) => {
                for (k, v) in writes {
                    store.insert(k.clone(), v.clone());
                }
            }
            (OpKind::Read { .. }, OpResult::ReadOk(values)) => {
                for (k, v) in values {
                    if store.get(k) != v.as_ref() {
                        return false;
                    }
                }
            }
            _ => {}
        }
    }
    true
}

/// Without concurrency the checker agrees with a single-threaded replay,
/// whether or not a read has been corrupted.
#[test]
fn test_sequential_histories_match_single_threaded_replay() {
    let keys = ["a", "b", "c"];

    for seed in 0..200u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut history = History::new();
        let mut store: BTreeMap<&str, String> = BTreeMap::new();
        let corrupt = rng.random_bool(0.5);
        let mut corrupted = false;
        let mut ts = 0u64;

        for id in 1..=30u64 {
            let key = keys[rng.random_range(0..keys.len())];
            let invoke = ts;
            let complete = ts + rng.random_range(1..50);
            ts = complete + rng.random_range(1..20);

            if rng.random_bool(0.5) {
                let value = format!("v{}", id);
                store.insert(key, value.clone());
                history.add(write(id, 1, &[(key, value.as_str())], invoke, complete));
            } else {
                let mut observed = store.get(key).cloned();
                if corrupt && !corrupted && rng.random_bool(0.3) {
                    // Return some other (possibly older) value instead
                    observed = match observed {
                        Some(_) => None,
                        None => Some("v0".to_string()),
                    };
                    corrupted = true;
                }
                history.add(read(id, 1, key, observed.as_deref(), invoke, complete));
            }
        }

        let expected = sequentially_consistent(&history);
        let actual = LinearizabilityChecker::check(&history).is_ok();
        assert_eq!(
            expected, actual,
            "seed {}: replay says {}, checker says {}",
            seed, expected, actual
        );
        assert_eq!(history.validate(), Ok(()));
    }
}

/// An indeterminate write that was later observed is accepted.
#[test]
fn test_indeterminate_write_observed() {
    let mut history = History::new();
    let mut timed_out = write(1, 1, &[("x", "a")], 0, 100);
    timed_out.result = OpResult::Indeterminate("timeout".to_string());
    history.add(timed_out);
    history.add(read(2, 2, "x", Some("a"), 500, 600));

    assert!(LinearizabilityChecker::check(&history).is_ok());
}

/// A long single-key history is checked without exhausting the thread stack.
#[test]
fn test_long_single_key_history() {
    let mut history = History::new();
    for i in 0..5_000u64 {
        let value = format!("v{}", i);
        let start = i * 100;
        history.add(write(2 * i + 1, 1, &[("x", value.as_str())], start, start + 20));
        history.add(read(2 * i + 2, 2, "x", Some(value.as_str()), start + 40, start + 60));
    }

    let lin = LinearizabilityChecker::check(&history).unwrap();
    let order = lin.order_for("x").unwrap();
    assert_eq!(order.len(), 10_000);
    assert_eq!(order[..4], [1, 2, 3, 4]);
    assert_eq!(order[9_999], 10_000);
}
