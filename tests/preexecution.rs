//! Pre-execution scenarios: pre-executed writes interleaved with normal
//! ones, a long-running request next to constant load, mixed workloads and
//! cancellation of indefinite streams.

mod common;

use std::time::Duration;

use bft_harness::protocol::{ReplicaId, View, WriteRequest};
use bft_harness::recorder::ABANDONED;
use bft_harness::testing::SimConfig;
use bft_harness::{BftConfig, FailureReason, HarnessError, WorkloadConfig, WorkloadGenerator};
use lincheck::OpResult;
use tokio_util::sync::CancellationToken;

use common::{start_cluster, start_cluster_with};

#[tokio::test(start_paused = true)]
async fn test_preexecuted_writes_interleave_with_background_load() {
    let (controller, _sim) = start_cluster(BftConfig::new(1, 0), 11).await;
    let mut workload = WorkloadGenerator::seeded(10);
    let (preexec_clients, background) = controller.clients().split_at(10);

    let load = workload.spawn_background_load(background, CancellationToken::new());
    let report = workload.run_mixed(preexec_clients, 200, 1.0).await.unwrap();
    let background_ops = load.stop().await.unwrap();

    assert_eq!(report.writes, 200);
    assert!(background_ops > 0);
    let last = preexec_clients[0].read_last_committed_seq_num().await.unwrap();
    assert!(last.0 >= 200 + background_ops, "last committed {last}");
    assert_eq!(last, controller.last_committed_seq_num().await.unwrap());

    let history = controller.history();
    assert!(history.ops().iter().any(|op| op.pre_execute));
    assert!(history.ops().iter().any(|op| !op.pre_execute));
    controller.check_linearizability().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_long_request_with_background_load_keeps_view() {
    let bft = BftConfig::new(1, 0);
    let sim_config = SimConfig::new(bft).with_long_exec_duration(Duration::from_secs(8));
    let (controller, _sim) = start_cluster_with(sim_config, 5).await;
    let mut workload = WorkloadGenerator::seeded(11).with_config(
        WorkloadConfig::default().with_long_exec(Duration::from_secs(10), Duration::from_secs(5)),
    );

    let long_client = controller.client(0).unwrap();
    let long_write = WriteRequest::new(workload.random_write_set(2));

    // Default client timeouts are too short for the long request
    let err = workload
        .run_long_request_with_background_load(
            long_write.clone(),
            &long_client,
            &controller.clients()[1..],
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Config(_)));

    long_client
        .set_config(workload.long_request_client_config())
        .unwrap();
    let report = workload
        .run_long_request_with_background_load(
            long_write,
            &long_client,
            &controller.clients()[1..],
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert!(report.reply.success);
    assert!(report.background_ops > 0);
    for (key, value) in &report.write_set {
        workload
            .assert_kv_write_executed(&long_client, key, value)
            .await
            .unwrap();
    }
    for i in 0..4 {
        assert_eq!(controller.get_view(ReplicaId(i)).await.unwrap(), View(0));
    }
    controller.check_linearizability().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_mixed_workload_respects_write_weight() {
    let (controller, _sim) = start_cluster(BftConfig::new(1, 0), 10).await;
    let mut workload = WorkloadGenerator::seeded(12);

    let report = workload.run_mixed(controller.clients(), 1000, 0.9).await.unwrap();
    assert_eq!(report.total(), 1000);
    assert_eq!(report.failures, 0);
    assert!(
        (850..=950).contains(&report.writes),
        "{} writes out of 1000",
        report.writes
    );

    let last = controller.last_committed_seq_num().await.unwrap();
    assert_eq!(last.0, report.writes as u64);
}

#[tokio::test(start_paused = true)]
async fn test_contended_history_is_linearizable() {
    let (controller, _sim) = start_cluster(BftConfig::new(1, 0), 6).await;
    let mut workload = WorkloadGenerator::seeded(13)
        .with_config(WorkloadConfig::default().with_key_space(3));

    workload.run_mixed(controller.clients(), 300, 0.5).await.unwrap();

    // A conditional write on a stale version is rejected and has no effect
    let client = controller.client(0).unwrap();
    let (key, value) = workload.write_known_kv(&client).await.unwrap();
    let stale = WriteRequest::new(vec![(key.clone(), "never-applied".into())])
        .with_read_set(vec![key.clone()], Default::default());
    let err = client.write(&stale, true).await.unwrap_err();
    assert!(matches!(
        err,
        HarnessError::OperationFailure {
            reason: FailureReason::Rejected,
            ..
        }
    ));
    workload.assert_kv_write_executed(&client, &key, &value).await.unwrap();

    let linearization = controller.check_linearizability().unwrap();
    assert!(linearization.by_key.contains_key(&key));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_stream_leaves_client_usable() {
    let (controller, _sim) = start_cluster(BftConfig::new(1, 0), 1).await;
    let mut workload = WorkloadGenerator::seeded(14);
    let client = controller.client(0).unwrap();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            // Off the 10ms commit grid, so a write is in flight
            tokio::time::sleep(Duration::from_millis(505)).await;
            cancel.cancel();
        }
    });
    let stream = workload.run_indefinite(&client, cancel).await.unwrap();
    assert!(stream.completed > 0);
    assert_eq!(stream.failed, 0);

    let (key, value) = workload.write_known_kv(&client).await.unwrap();
    workload.assert_kv_write_executed(&client, &key, &value).await.unwrap();

    let history = controller.history();
    let abandoned = history
        .ops()
        .iter()
        .filter(|op| matches!(&op.result, OpResult::Indeterminate(reason) if reason == ABANDONED))
        .count();
    assert_eq!(abandoned, 1);
    controller.check_linearizability().unwrap();
}
