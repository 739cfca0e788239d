//! Workload generation
//!
//! Runs client traffic with controllable composition: bounded batches of
//! mixed reads and pre-executed writes, constant background load, a
//! long-running request alongside that load, and indefinite streams that
//! stop on cancellation. Randomness comes from a seedable generator so runs
//! are reproducible.

use std::sync::Arc;
use std::time::Duration;

use lincheck::{Key, Value};
use rand::distr::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::ClientHandle;
use crate::config::{ClientConfig, WorkloadConfig};
use crate::error::{HarnessError, Result};
use crate::protocol::{WriteReply, WriteRequest};
use crate::task_group::TaskGroup;

/// Operations dispatched by [`WorkloadGenerator::run_mixed`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MixReport {
    pub reads: usize,
    pub writes: usize,
    /// Failed operations, when failures are tolerated
    pub failures: usize,
}

impl MixReport {
    pub fn total(&self) -> usize {
        self.reads + self.writes
    }
}

/// Operations issued by an indefinite stream before it was cancelled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamReport {
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct LongRequestReport {
    pub reply: WriteReply,
    pub write_set: Vec<(Key, Value)>,
    /// Background writes completed while the long request ran
    pub background_ops: u64,
}

/// Background writers, stopped with [`BackgroundLoad::stop`]
pub struct BackgroundLoad {
    tasks: TaskGroup<u64>,
    cancel: CancellationToken,
}

impl BackgroundLoad {
    /// Cancel the writers and return how many writes they completed
    pub async fn stop(self) -> Result<u64> {
        self.cancel.cancel();
        let counts = self.tasks.join_all().await?;
        Ok(counts.into_iter().sum())
    }
}

pub struct WorkloadGenerator {
    rng: StdRng,
    config: WorkloadConfig,
}

impl WorkloadGenerator {
    pub fn new(rng: StdRng, config: WorkloadConfig) -> Self {
        WorkloadGenerator { rng, config }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed), WorkloadConfig::default())
    }

    pub fn with_config(mut self, config: WorkloadConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    /// Independent generator for a spawned task
    fn fork(&mut self) -> WorkloadGenerator {
        WorkloadGenerator::new(StdRng::seed_from_u64(self.rng.random()), self.config.clone())
    }

    pub fn random_key(&mut self) -> Key {
        format!("key-{:04}", self.rng.random_range(0..self.config.key_space.max(1)))
    }

    pub fn random_value(&mut self) -> Value {
        (&mut self.rng)
            .sample_iter(Alphanumeric)
            .take(self.config.value_len)
            .map(char::from)
            .collect()
    }

    pub fn random_write_set(&mut self, size: usize) -> Vec<(Key, Value)> {
        (0..size)
            .map(|_| (self.random_key(), self.random_value()))
            .collect()
    }

    /// Write one random key/value pair through `client` and return it
    pub async fn write_known_kv(&mut self, client: &ClientHandle) -> Result<(Key, Value)> {
        let (key, value) = (self.random_key(), self.random_value());
        client
            .write(&WriteRequest::new(vec![(key.clone(), value.clone())]), false)
            .await?;
        Ok((key, value))
    }

    /// Read `key` back and compare it against the value last written
    pub async fn assert_kv_write_executed(
        &self,
        client: &ClientHandle,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let actual = client.read_key(key).await?;
        if actual.as_deref() == Some(value) {
            Ok(())
        } else {
            Err(HarnessError::UnexpectedValue {
                key: key.to_string(),
                expected: Some(value.to_string()),
                actual,
            })
        }
    }

    /// Dispatch exactly `total_ops` operations in batches of at most
    /// `clients.len()`, one per client, pausing between batches
    ///
    /// Each operation is a pre-executed write of two fresh key/value pairs
    /// with probability `write_weight`, otherwise a single-key read.
    pub async fn run_mixed(
        &mut self,
        clients: &[Arc<ClientHandle>],
        total_ops: usize,
        write_weight: f64,
    ) -> Result<MixReport> {
        if clients.is_empty() && total_ops > 0 {
            return Err(HarnessError::Config("run_mixed needs at least one client".into()));
        }

        let tolerate = self.config.tolerate_failures;
        let mut report = MixReport::default();

        while report.total() < total_ops {
            let mut batch = TaskGroup::new();
            for client in clients.iter().take(total_ops - report.total()) {
                let client = client.clone();
                if self.rng.random::<f64>() < write_weight {
                    let request = WriteRequest::new(self.random_write_set(2));
                    report.writes += 1;
                    batch.spawn(async move {
                        tolerated(client.write(&request, true).await.map(drop), tolerate)
                    });
                } else {
                    let keys = vec![self.random_key()];
                    report.reads += 1;
                    batch.spawn(async move {
                        tolerated(client.read(&keys).await.map(drop), tolerate)
                    });
                }
            }

            let outcomes = batch.join_all().await?;
            report.failures += outcomes.iter().filter(|succeeded| !**succeeded).count();
            sleep(self.config.batch_pause).await;
        }

        info!(
            reads = report.reads,
            writes = report.writes,
            failures = report.failures,
            "Mixed workload finished"
        );
        Ok(report)
    }

    /// Start one writer per client issuing ordinary (not pre-executed)
    /// writes until `cancel` fires
    ///
    /// Failed writes are counted out of the total rather than stopping the load.
    pub fn spawn_background_load(
        &mut self,
        clients: &[Arc<ClientHandle>],
        cancel: CancellationToken,
    ) -> BackgroundLoad {
        let mut tasks = TaskGroup::new();
        for client in clients {
            let client = client.clone();
            let mut generator = self.fork();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let report = generator.write_until_cancelled(&client, &cancel).await?;
                Ok(report.completed)
            });
        }
        debug!(writers = clients.len(), "Background load started");
        BackgroundLoad { tasks, cancel }
    }

    /// Issue one long-running pre-executed write on `long_client` while the
    /// other clients keep up a background load, then let the load run for
    /// `settle` before stopping it
    ///
    /// The long client must allow at least the expected execution time plus
    /// margin per call, and retry faster than that.
    pub async fn run_long_request_with_background_load(
        &mut self,
        long_write: WriteRequest,
        long_client: &ClientHandle,
        background_clients: &[Arc<ClientHandle>],
        settle: Duration,
    ) -> Result<LongRequestReport> {
        let config = long_client.config();
        let needed = self.config.long_request_timeout();
        if config.request_timeout < needed {
            return Err(HarnessError::Config(format!(
                "long request timeout {:?} is below the expected execution time plus margin {:?}",
                config.request_timeout, needed
            )));
        }
        config.validate()?;

        let load = self.spawn_background_load(background_clients, CancellationToken::new());

        let write_set = long_write.writes.clone();
        let reply = long_client.write(&long_write.long_running(), true).await;
        if reply.is_ok() {
            sleep(settle).await;
        }
        let background_ops = load.stop().await?;
        let reply = reply?;

        info!(seq = ?reply.seq_num, background_ops, "Long request completed");
        Ok(LongRequestReport {
            reply,
            write_set,
            background_ops,
        })
    }

    /// Long-request configuration matching this workload's estimate
    pub fn long_request_client_config(&self) -> ClientConfig {
        ClientConfig::long_request(self.config.long_request_timeout())
    }

    /// Issue writes back to back on `client` until `cancel` fires
    ///
    /// The write in flight at cancellation is abandoned and recorded as
    /// indeterminate; the client stays usable.
    pub async fn run_indefinite(
        &mut self,
        client: &ClientHandle,
        cancel: CancellationToken,
    ) -> Result<StreamReport> {
        let report = self.write_until_cancelled_unpaced(client, &cancel).await?;
        info!(client = %client.id(), completed = report.completed, failed = report.failed, "Indefinite workload cancelled");
        Ok(report)
    }

    /// [`WorkloadGenerator::run_indefinite`] bounded by a time budget
    pub async fn run_for(&mut self, client: &ClientHandle, budget: Duration) -> Result<StreamReport> {
        let cancel = CancellationToken::new();
        let timer = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                sleep(budget).await;
                cancel.cancel();
            }
        });
        let report = self.run_indefinite(client, cancel).await;
        timer.abort();
        report
    }

    async fn write_until_cancelled(
        &mut self,
        client: &ClientHandle,
        cancel: &CancellationToken,
    ) -> Result<StreamReport> {
        let pause = self.config.batch_pause;
        self.stream_writes(client, cancel, Some(pause)).await
    }

    async fn write_until_cancelled_unpaced(
        &mut self,
        client: &ClientHandle,
        cancel: &CancellationToken,
    ) -> Result<StreamReport> {
        self.stream_writes(client, cancel, None).await
    }

    async fn stream_writes(
        &mut self,
        client: &ClientHandle,
        cancel: &CancellationToken,
        pause: Option<Duration>,
    ) -> Result<StreamReport> {
        let mut report = StreamReport::default();
        while !cancel.is_cancelled() {
            let request = WriteRequest::new(self.random_write_set(1));
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = client.write(&request, false) => outcome,
            };
            match outcome {
                Ok(_) => report.completed += 1,
                Err(e) if e.is_operation_failure() => {
                    debug!(client = %client.id(), error = %e, "Streamed write failed");
                    report.failed += 1;
                }
                Err(e) => return Err(e),
            }
            if let Some(pause) = pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(pause) => {}
                }
            }
        }
        Ok(report)
    }
}

/// Turn a tolerated operation failure into `Ok(false)`
fn tolerated(result: Result<()>, tolerate: bool) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if tolerate && e.is_operation_failure() => {
            debug!(error = %e, "Tolerated operation failure");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_generators_are_reproducible() {
        let mut a = WorkloadGenerator::seeded(42);
        let mut b = WorkloadGenerator::seeded(42);
        assert_eq!(a.random_write_set(3), b.random_write_set(3));

        let value = a.random_value();
        assert_eq!(value.len(), 12);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(a.random_key().starts_with("key-"));
    }

    #[test]
    fn test_key_space_bounds_keys() {
        let mut generator =
            WorkloadGenerator::seeded(1).with_config(WorkloadConfig::default().with_key_space(2));
        let keys: std::collections::BTreeSet<_> = (0..50).map(|_| generator.random_key()).collect();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_tolerated_only_swallows_operation_failures() {
        let failure = || HarnessError::OperationFailure {
            client: lincheck::ClientId(1),
            op: None,
            reason: crate::error::FailureReason::Rejected,
        };
        assert!(!tolerated(Err(failure()), true).unwrap());
        assert!(tolerated(Err(failure()), false).is_err());
        assert!(tolerated(Err(HarnessError::Task("x".into())), true).is_err());
        assert!(tolerated(Ok(()), false).unwrap());
    }
}
