//! Commit-path observation
//!
//! Counts fast and slow commits over a half-open sequence-number window
//! `[as_of, current)` and asserts which path is prevalent. The protocol
//! returns to the fast path only after an evaluation period of sequence
//! numbers without instability, so window boundaries should be captured
//! with [`PathObserver::current_seq_num`] before injecting a fault.

use std::fmt;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::cluster::ClusterController;
use crate::config::ObserverConfig;
use crate::error::{HarnessError, Result};
use crate::protocol::{CommitPath, SeqNum};

/// Property checked by a prevalence assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathProperty {
    FastPathPrevalent,
    SlowPathPrevalent,
}

impl fmt::Display for PathProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathProperty::FastPathPrevalent => write!(f, "fast path prevalence"),
            PathProperty::SlowPathPrevalent => write!(f, "slow path prevalence"),
        }
    }
}

/// Commit-path counts over `[window_start, window_end)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathCounts {
    pub fast: u64,
    pub slow: u64,
    /// Committed sequence numbers with no reported classification yet
    pub unknown: u64,
    pub window_start: SeqNum,
    pub window_end: SeqNum,
}

impl PathCounts {
    /// Classified commits in the window
    pub fn classified(&self) -> u64 {
        self.fast + self.slow
    }

    fn tally(window_start: SeqNum, window_end: SeqNum, paths: &[Option<CommitPath>]) -> Self {
        let mut counts = PathCounts {
            window_start,
            window_end,
            ..Default::default()
        };
        for path in paths {
            match path {
                Some(CommitPath::Fast) => counts.fast += 1,
                Some(CommitPath::Slow) => counts.slow += 1,
                None => counts.unknown += 1,
            }
        }
        counts
    }
}

impl fmt::Display for PathCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} fast, {} slow, {} unknown in [{}, {})",
            self.fast, self.slow, self.unknown, self.window_start, self.window_end
        )
    }
}

/// Asserts commit-path prevalence through a cluster controller
pub struct PathObserver<'a> {
    controller: &'a ClusterController,
    config: ObserverConfig,
}

impl<'a> PathObserver<'a> {
    pub fn new(controller: &'a ClusterController) -> Self {
        PathObserver {
            controller,
            config: controller.config().observer.clone(),
        }
    }

    pub fn with_config(mut self, config: ObserverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    /// Sequence number the next commit will get
    pub async fn current_seq_num(&self) -> Result<SeqNum> {
        Ok(self.controller.last_committed_seq_num().await?.next())
    }

    /// Counts over `[as_of, current)`
    pub async fn counts(&self, as_of: SeqNum) -> Result<PathCounts> {
        let current = self.current_seq_num().await?;
        self.counts_between(as_of, current).await
    }

    /// Counts over `[from, to)`
    pub async fn counts_between(&self, from: SeqNum, to: SeqNum) -> Result<PathCounts> {
        let paths = self.controller.classify(from, to).await?;
        Ok(PathCounts::tally(from, to, &paths))
    }

    /// First sequence number at which the fast path may resume after
    /// instability at `instability_at`
    pub fn fast_path_resumption_point(&self, instability_at: SeqNum) -> SeqNum {
        SeqNum(instability_at.0 + self.config.evaluation_period)
    }

    /// The cluster is back on the fast path: since the start of the run no
    /// more than `nb_slow_paths_so_far` (plus tolerance) slow commits
    /// happened, and at least one fast commit did
    pub async fn assert_fast_path_prevalent(&self, nb_slow_paths_so_far: u64) -> Result<PathCounts> {
        let counts = self.counts(SeqNum(1)).await?;
        self.check_fast(counts, nb_slow_paths_so_far)
    }

    /// Every commit in `[as_of, current)` took the fast path, within tolerance
    pub async fn assert_fast_path_prevalent_since(&self, as_of: SeqNum) -> Result<PathCounts> {
        let counts = self.counts(as_of).await?;
        self.check_fast(counts, 0)
    }

    /// Commits happened in `[as_of, current)` and none of them (beyond
    /// tolerance) took the fast path
    pub async fn assert_slow_path_prevalent(&self, as_of: SeqNum) -> Result<PathCounts> {
        let counts = self.counts(as_of).await?;
        self.check_slow(counts)
    }

    pub async fn wait_for_slow_path_to_be_prevalent(
        &self,
        as_of: SeqNum,
        timeout: Duration,
    ) -> Result<PathCounts> {
        self.wait_for(PathProperty::SlowPathPrevalent, timeout, move || async move {
            let counts = self.counts(as_of).await?;
            Ok((counts, self.check_slow(counts).is_ok()))
        })
        .await
    }

    pub async fn wait_for_fast_path_to_be_prevalent(
        &self,
        nb_slow_paths_so_far: u64,
        timeout: Duration,
    ) -> Result<PathCounts> {
        self.wait_for(PathProperty::FastPathPrevalent, timeout, move || async move {
            let counts = self.counts(SeqNum(1)).await?;
            Ok((counts, self.check_fast(counts, nb_slow_paths_so_far).is_ok()))
        })
        .await
    }

    fn check_fast(&self, counts: PathCounts, slow_baseline: u64) -> Result<PathCounts> {
        let new_slow = counts.slow.saturating_sub(slow_baseline);
        if new_slow <= self.config.tolerance && counts.fast > 0 {
            Ok(counts)
        } else {
            Err(HarnessError::PathAssertion {
                property: PathProperty::FastPathPrevalent,
                counts,
            })
        }
    }

    fn check_slow(&self, counts: PathCounts) -> Result<PathCounts> {
        if counts.classified() > 0 && counts.fast <= self.config.tolerance {
            Ok(counts)
        } else {
            Err(HarnessError::PathAssertion {
                property: PathProperty::SlowPathPrevalent,
                counts,
            })
        }
    }

    async fn wait_for<F, Fut>(&self, property: PathProperty, timeout: Duration, mut check: F) -> Result<PathCounts>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(PathCounts, bool)>>,
    {
        let deadline = Instant::now() + timeout;
        let mut last = PathCounts::default();

        loop {
            match check().await {
                Ok((counts, true)) => return Ok(counts),
                Ok((counts, false)) => last = counts,
                Err(e @ HarnessError::InconsistentPath { .. }) => return Err(e),
                Err(e) => debug!(error = %e, "Path poll failed"),
            }

            if Instant::now() >= deadline {
                return Err(HarnessError::PathAssertionTimeout {
                    property,
                    last,
                    timeout,
                });
            }
            sleep(self.config.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BftConfig, ClusterConfig};
    use crate::testing::{SimCluster, SimConfig};
    use crate::protocol::CommitPath::{Fast, Slow};

    fn controller_with_trace(trace: &[CommitPath]) -> ClusterController {
        let bft = BftConfig::new(1, 0);
        let sim = SimCluster::new(SimConfig::new(bft));
        sim.inject_commit_trace(trace);
        ClusterController::new(ClusterConfig::new(bft).with_clients(1), sim.collaborators()).unwrap()
    }

    fn slow_then_fast(slow: usize, fast: usize) -> Vec<CommitPath> {
        let mut trace = vec![Slow; slow];
        trace.extend(vec![Fast; fast]);
        trace
    }

    #[tokio::test]
    async fn test_fast_prevalence_depends_on_window_start() {
        // Seq 1..=20 slow, 21..=30 fast
        let controller = controller_with_trace(&slow_then_fast(20, 10));
        let observer = controller.observer();

        assert_eq!(observer.current_seq_num().await.unwrap(), SeqNum(31));

        let err = observer.assert_fast_path_prevalent_since(SeqNum(15)).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::PathAssertion {
                property: PathProperty::FastPathPrevalent,
                counts: PathCounts { fast: 10, slow: 6, .. },
            }
        ));

        let counts = observer.assert_fast_path_prevalent_since(SeqNum(21)).await.unwrap();
        assert_eq!(counts.fast, 10);
        assert_eq!(counts.slow, 0);
    }

    #[tokio::test]
    async fn test_fast_prevalence_relative_to_slow_baseline() {
        let controller = controller_with_trace(&slow_then_fast(10, 10));
        let observer = controller.observer();

        assert!(observer.assert_fast_path_prevalent(10).await.is_ok());
        assert!(observer.assert_fast_path_prevalent(9).await.is_err());
        // Tolerance is configurable and defaults to zero
        let tolerant = controller
            .observer()
            .with_config(ObserverConfig::default().with_tolerance(1));
        assert!(tolerant.assert_fast_path_prevalent(9).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_prevalence_needs_commits_and_no_fast_ones() {
        let controller = controller_with_trace(&slow_then_fast(5, 1));
        let observer = controller.observer();

        assert!(observer.assert_slow_path_prevalent(SeqNum(1)).await.is_err());
        let counts = observer.counts_between(SeqNum(1), SeqNum(6)).await.unwrap();
        assert_eq!((counts.fast, counts.slow), (0, 5));

        // Empty window: nothing committed, nothing prevalent
        assert!(observer.assert_slow_path_prevalent(SeqNum(7)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_with_last_counts() {
        let controller = controller_with_trace(&[Fast, Fast]);
        let observer = controller.observer();

        let err = observer
            .wait_for_slow_path_to_be_prevalent(SeqNum(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            HarnessError::PathAssertionTimeout { property, last, .. } => {
                assert_eq!(property, PathProperty::SlowPathPrevalent);
                assert_eq!(last.fast, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resumption_point_uses_evaluation_period() {
        let controller = controller_with_trace(&[]);
        let observer = controller.observer();
        assert_eq!(observer.fast_path_resumption_point(SeqNum(10)), SeqNum(74));

        let short = observer.with_config(ObserverConfig::default().with_evaluation_period(8));
        assert_eq!(short.fast_path_resumption_point(SeqNum(10)), SeqNum(18));
    }
}
