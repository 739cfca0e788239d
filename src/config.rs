//! Cluster, client, observer and workload configuration

use std::time::Duration;

use crate::error::{HarnessError, Result};

/// Fault-tolerance parameters of a BFT cluster
///
/// `f` is the number of Byzantine replicas tolerated and `c` the number of
/// slow or crashed replicas the fast path tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BftConfig {
    pub f: usize,
    pub c: usize,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self { f: 1, c: 0 }
    }
}

impl BftConfig {
    pub fn new(f: usize, c: usize) -> Self {
        Self { f, c }
    }

    /// Number of replicas, `3f + 2c + 1`
    pub fn n(&self) -> usize {
        3 * self.f + 2 * self.c + 1
    }

    /// Replicas that must participate for a fast-path commit
    pub fn fast_quorum(&self) -> usize {
        self.n() - self.c
    }

    /// Replicas that must participate for a slow-path commit
    pub fn slow_quorum(&self) -> usize {
        2 * self.f + self.c + 1
    }

    /// Matching replies needed to trust a read
    pub fn read_quorum(&self) -> usize {
        self.f + 1
    }

    /// Every configuration with at most `max_n` replicas accepted by
    /// `predicate(n, f, c)`, ordered by `n`
    pub fn enumerate(max_n: usize, predicate: impl Fn(usize, usize, usize) -> bool) -> Vec<Self> {
        let mut configs = Vec::new();
        for f in 1.. {
            let base = Self::new(f, 0);
            if base.n() > max_n {
                break;
            }
            for c in 0.. {
                let config = Self::new(f, c);
                if config.n() > max_n {
                    break;
                }
                if predicate(config.n(), f, c) {
                    configs.push(config);
                }
            }
        }
        configs.sort_by_key(|config| (config.n(), config.f));
        configs
    }
}

/// Per-client request timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Upper bound on one call, retries included (default: 3000ms)
    pub request_timeout: Duration,
    /// Pause before resending after a retriable error (default: 100ms)
    pub retry_timeout: Duration,
    /// Resends allowed before giving up (default: 20)
    pub retry_count: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(3000),
            retry_timeout: Duration::from_millis(100),
            retry_count: 20,
        }
    }
}

/// Retry interval used by clients that issue long-running requests
const LONG_REQUEST_RETRY_TIMEOUT: Duration = Duration::from_millis(1000);

impl ClientConfig {
    /// Configuration for a client whose request may take up to
    /// `request_timeout` to execute
    pub fn long_request(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            retry_timeout: LONG_REQUEST_RETRY_TIMEOUT,
            ..Default::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(HarnessError::Config("request timeout must be positive".into()));
        }
        if self.retry_timeout >= self.request_timeout {
            return Err(HarnessError::Config(format!(
                "retry timeout {:?} must be shorter than request timeout {:?}",
                self.retry_timeout, self.request_timeout
            )));
        }
        Ok(())
    }
}

/// Commit-path observation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverConfig {
    /// Sequence numbers the protocol waits before returning to the fast path (default: 64)
    pub evaluation_period: u64,
    /// Commits of the non-prevalent path still accepted by prevalence assertions (default: 0)
    pub tolerance: u64,
    /// Interval between polls in `wait_for_*` (default: 100ms)
    pub poll_interval: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            evaluation_period: 64,
            tolerance: 0,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ObserverConfig {
    pub fn with_evaluation_period(mut self, period: u64) -> Self {
        self.evaluation_period = period;
        self
    }

    pub fn with_tolerance(mut self, tolerance: u64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Workload composition and pacing
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadConfig {
    /// Pause between dispatch batches and between background requests (default: 100ms)
    pub batch_pause: Duration,
    /// Number of distinct keys drawn from (default: 64)
    pub key_space: usize,
    /// Length of generated values (default: 12)
    pub value_len: usize,
    /// Expected execution time of a long-running request (default: 10s)
    pub long_exec_estimate: Duration,
    /// Slack added on top of the estimate for the long request's timeout (default: 5s)
    pub long_exec_margin: Duration,
    /// Count failed operations instead of aborting the workload (default: false)
    pub tolerate_failures: bool,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            batch_pause: Duration::from_millis(100),
            key_space: 64,
            value_len: 12,
            long_exec_estimate: Duration::from_secs(10),
            long_exec_margin: Duration::from_secs(5),
            tolerate_failures: false,
        }
    }
}

impl WorkloadConfig {
    pub fn with_batch_pause(mut self, pause: Duration) -> Self {
        self.batch_pause = pause;
        self
    }

    pub fn with_key_space(mut self, keys: usize) -> Self {
        self.key_space = keys;
        self
    }

    pub fn with_long_exec(mut self, estimate: Duration, margin: Duration) -> Self {
        self.long_exec_estimate = estimate;
        self.long_exec_margin = margin;
        self
    }

    pub fn tolerating_failures(mut self) -> Self {
        self.tolerate_failures = true;
        self
    }

    /// Timeout a client needs to wait out a long-running request
    pub fn long_request_timeout(&self) -> Duration {
        self.long_exec_estimate + self.long_exec_margin
    }
}

/// Whole-cluster configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub bft: BftConfig,
    /// Client handles created up front (default: 10)
    pub num_clients: usize,
    /// Bound on a replica start or stop (default: 5s)
    pub transition_timeout: Duration,
    /// Interval between view polls in `wait_for_view` (default: 500ms)
    pub view_poll_interval: Duration,
    pub client: ClientConfig,
    pub observer: ObserverConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bft: BftConfig::default(),
            num_clients: 10,
            transition_timeout: Duration::from_secs(5),
            view_poll_interval: Duration::from_millis(500),
            client: ClientConfig::default(),
            observer: ObserverConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn new(bft: BftConfig) -> Self {
        Self {
            bft,
            ..Default::default()
        }
    }

    pub fn with_clients(mut self, count: usize) -> Self {
        self.num_clients = count;
        self
    }

    pub fn with_client_config(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    pub fn with_observer(mut self, observer: ObserverConfig) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_view_poll_interval(mut self, interval: Duration) -> Self {
        self.view_poll_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.bft.f == 0 {
            return Err(HarnessError::Config("f must be at least 1".into()));
        }
        if self.num_clients == 0 {
            return Err(HarnessError::Config("at least one client is required".into()));
        }
        if self.view_poll_interval.is_zero() || self.observer.poll_interval.is_zero() {
            return Err(HarnessError::Config("poll intervals must be positive".into()));
        }
        if self.observer.evaluation_period == 0 {
            return Err(HarnessError::Config("evaluation period must be positive".into()));
        }
        self.client.validate()
    }
}
