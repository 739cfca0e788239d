//! Structured concurrency for workload tasks
//!
//! A `TaskGroup` owns its child tasks: the first failure cancels the
//! siblings, and every child is joined or aborted before the group is
//! consumed. Dropping the group aborts whatever is still running.

use std::future::Future;

use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{HarnessError, Result};

pub struct TaskGroup<T> {
    /// `None` marks a child that stopped because the group was cancelled
    tasks: JoinSet<Option<Result<T>>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Group that is also cancelled when `parent` is
    pub fn with_token(parent: CancellationToken) -> Self {
        TaskGroup {
            tasks: JoinSet::new(),
            cancel: parent.child_token(),
        }
    }

    /// Token cancelled when the group shuts down
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => None,
                result = task => Some(result),
            }
        });
    }

    /// Cancel all children without waiting for them
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for every child, in completion order
    ///
    /// On the first failure the siblings are cancelled and the error is
    /// returned. A panicking child is resumed on the caller.
    pub async fn join_all(mut self) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            if let Some(value) = self.settle(joined).await? {
                results.push(value);
            }
        }
        Ok(results)
    }

    /// Like [`TaskGroup::join_all`], but children still running at
    /// `deadline` are abandoned and only finished results are returned
    pub async fn join_until(mut self, deadline: Instant) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        loop {
            match timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(joined)) => {
                    if let Some(value) = self.settle(joined).await? {
                        results.push(value);
                    }
                }
                Ok(None) => return Ok(results),
                Err(_) => {
                    debug!(abandoned = self.tasks.len(), "Deadline reached, abandoning tasks");
                    self.shutdown().await;
                    return Ok(results);
                }
            }
        }
    }

    async fn settle(
        &mut self,
        joined: std::result::Result<Option<Result<T>>, tokio::task::JoinError>,
    ) -> Result<Option<T>> {
        match joined {
            Ok(Some(Ok(value))) => Ok(Some(value)),
            Ok(Some(Err(e))) => {
                self.shutdown().await;
                Err(e)
            }
            Ok(None) => Ok(None),
            Err(join_err) if join_err.is_panic() => {
                self.shutdown().await;
                std::panic::resume_unwind(join_err.into_panic())
            }
            Err(join_err) => Err(HarnessError::Task(join_err.to_string())),
        }
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}
