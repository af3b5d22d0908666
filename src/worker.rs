//! Bounded-concurrency task dispatcher with retry and cancellation
//!
//! The pool processes a finite task list with a fixed number of worker
//! threads and hands results back over a channel in completion order (which
//! is unspecified relative to submission order). For each task it first asks
//! the executor whether the task can be skipped outright - the cheap
//! fingerprint check - and only then invokes the executor proper, retrying
//! failed executions with quadratic backoff (`base * attempt²`) plus up to a
//! second of uniform jitter.
//!
//! Cancellation is cooperative: the feeder stops handing out tasks, workers
//! stop picking them up, and the retry loop aborts between attempts. A task
//! that fails with the cancellation error is never retried.

use crate::error::{BackupError, Result};
use crate::types::CancellationToken;
use crossbeam_channel::{bounded, unbounded, Receiver};
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Upper bound of the uniform jitter added to every backoff delay
const MAX_BACKOFF_JITTER: Duration = Duration::from_secs(1);

/// Per-task behaviour plugged into the pool
pub trait TaskExecutor<T>: Send + Sync {
    /// Cheap pre-check; returning `true` finishes the task as skipped
    fn should_skip(&self, task: &T) -> Result<bool>;

    /// Perform the task; failures are retried per the pool's policy
    fn execute(&self, task: &T) -> Result<()>;
}

/// Terminal state of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Executed successfully
    Completed,
    /// Skipped by the executor's pre-check
    Skipped,
    /// Failed after the retry budget (or without retry eligibility)
    Failed,
}

/// One task's result, delivered over the pool's channel
#[derive(Debug)]
pub struct TaskResult<T> {
    /// The task itself, moved back to the caller
    pub task: T,
    /// How it ended
    pub status: TaskStatus,
    /// The captured error for failed tasks
    pub error: Option<BackupError>,
}

/// Bounded worker pool
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl WorkerPool {
    /// Create a pool
    ///
    /// `retry_attempts` is the total number of attempts per task; both it and
    /// the worker count are clamped to at least 1.
    pub fn new(workers: usize, retry_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            workers: workers.max(1),
            retry_attempts: retry_attempts.max(1),
            retry_delay,
        }
    }

    /// Process `tasks`, returning a receiver of results
    ///
    /// The receiver closes once every started task has finished. Tasks not
    /// yet started when cancellation is observed are dropped without a
    /// result.
    pub fn execute<T, E>(
        &self,
        tasks: Vec<T>,
        executor: Arc<E>,
        cancel: CancellationToken,
    ) -> Receiver<TaskResult<T>>
    where
        T: Send + 'static,
        E: TaskExecutor<T> + 'static,
    {
        let (task_tx, task_rx) = bounded::<T>(self.workers);
        let (result_tx, result_rx) = unbounded::<TaskResult<T>>();

        let feeder_cancel = cancel.clone();
        thread::spawn(move || {
            for task in tasks {
                if feeder_cancel.is_cancelled() {
                    trace!("feeder stopping on cancellation");
                    break;
                }
                if task_tx.send(task).is_err() {
                    break;
                }
            }
        });

        for worker_id in 0..self.workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let executor = Arc::clone(&executor);
            let cancel = cancel.clone();
            let pool = self.clone();

            thread::spawn(move || {
                trace!(worker_id, "worker started");
                for task in task_rx.iter() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let result = pool.process(&*executor, &task, &cancel);
                    let done = TaskResult {
                        task,
                        status: result.0,
                        error: result.1,
                    };
                    if result_tx.send(done).is_err() {
                        break;
                    }
                }
                trace!(worker_id, "worker finished");
            });
        }

        result_rx
    }

    fn process<T, E: TaskExecutor<T>>(
        &self,
        executor: &E,
        task: &T,
        cancel: &CancellationToken,
    ) -> (TaskStatus, Option<BackupError>) {
        match executor.should_skip(task) {
            Ok(true) => return (TaskStatus::Skipped, None),
            Ok(false) => {}
            Err(e) => return (TaskStatus::Failed, Some(e)),
        }

        match self.execute_with_retry(executor, task, cancel) {
            Ok(()) => (TaskStatus::Completed, None),
            Err(e) => (TaskStatus::Failed, Some(e)),
        }
    }

    fn execute_with_retry<T, E: TaskExecutor<T>>(
        &self,
        executor: &E,
        task: &T,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            match executor.execute(task) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "task attempt failed");
                    last_error = Some(e);
                    if attempt < self.retry_attempts {
                        let backoff = self.retry_delay * (attempt * attempt);
                        let jitter = Duration::from_millis(
                            rand::thread_rng().gen_range(0..MAX_BACKOFF_JITTER.as_millis() as u64),
                        );
                        debug!(attempt, ?backoff, ?jitter, "backing off before retry");
                        thread::sleep(backoff + jitter);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BackupError::internal("retry loop without error")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingExecutor {
        attempts: AtomicU32,
        fail_first: u32,
        skip: bool,
    }

    impl CountingExecutor {
        fn new(fail_first: u32, skip: bool) -> Self {
            Self {
                attempts: AtomicU32::new(0),
                fail_first,
                skip,
            }
        }
    }

    impl TaskExecutor<u32> for CountingExecutor {
        fn should_skip(&self, _task: &u32) -> Result<bool> {
            Ok(self.skip)
        }

        fn execute(&self, task: &u32) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_first {
                Err(BackupError::copy("/src", "/dst", format!("attempt {attempt} of task {task}")))
            } else {
                Ok(())
            }
        }
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(2, 3, Duration::from_millis(1))
    }

    #[test]
    fn test_all_tasks_complete() {
        let executor = Arc::new(CountingExecutor::new(0, false));
        let results: Vec<_> = pool()
            .execute(vec![1, 2, 3, 4], executor, CancellationToken::new())
            .iter()
            .collect();

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.status == TaskStatus::Completed));
    }

    #[test]
    fn test_skip_check_short_circuits() {
        let executor = Arc::new(CountingExecutor::new(0, true));
        let results: Vec<_> = pool()
            .execute(vec![1, 2], Arc::clone(&executor), CancellationToken::new())
            .iter()
            .collect();

        assert!(results.iter().all(|r| r.status == TaskStatus::Skipped));
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retry_then_success() {
        let executor = Arc::new(CountingExecutor::new(2, false));
        let results: Vec<_> = pool()
            .execute(vec![7], Arc::clone(&executor), CancellationToken::new())
            .iter()
            .collect();

        assert_eq!(results[0].status, TaskStatus::Completed);
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_exhaustion_yields_single_failure() {
        let executor = Arc::new(CountingExecutor::new(u32::MAX, false));
        let results: Vec<_> = pool()
            .execute(vec![7], Arc::clone(&executor), CancellationToken::new())
            .iter()
            .collect();

        assert_eq!(results.len(), 1, "exactly one result per exhausted task");
        assert_eq!(results[0].status, TaskStatus::Failed);
        assert!(results[0].error.is_some());
        // The budget is total attempts, not extra retries.
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_non_retryable_error_fails_fast() {
        struct Unreadable;
        impl TaskExecutor<u32> for Unreadable {
            fn should_skip(&self, _task: &u32) -> Result<bool> {
                Ok(false)
            }
            fn execute(&self, _task: &u32) -> Result<()> {
                Err(BackupError::unreadable("/gone", "no such file"))
            }
        }

        let results: Vec<_> = pool()
            .execute(vec![1], Arc::new(Unreadable), CancellationToken::new())
            .iter()
            .collect();
        assert_eq!(results[0].status, TaskStatus::Failed);
    }

    #[test]
    fn test_cancelled_pool_drops_unstarted_tasks() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let executor = Arc::new(CountingExecutor::new(0, false));
        let results: Vec<_> = pool()
            .execute((0..100).collect(), Arc::clone(&executor), cancel)
            .iter()
            .collect();

        // Nothing was attempted; nothing is reported.
        assert!(results.len() < 100);
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 0);
    }
}
