//! The TaskGroup container (spec §4.6): a concurrency-bounded pool that
//! runs a shard of a Job's Tasks, retrying any that fail up to a per-group
//! attempt budget. Grounded on the teacher's `launch_db_writer_tasks`,
//! which spawns a fixed number of worker loops pulling from one queue and
//! joins them at the end; this module needs to observe and requeue
//! individual failures rather than just await the whole batch, so it
//! joins via `tokio::task::JoinSet` instead of the teacher's
//! `futures::future::try_join_all`.

use crate::error::FailureCause;
use crate::task::{Task, TaskState};
use std::collections::VecDeque;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct GroupReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub aborted: usize,
    pub failures: Vec<FailureCause>,
    pub records_read: u64,
    pub records_written: u64,
}

/// How many times a failing Task is retried before the group gives up on
/// it (spec §4.6: "failed Tasks MAY be requeued up to `maxAttempt`").
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub max_attempts: u32,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self { max_attempts: 1 }
    }
}

/// A concurrency-bounded pool of Tasks. `concurrency_limit` slots pull
/// from a FIFO queue; a Task that fails is requeued (with an incremented
/// attempt counter) until it exhausts its retry budget.
pub struct TaskGroup {
    pub concurrency_limit: usize,
    pub retry_budget: RetryBudget,
}

impl TaskGroup {
    pub fn new(concurrency_limit: usize, retry_budget: RetryBudget) -> Self {
        Self {
            concurrency_limit: concurrency_limit.max(1),
            retry_budget,
        }
    }

    /// Runs every Task in `tasks` to completion, respecting the
    /// concurrency limit, and returns an aggregate report. Tasks are
    /// `init`'d and `destroy`'d individually; a Task that still fails
    /// after exhausting its retry budget contributes to `failed`.
    pub async fn run(&self, tasks: Vec<Task>, cancel: CancellationToken) -> GroupReport {
        let semaphore = std::sync::Arc::new(Semaphore::new(self.concurrency_limit));
        let mut queue: VecDeque<(Task, u32)> = tasks.into_iter().map(|t| (t, 0)).collect();
        let mut report = GroupReport {
            total: queue.len(),
            ..Default::default()
        };
        let mut in_flight = tokio::task::JoinSet::new();

        loop {
            while let Some((mut task, attempt)) = queue.pop_front() {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                let cancel = cancel.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    if let Err(err) = task.init().await {
                        let task_id = task.ordinal as u64;
                        return (
                            task,
                            attempt,
                            TaskState::Aborted,
                            Some(FailureCause {
                                phase: "init".to_string(),
                                plugin: "task".to_string(),
                                task_id: Some(task_id),
                                underlying: err.to_string(),
                            }),
                            0u64,
                            0u64,
                        );
                    }
                    let outcome = task.run(cancel).await;
                    task.destroy().await;
                    (
                        task,
                        attempt,
                        outcome.state,
                        outcome.failure,
                        outcome.records_read,
                        outcome.records_written,
                    )
                });
                if in_flight.len() >= self.concurrency_limit && !queue.is_empty() {
                    break;
                }
            }
            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (task, attempt, state, failure, records_read, records_written) = joined.expect("task runner panicked");
            match state {
                TaskState::Succeeded => {
                    report.succeeded += 1;
                    report.records_read += records_read;
                    report.records_written += records_written;
                },
                TaskState::Aborted => report.aborted += 1,
                TaskState::Failed => {
                    if attempt + 1 < self.retry_budget.max_attempts {
                        queue.push_back((task, attempt + 1));
                    } else {
                        report.failed += 1;
                        report.records_read += records_read;
                        report.records_written += records_written;
                        if let Some(cause) = failure {
                            report.failures.push(cause);
                        }
                    }
                },
                TaskState::New | TaskState::Initialised | TaskState::Running | TaskState::Destroyed => {
                    unreachable!("run() never returns these states")
                },
            }
            if queue.is_empty() && in_flight.is_empty() {
                break;
            }
        }
        report
    }
}
