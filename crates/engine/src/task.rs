//! The Task container (spec §4.5): one reader-task/writer-task pair
//! joined by exactly one record channel. Grounded on the teacher's
//! `worker.rs` spawn-and-join pattern, where a processor loop and its
//! paired writer task are spawned concurrently and the outer future waits
//! on both, propagating whichever side failed first.

use crate::channel::channel;
use crate::error::{EngineError, FailureCause};
use crate::plugin::{ReaderTask, WriterTask};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Initialised,
    Running,
    Succeeded,
    Failed,
    Aborted,
    Destroyed,
}

pub struct TaskOutcome {
    pub state: TaskState,
    pub failure: Option<FailureCause>,
    pub records_read: u64,
    pub records_written: u64,
}

/// One unit of concurrent work: a reader task feeding a writer task over a
/// private channel.
pub struct Task {
    pub ordinal: usize,
    pub reader: Box<dyn ReaderTask>,
    pub writer: Box<dyn WriterTask>,
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub flush_period: Duration,
    state: TaskState,
}

impl Task {
    pub fn new(
        ordinal: usize,
        reader: Box<dyn ReaderTask>,
        writer: Box<dyn WriterTask>,
        channel_capacity: usize,
        batch_size: usize,
        flush_period: Duration,
    ) -> Self {
        Self {
            ordinal,
            reader,
            writer,
            channel_capacity,
            batch_size,
            flush_period,
            state: TaskState::New,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Initialises both sides in reader-then-writer order. On failure,
    /// aborts and destroys whatever already succeeded before returning.
    pub async fn init(&mut self) -> Result<(), EngineError> {
        if let Err(err) = self.reader.init().await {
            self.state = TaskState::Aborted;
            return Err(err);
        }
        if let Err(err) = self.writer.init().await {
            self.reader.destroy().await.ok();
            self.state = TaskState::Aborted;
            return Err(err);
        }
        self.state = TaskState::Initialised;
        Ok(())
    }

    /// Runs the reader and writer concurrently over a fresh channel until
    /// both sides complete. Whichever side finishes first is inspected
    /// immediately: if it errored, the channel is shut down right away so
    /// the other side isn't left blocked on a dead peer (a writer parked in
    /// `pull_batch`, or a reader parked in `send_writer`) before we wait for
    /// it to unwind.
    pub async fn run(&mut self, cancel: CancellationToken) -> TaskOutcome {
        if self.state != TaskState::Initialised {
            return TaskOutcome {
                state: TaskState::Aborted,
                failure: Some(FailureCause {
                    phase: "run".to_string(),
                    plugin: "task".to_string(),
                    task_id: Some(self.ordinal as u64),
                    underlying: "run() called before a successful init()".to_string(),
                }),
                records_read: 0,
                records_written: 0,
            };
        }
        self.state = TaskState::Running;
        let (sender, receiver) = channel(self.channel_capacity, self.batch_size, self.flush_period);

        let reader = &mut self.reader;
        let reader_cancel = cancel.clone();
        let reader_sender = sender.clone();
        let read_fut = async move {
            tokio::select! {
                result = reader.start_read(reader_sender.clone()) => result,
                _ = reader_cancel.cancelled() => {
                    reader_sender.shutdown();
                    Err(EngineError::Cancelled)
                },
            }
        };

        let writer = &mut self.writer;
        let writer_cancel = cancel.clone();
        let write_fut = async move {
            tokio::select! {
                result = writer.start_write(receiver) => result,
                _ = writer_cancel.cancelled() => Err(EngineError::Cancelled),
            }
        };

        // A plain `tokio::join!` would wait for both sides no matter what,
        // but a reader that errors out without calling `terminate()` leaves
        // the writer parked in `pull_batch()` forever, and a writer that
        // errors leaves the reader parked in `send_writer()` against a sink
        // that will never drain. Poll both concurrently and shut the
        // channel down the instant either side finishes with an error, so
        // the other side is unblocked before we wait on it.
        tokio::pin!(read_fut);
        tokio::pin!(write_fut);
        let mut read_result: Option<Result<(), EngineError>> = None;
        let mut write_result: Option<Result<(), EngineError>> = None;
        while read_result.is_none() || write_result.is_none() {
            tokio::select! {
                result = &mut read_fut, if read_result.is_none() => {
                    if result.is_err() {
                        sender.shutdown();
                    }
                    read_result = Some(result);
                },
                result = &mut write_fut, if write_result.is_none() => {
                    if result.is_err() {
                        sender.shutdown();
                    }
                    write_result = Some(result);
                },
            }
        }
        let read_result = read_result.expect("loop only exits once both sides resolved");
        let write_result = write_result.expect("loop only exits once both sides resolved");
        let records_read = sender.sent_count();
        let records_written = sender.consumed_count();

        match (read_result, write_result) {
            (Ok(()), Ok(())) => {
                self.state = TaskState::Succeeded;
                TaskOutcome {
                    state: TaskState::Succeeded,
                    failure: None,
                    records_read,
                    records_written,
                }
            },
            (Err(EngineError::Cancelled), _) | (_, Err(EngineError::Cancelled)) => {
                self.state = TaskState::Aborted;
                TaskOutcome {
                    state: TaskState::Aborted,
                    failure: None,
                    records_read,
                    records_written,
                }
            },
            (Err(err), _) => {
                self.state = TaskState::Failed;
                TaskOutcome {
                    state: TaskState::Failed,
                    failure: Some(FailureCause {
                        phase: "run".to_string(),
                        plugin: "reader".to_string(),
                        task_id: Some(self.ordinal as u64),
                        underlying: err.to_string(),
                    }),
                    records_read,
                    records_written,
                }
            },
            (_, Err(err)) => {
                self.state = TaskState::Failed;
                TaskOutcome {
                    state: TaskState::Failed,
                    failure: Some(FailureCause {
                        phase: "run".to_string(),
                        plugin: "writer".to_string(),
                        task_id: Some(self.ordinal as u64),
                        underlying: err.to_string(),
                    }),
                    records_read,
                    records_written,
                }
            },
        }
    }

    /// Tears down both sides, writer first, swallowing destroy errors
    /// (spec §4.5: "Destroy failures are logged, never surfaced as the
    /// Task's outcome").
    pub async fn destroy(&mut self) {
        if let Err(err) = self.writer.destroy().await {
            tracing::warn!(ordinal = self.ordinal, error = %err, "writer destroy failed");
        }
        if let Err(err) = self.reader.destroy().await {
            tracing::warn!(ordinal = self.ordinal, error = %err, "reader destroy failed");
        }
        self.state = TaskState::Destroyed;
    }
}
