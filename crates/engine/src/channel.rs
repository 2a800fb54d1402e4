//! The record channel (spec §4.2): a bounded queue coupling exactly one
//! reader task to exactly one writer task, with batching and a Flush
//! rendezvous. Grounded on the `kanal::bounded_async` sender/receiver pair
//! used between processing and DB-writer tasks in the teacher's
//! `db_writer.rs`, generalized to carry a `flush_period` timer the way the
//! teacher's `worker.rs` main loop polls a stream with a batch-or-partial
//! cutoff (`BLOB_STORAGE_SIZE` / partial-batch early break).

use crate::record::Record;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Terminating,
    Drained,
    Closed,
}

#[derive(Debug, PartialEq)]
pub enum SendResult {
    Sent,
    Terminated,
}

#[derive(Debug, PartialEq)]
pub enum ReceiveBatch {
    Records(Vec<Record>),
    Terminated,
}

struct Data {
    queue: VecDeque<Record>,
    state: ChannelState,
}

struct Inner {
    data: Mutex<Data>,
    capacity: usize,
    batch_size: usize,
    flush_period: Duration,
    not_full: Notify,
    not_empty: Notify,
    progressed: Notify,
    total_sent: AtomicU64,
    total_consumed: AtomicU64,
    force_flush: std::sync::atomic::AtomicBool,
}

/// Creates a bound (sender, receiver) pair. `capacity` bounds how many
/// records may sit unconsumed in the queue before `send_writer` blocks;
/// `batch_size`/`flush_period` govern how `pull_batch` groups records.
pub fn channel(capacity: usize, batch_size: usize, flush_period: Duration) -> (ChannelSender, ChannelReceiver) {
    let inner = Arc::new(Inner {
        data: Mutex::new(Data {
            queue: VecDeque::new(),
            state: ChannelState::Open,
        }),
        capacity: capacity.max(1),
        batch_size: batch_size.max(1),
        flush_period,
        not_full: Notify::new(),
        not_empty: Notify::new(),
        progressed: Notify::new(),
        total_sent: AtomicU64::new(0),
        total_consumed: AtomicU64::new(0),
        force_flush: std::sync::atomic::AtomicBool::new(false),
    });
    (
        ChannelSender { inner: inner.clone() },
        ChannelReceiver { inner },
    )
}

/// The reader-facing half of the channel.
#[derive(Clone)]
pub struct ChannelSender {
    inner: Arc<Inner>,
}

impl ChannelSender {
    /// Constructs an empty record. Does not block or touch shared state.
    pub fn create_record(&self) -> Record {
        Record::new()
    }

    /// Enqueues `record`, blocking while the queue is at capacity. Returns
    /// `Terminated` once the channel has left the `Open` state — including
    /// `Terminating`, since a record sent after `Terminate()` must not be
    /// accepted (spec §3).
    pub async fn send_writer(&self, record: Record) -> SendResult {
        loop {
            {
                let mut data = self.inner.data.lock().unwrap();
                if data.state != ChannelState::Open {
                    return SendResult::Terminated;
                }
                if data.queue.len() < self.inner.capacity {
                    data.queue.push_back(record);
                    self.inner.total_sent.fetch_add(1, Ordering::SeqCst);
                    self.inner.not_empty.notify_waiters();
                    return SendResult::Sent;
                }
            }
            self.inner.not_full.notified().await;
        }
    }

    /// Blocks until every record sent before this call has been pulled by
    /// the receiver. A happens-before barrier: a record sent after `Flush`
    /// returns is guaranteed to not be visible to a pull that completed
    /// before it.
    pub async fn flush(&self) {
        let watermark = self.inner.total_sent.load(Ordering::SeqCst);
        if self.inner.total_consumed.load(Ordering::SeqCst) >= watermark {
            return;
        }
        // Force the receiver to deliver whatever is pending right now
        // rather than waiting for batch_size/flush_period to elapse on
        // its own; otherwise this call could block long past the
        // configured flush_period for no reason.
        self.inner.force_flush.store(true, Ordering::SeqCst);
        self.inner.not_empty.notify_waiters();
        loop {
            if self.inner.total_consumed.load(Ordering::SeqCst) >= watermark {
                return;
            }
            let closed = {
                let data = self.inner.data.lock().unwrap();
                data.state == ChannelState::Closed
            };
            if closed {
                return;
            }
            self.inner.progressed.notified().await;
        }
    }

    /// Signals end-of-stream. Idempotent.
    pub fn terminate(&self) {
        let mut data = self.inner.data.lock().unwrap();
        if data.state == ChannelState::Open {
            data.state = ChannelState::Terminating;
        }
        self.inner.not_empty.notify_waiters();
    }

    /// Drops any buffered records and releases the channel. Used on abort.
    pub fn shutdown(&self) {
        shutdown_inner(&self.inner);
    }

    pub fn state(&self) -> ChannelState {
        self.inner.data.lock().unwrap().state
    }

    /// Total records ever accepted by `send_writer`. Shared with the
    /// receiver side since both handles wrap the same `Inner`.
    pub fn sent_count(&self) -> u64 {
        self.inner.total_sent.load(Ordering::SeqCst)
    }

    /// Total records ever delivered out of `pull_batch`.
    pub fn consumed_count(&self) -> u64 {
        self.inner.total_consumed.load(Ordering::SeqCst)
    }
}

/// The writer-facing half of the channel.
#[derive(Clone)]
pub struct ChannelReceiver {
    inner: Arc<Inner>,
}

impl ChannelReceiver {
    /// Blocking pull of the next batch: at most `batch_size` records, or
    /// fewer if `flush_period` elapses with pending data, or all remaining
    /// if the sender has terminated. Returns `Terminated` once the sender
    /// has terminated and the queue is fully drained.
    pub async fn pull_batch(&self) -> ReceiveBatch {
        let deadline_from_first_item = |inst: Instant| inst + self.inner.flush_period;
        let mut deadline: Option<Instant> = None;
        loop {
            {
                let mut data = self.inner.data.lock().unwrap();
                if data.queue.is_empty() {
                    if data.state == ChannelState::Terminating {
                        data.state = ChannelState::Drained;
                        return ReceiveBatch::Terminated;
                    }
                    if data.state == ChannelState::Closed {
                        return ReceiveBatch::Terminated;
                    }
                } else {
                    let take = data.queue.len().min(self.inner.batch_size);
                    let ready_by_size = data.queue.len() >= self.inner.batch_size;
                    let ready_by_terminate = data.state != ChannelState::Open;
                    let ready_by_timeout = deadline.map(|d| Instant::now() >= d).unwrap_or(false);
                    let ready_by_flush = self.inner.force_flush.swap(false, Ordering::SeqCst);
                    if ready_by_size || ready_by_terminate || ready_by_timeout || ready_by_flush {
                        let batch: Vec<Record> = data.queue.drain(..take).collect();
                        drop(data);
                        self.inner
                            .total_consumed
                            .fetch_add(batch.len() as u64, Ordering::SeqCst);
                        self.inner.not_full.notify_waiters();
                        self.inner.progressed.notify_waiters();
                        return ReceiveBatch::Records(batch);
                    }
                    if deadline.is_none() {
                        deadline = Some(deadline_from_first_item(Instant::now()));
                    }
                }
            }
            match deadline {
                Some(d) => {
                    let wait = tokio::time::sleep_until(d);
                    tokio::select! {
                        _ = self.inner.not_empty.notified() => {},
                        _ = wait => {},
                    }
                },
                None => {
                    self.inner.not_empty.notified().await;
                },
            }
        }
    }

    pub fn shutdown(&self) {
        shutdown_inner(&self.inner);
    }

    pub fn state(&self) -> ChannelState {
        self.inner.data.lock().unwrap().state
    }
}

fn shutdown_inner(inner: &Arc<Inner>) {
    let mut data = inner.data.lock().unwrap();
    data.queue.clear();
    data.state = ChannelState::Closed;
    drop(data);
    inner.not_full.notify_waiters();
    inner.not_empty.notify_waiters();
    inner.progressed.notify_waiters();
}
