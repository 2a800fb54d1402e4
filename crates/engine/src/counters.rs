//! Process-wide Prometheus metrics (ambient stack item — spec §6 leaves
//! observability to the host, but the teacher's own containers always
//! expose their counters through `utils/counters.rs`'s
//! `once_cell::sync::Lazy` + `register_*` macro pattern, which this module
//! mirrors). Incremented from [`crate::job::Job::schedule_phase`] as each
//! TaskGroup finishes, the same place the teacher's `worker.rs` updates its
//! own counters right after each batch of work completes.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};

pub static RECORDS_READ: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "engine_records_read_total",
        "Records pulled out of a reader Task",
        &["job", "plugin"]
    )
    .expect("engine_records_read_total metric registration should not fail")
});

pub static RECORDS_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "engine_records_written_total",
        "Records successfully applied by a writer Task",
        &["job", "plugin"]
    )
    .expect("engine_records_written_total metric registration should not fail")
});

pub static RECORDS_DIRTY: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "engine_records_dirty_total",
        "Records routed to the dirty sink after one-by-one fallback",
        &["job", "plugin"]
    )
    .expect("engine_records_dirty_total metric registration should not fail")
});

pub static TASKS_RUNNING: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "engine_tasks_running",
        "Tasks currently in the Running state",
        &["job"]
    )
    .expect("engine_tasks_running metric registration should not fail")
});

pub static TASKS_FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "engine_tasks_failed_total",
        "Tasks that exhausted their retry budget and failed",
        &["job"]
    )
    .expect("engine_tasks_failed_total metric registration should not fail")
});
