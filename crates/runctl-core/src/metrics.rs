//! Prometheus metrics, registered lazily on first access the same way
//! `kumod`'s queue manager registers its histograms and gauges. Every
//! admission, release, promotion and cleanup touches one of these, per the
//! "observable signals" requirement.
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge_vec, Histogram,
    IntCounterVec, IntGaugeVec,
};
use std::sync::LazyLock;

pub static SLOT_ACQUIRE_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "runctl_slot_acquire_total",
        "AcquireSlot calls by repo and outcome (acquired, limit_reached)",
        &["repo_key", "outcome"]
    )
    .unwrap()
});

pub static SLOT_RELEASE_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "runctl_slot_release_total",
        "ReleaseSlot calls by repo",
        &["repo_key"]
    )
    .unwrap()
});

pub static RUNNING_SLOTS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "runctl_running_slots",
        "Running slots per repo, as last observed by this process",
        &["repo_key"]
    )
    .unwrap()
});

pub static QUEUE_DEPTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "runctl_queue_depth",
        "Queued runs per repo in this process's in-memory priority queue",
        &["repo_key"]
    )
    .unwrap()
});

pub static ACQUIRE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "runctl_acquire_duration_seconds",
        "Time spent in AcquireSlot, including driver round-trip"
    )
    .unwrap()
});
