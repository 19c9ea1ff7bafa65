//! tagline runtime metrics.
//!
//! Process-wide counters for batches, plucks, queue events and codec slots.
//! Exposed through metriken's registry like any other `#[metric]` static.

use metriken::{Counter, Gauge, metric};

// ── Batches ──────────────────────────────────────────────────────

#[metric(name = "tagline/batch/started", description = "Batches submitted to the engine")]
pub static BATCHES_STARTED: Counter = Counter::new();

#[metric(
    name = "tagline/batch/rejected",
    description = "Batches rejected at submission"
)]
pub static BATCHES_REJECTED: Counter = Counter::new();

#[metric(
    name = "tagline/batch/failed",
    description = "Batches that completed unsuccessfully"
)]
pub static BATCHES_FAILED: Counter = Counter::new();

// ── Completion queue ─────────────────────────────────────────────

#[metric(name = "tagline/queue/active", description = "Completion queues not yet shut down")]
pub static QUEUES_ACTIVE: Gauge = Gauge::new();

#[metric(name = "tagline/queue/events", description = "Native events demultiplexed")]
pub static QUEUE_EVENTS: Counter = Counter::new();

#[metric(
    name = "tagline/queue/unclaimed",
    description = "Events with no pluck waiter, buffered for next()"
)]
pub static QUEUE_UNCLAIMED: Counter = Counter::new();

#[metric(name = "tagline/pluck/completed", description = "Plucks that returned an event")]
pub static PLUCKS_COMPLETED: Counter = Counter::new();

#[metric(name = "tagline/pluck/timeouts", description = "Plucks that timed out")]
pub static PLUCK_TIMEOUTS: Counter = Counter::new();

// ── Calls ────────────────────────────────────────────────────────

#[metric(name = "tagline/call/active", description = "Live call handles")]
pub static CALLS_ACTIVE: Gauge = Gauge::new();

// ── Codec ────────────────────────────────────────────────────────

#[metric(
    name = "tagline/codec/slots_allocated",
    description = "Receive output slots allocated"
)]
pub static SLOTS_ALLOCATED: Counter = Counter::new();

#[metric(
    name = "tagline/codec/slots_released",
    description = "Receive output slots released"
)]
pub static SLOTS_RELEASED: Counter = Counter::new();
