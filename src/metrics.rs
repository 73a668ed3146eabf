//! ringcall runtime metrics.
//!
//! Counters for ring utilization, request lifecycle, and buffer
//! recycling. Exposed through the metriken registry.

use metriken::{metric, Counter};

// ── Ring utilization ─────────────────────────────────────────────

#[metric(name = "ringcall/cqe/processed", description = "Total CQEs processed")]
pub static CQE_PROCESSED: Counter = Counter::new();

#[metric(
    name = "ringcall/sqe/submit_failures",
    description = "SQE submission failures"
)]
pub static SQE_SUBMIT_FAILURES: Counter = Counter::new();

// ── Request lifecycle ────────────────────────────────────────────

#[metric(
    name = "ringcall/requests/pushed",
    description = "Requests accepted by the engine"
)]
pub static REQUESTS_PUSHED: Counter = Counter::new();

#[metric(
    name = "ringcall/requests/released",
    description = "Request records released back to the pool"
)]
pub static REQUESTS_RELEASED: Counter = Counter::new();

#[metric(
    name = "ringcall/requests/rejected",
    description = "Pushes rejected because the request pool was exhausted"
)]
pub static REQUESTS_REJECTED: Counter = Counter::new();

#[metric(
    name = "ringcall/multishot/rearmed",
    description = "Multishot registrations re-armed after the kernel cleared the more flag"
)]
pub static MULTISHOT_REARMED: Counter = Counter::new();

// ── Dispatch health ──────────────────────────────────────────────

#[metric(
    name = "ringcall/completions/malformed",
    description = "Completions discarded during validation"
)]
pub static MALFORMED_COMPLETIONS: Counter = Counter::new();

#[metric(
    name = "ringcall/buffers/recycled",
    description = "Provided buffers returned to the kernel ring"
)]
pub static BUFFERS_RECYCLED: Counter = Counter::new();
