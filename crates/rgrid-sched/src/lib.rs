//! rgrid-sched: a cooperative, single-threaded simple scheduler.
//!
//! Pending allocation requests sit in a priority queue ordered by
//! `(-priority, submit time, id)`. The loop serves alloc/free/cancel/
//! prioritize/feasibility requests and streams resource up/down/shrink/
//! expiration updates; allocation decisions always see the latest resource
//! state because updates are applied before the next placement attempt.

pub mod queue;
pub mod sched;

pub use queue::{JobSpec, Queue, QueuedJob};
pub use sched::{
    DebugFlags, Event, HelloJob, Request, ResourceStatus, ResourceUpdate, SchedConfig, SchedError,
    SchedResponse, SimpleSched,
};
