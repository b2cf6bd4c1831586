//! Structured error types for Kairos.
//!
//! All fallible public APIs return `Result<T, KairosError>`. This lets
//! callers distinguish operational errors (a queue that ran dry) from
//! programming errors (scheduling in the past, releasing a slot twice)
//! without relying on panics or stringly-typed errors.

use thiserror::Error;

use crate::event::EventId;
use crate::process::ProcessId;
use crate::resource::{RequestId, ResourceId};
use crate::store::StoreId;

/// The top-level error type for the Kairos simulation kernel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KairosError {
    // ── Scheduling errors ─────────────────────────────────

    /// A timeout was requested with a negative delay.
    #[error("timeout delay must be non-negative, got {0}")]
    InvalidDelay(i64),

    /// Attempted to schedule an event in the simulation's past.
    #[error("cannot schedule at T={requested} when current time is T={current}")]
    CausalityError { requested: u64, current: u64 },

    /// Virtual-time arithmetic overflowed.
    #[error("virtual time overflow when scheduling")]
    TimeOverflow,

    // ── Event errors ──────────────────────────────────────

    /// A fixed event was triggered a second time.
    #[error("event {0} has already been triggered")]
    AlreadyTriggered(EventId),

    /// An event handle does not refer to a live event.
    #[error("event {0} is not registered in this environment")]
    UnknownEvent(EventId),

    /// `run_until_event` ran out of events before the target triggered.
    #[error("no scheduled events left, but the awaited event never triggered")]
    NoMoreEvents,

    /// The event awaited by `run_until_event` resolved to a failure.
    #[error("awaited event failed: {0}")]
    EventFailed(String),

    // ── Process errors ────────────────────────────────────

    /// Interrupt target is not currently suspended on a wait.
    #[error("process {0} cannot be interrupted (not suspended)")]
    InvalidInterruptTarget(ProcessId),

    /// A process handle does not refer to a registered process.
    #[error("process {0} is not registered in this environment")]
    UnknownProcess(ProcessId),

    /// An unobserved process failure escalated to the top-level run.
    #[error("process {process} failed: {reason}")]
    ProcessFailure { process: ProcessId, reason: String },

    // ── Resource errors ───────────────────────────────────

    /// A resource or store was built with an unusable capacity.
    #[error("capacity must be greater than zero")]
    InvalidCapacity,

    /// A request was released although it holds no slot.
    #[error("request {0} is not currently granted")]
    ResourceOverrelease(RequestId),

    /// A request handle does not refer to a live request.
    #[error("request {0} is not registered in this environment")]
    UnknownRequest(RequestId),

    /// A resource handle does not refer to a live resource.
    #[error("resource {0} is not registered in this environment")]
    UnknownResource(ResourceId),

    /// A store handle does not refer to a live store.
    #[error("store {0} is not registered in this environment")]
    UnknownStore(StoreId),
}

/// Convenience alias for `Result<T, KairosError>`.
pub type KairosResult<T> = Result<T, KairosError>;
