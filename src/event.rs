//! Events and their payloads.
//!
//! Every occurrence a process can wait on is an `Event`: timeouts,
//! manual events, resource grants, store puts/gets, process completions,
//! and `all_of`/`any_of` compositions. An event is triggered at most
//! once, carries an `Outcome` (a value or a failure), and is processed
//! exactly once by the environment's driving loop.

use crate::process::ProcessId;
use crate::time::SimTime;

// ── Event ID ──────────────────────────────────────────────────────────

/// A unique identifier for an event, minted by the `Environment`.
///
/// Creation order and trigger order are distinct: an event created early
/// may be triggered late, so equal-time tie-breaking in the queue uses a
/// separate schedule sequence number, not this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct EventId(u64);

impl EventId {
    /// Wrap a raw u64 into an `EventId`.
    #[inline]
    pub fn new(raw: u64) -> Self {
        EventId(raw)
    }

    /// Return the raw value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "E#{}", self.0)
    }
}

// ── Value ─────────────────────────────────────────────────────────────

/// Payload carried by events, store items, and process return values.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    /// No payload (timeouts, bare grants, acknowledgements).
    None,
    /// An integer payload.
    Int(i64),
    /// Human-readable text (convenient for examples and tests).
    Text(String),
    /// An ordered collection, e.g. the result of `all_of`.
    List(Vec<Value>),
}

impl Value {
    /// Shorthand for `Value::Text`.
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::None => write!(f, "()"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

// ── Failure ───────────────────────────────────────────────────────────

/// Why a process was interrupted out of its current wait.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum InterruptCause {
    /// Another process called `interrupt` with an arbitrary cause value.
    Custom(Value),
    /// A preemptive resource evicted this holder.
    Preempted {
        /// The process whose request forced the eviction.
        by: ProcessId,
        /// When the evicted holder acquired the slot.
        usage_since: SimTime,
    },
}

/// A failed event outcome: either an interrupt delivered into a wait,
/// or an error raised by a process step.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum Failure {
    /// The wait was converted into an interrupt.
    Interrupted(InterruptCause),
    /// A process step raised an error.
    Error(String),
}

impl Failure {
    /// Build an error failure from any displayable reason.
    pub fn error(reason: impl Into<String>) -> Self {
        Failure::Error(reason.into())
    }

    /// Human-readable reason, used when a failure escalates to `run`.
    pub fn reason(&self) -> String {
        match self {
            Failure::Interrupted(InterruptCause::Custom(v)) => {
                format!("interrupted: {}", v)
            }
            Failure::Interrupted(InterruptCause::Preempted { by, usage_since }) => {
                format!("preempted by {} (held since {})", by, usage_since)
            }
            Failure::Error(msg) => msg.clone(),
        }
    }
}

impl From<crate::error::KairosError> for Failure {
    fn from(e: crate::error::KairosError) -> Self {
        Failure::Error(e.to_string())
    }
}

/// The result an event resolves to.
pub type Outcome = Result<Value, Failure>;

// ── Event state ───────────────────────────────────────────────────────

/// Lifecycle of an event.
///
/// `Pending` events have no outcome yet. `Triggered` events carry an
/// outcome and sit in the queue awaiting their scheduled time.
/// `Processed` events are immutable history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum EventState {
    Pending,
    Triggered,
    Processed,
}

// ── Internal event record ─────────────────────────────────────────────

/// What kind of event this is. Completions get special escalation
/// handling when they carry an unobserved failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Plain,
    Completion(ProcessId),
}

/// Something registered to be woken when an event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Waiter {
    /// A suspended process.
    Process(ProcessId),
    /// An `all_of`/`any_of` composition, identified by its own event id.
    Condition(EventId),
}

/// The environment's record of one event.
pub(crate) struct EventEntry {
    pub(crate) state: EventState,
    pub(crate) kind: EventKind,
    /// Set when the event is triggered; kept after processing so that
    /// late waiters can still read the outcome.
    pub(crate) outcome: Option<Outcome>,
    /// Waiters in registration order.
    pub(crate) waiters: Vec<Waiter>,
    /// True once anything has ever waited on this event. Failures on
    /// never-observed completion events escalate to the top-level run.
    pub(crate) observed: bool,
}

impl EventEntry {
    pub(crate) fn new(kind: EventKind) -> Self {
        EventEntry {
            state: EventState::Pending,
            kind,
            outcome: None,
            waiters: Vec::new(),
            observed: false,
        }
    }
}
