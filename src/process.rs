//! Cooperative processes.
//!
//! A `Process` is a suspendable unit of simulated work. Because the
//! kernel uses no coroutine primitives, a process is an explicit state
//! machine: the environment calls `resume` with the reason for waking,
//! and the process runs one step and returns either the next wait
//! target or its final value. The resume point lives in the process's
//! own fields.
//!
//! # Contract
//! - Implementations must not use global mutable state.
//! - All side effects must go through the provided `Context`.
//! - `resume` must be deterministic given the same inputs.

use crate::env::Context;
use crate::event::{EventId, Failure, InterruptCause, Value};
use crate::resource::RequestId;

// ── ProcessId ─────────────────────────────────────────────────────────

/// A unique identifier for a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcessId(u64);

impl ProcessId {
    #[inline]
    pub fn new(id: u64) -> Self {
        ProcessId(id)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

// ── Process state ─────────────────────────────────────────────────────

/// Lifecycle of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ProcessState {
    /// Spawned, first resumption not yet delivered.
    Created,
    /// Currently executing a step.
    Running,
    /// Blocked on a wait target.
    Suspended,
    /// Completed normally. The completion event carries the return value.
    Terminated,
    /// A step returned an error. The completion event carries the failure.
    Failed,
}

// ── Wake / Step / Target ──────────────────────────────────────────────

/// Why a process is being resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wake {
    /// First resumption after spawning.
    Start,
    /// The awaited event triggered with this value.
    Value(Value),
    /// The wait ended in a failure: an interrupt, or an awaited event
    /// (for example another process's completion) that failed.
    Failure(Failure),
}

impl Wake {
    /// Treat any failure wake as an error to propagate.
    ///
    /// This is the idiom for steps that do not handle interrupts:
    /// `let value = wake.into_value()?;` escalates the failure and the
    /// process transitions to `Failed`.
    pub fn into_value(self) -> Result<Value, Failure> {
        match self {
            Wake::Start => Ok(Value::None),
            Wake::Value(v) => Ok(v),
            Wake::Failure(f) => Err(f),
        }
    }

    /// The interrupt cause, if this wake is an interrupt delivery.
    pub fn interrupted(&self) -> Option<&InterruptCause> {
        match self {
            Wake::Failure(Failure::Interrupted(cause)) => Some(cause),
            _ => None,
        }
    }
}

/// What a process does next, yielded by one step of `resume`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Suspend until the target is satisfied.
    Wait(Target),
    /// Terminate normally with a return value.
    Done(Value),
}

/// A single wait target. Composed waits (`all_of`, `any_of`) are events
/// themselves, so `Event` covers them too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// An event: timeout, manual event, store operation, composition.
    Event(EventId),
    /// A resource grant.
    Request(RequestId),
    /// Another process's completion.
    Join(ProcessId),
}

// ── Process trait ─────────────────────────────────────────────────────

/// Trait implemented by every simulated process.
///
/// The environment calls `resume` once per step. Returning
/// `Ok(Step::Wait(..))` suspends the process; `Ok(Step::Done(..))`
/// terminates it and triggers its completion event with the value;
/// `Err(failure)` fails it and the completion event carries the failure.
pub trait Process {
    /// Run one step of user logic.
    fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, Failure>;
}

// ── Internal process record ───────────────────────────────────────────

/// The environment's record of one process.
pub(crate) struct ProcessEntry {
    /// Taken out of the slot while the process is executing a step.
    pub(crate) body: Option<Box<dyn Process>>,
    pub(crate) state: ProcessState,
    /// The event this process is registered on while suspended, kept so
    /// an interrupt can detach it from the wait.
    pub(crate) wait: Option<EventId>,
    /// Triggered when the process terminates or fails.
    pub(crate) completion: EventId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_id_display() {
        assert_eq!(format!("{}", ProcessId::new(7)), "P7");
    }

    #[test]
    fn test_wake_into_value() {
        assert_eq!(Wake::Start.into_value(), Ok(Value::None));
        assert_eq!(Wake::Value(Value::Int(3)).into_value(), Ok(Value::Int(3)));
        let f = Failure::error("boom");
        assert_eq!(Wake::Failure(f.clone()).into_value(), Err(f));
    }

    #[test]
    fn test_wake_interrupted() {
        let cause = InterruptCause::Custom(Value::text("stop"));
        let wake = Wake::Failure(Failure::Interrupted(cause.clone()));
        assert_eq!(wake.interrupted(), Some(&cause));
        assert_eq!(Wake::Start.interrupted(), None);
        assert_eq!(
            Wake::Failure(Failure::error("x")).interrupted(),
            None
        );
    }
}
