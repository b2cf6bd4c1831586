//! # Kairos — Deterministic Discrete-Event Simulation Kernel
//!
//! A kernel for modelling systems as cooperative processes on a virtual
//! clock. No async, no threads, no wall-clock time — just explicit
//! state machines driven by a time-ordered event queue. Two runs with
//! the same inputs produce the same trace, event for event.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │      Environment          │ ← owns the clock and all state
//! │  ┌─────────────────────┐ │
//! │  │   Processes          │ │ ← cooperative state machines
//! │  ├─────────────────────┤ │
//! │  │   Resources / Stores │ │ ← contention and buffering
//! │  ├─────────────────────┤ │
//! │  │   Events             │ │ ← everything waitable
//! │  ├─────────────────────┤ │
//! │  │   EventQueue         │ │ ← deterministic min-heap
//! │  ├─────────────────────┤ │
//! │  │   SimTime            │ │ ← logical clock
//! │  └─────────────────────┘ │
//! └──────────────────────────┘
//! ```
//!
//! Processes never run concurrently. Each `Environment::step` pops the
//! next event, advances the clock, and resumes every process waiting on
//! it, one at a time, in registration order. A process step may only
//! enqueue further work; nothing executes re-entrantly.

pub mod env;
pub mod error;
pub mod event;
pub mod process;
pub mod queue;
pub mod resource;
pub mod store;
pub mod time;

// Re-exports for convenience.
pub use env::{Context, Environment};
pub use error::{KairosError, KairosResult};
pub use event::{EventId, EventState, Failure, InterruptCause, Outcome, Value};
pub use process::{Process, ProcessId, ProcessState, Step, Target, Wake};
pub use queue::{EventQueue, ScheduledEvent};
pub use resource::{RequestId, RequestState, ResourceId};
pub use store::StoreId;
pub use time::SimTime;
