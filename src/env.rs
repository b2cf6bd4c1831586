//! The simulation environment: virtual clock, driving loop, and the
//! operations processes use to wait, compose events, and interrupt each
//! other.
//!
//! Execution is single-threaded and cooperative: exactly one process
//! step runs at a time, and every effect of a step (timeouts, grants,
//! spawns, interrupts) is enqueued rather than executed re-entrantly.
//! All events scheduled for virtual time T fire before `now` exceeds T,
//! and equal-time ties break by schedule order, so a fixed program with
//! a fixed seed replays identically.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::error::{KairosError, KairosResult};
use crate::event::{
    EventEntry, EventId, EventKind, EventState, Failure, InterruptCause, Outcome, Value, Waiter,
};
use crate::process::{Process, ProcessEntry, ProcessId, ProcessState, Step, Target, Wake};
use crate::queue::EventQueue;
use crate::resource::{RequestEntry, RequestId, ResourcePool};
use crate::store::StoreCore;
use crate::time::SimTime;

// ── Condition bookkeeping ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CondKind {
    All,
    Any,
}

/// An in-flight `all_of`/`any_of` composition, keyed by the synthetic
/// event that represents it.
struct Condition {
    kind: CondKind,
    components: Vec<EventId>,
    /// Collected component values, in component order (`All` only).
    results: Vec<Option<Value>>,
    remaining: usize,
}

// ── Environment ───────────────────────────────────────────────────────

/// Owner of the virtual clock, the event queue, and every process,
/// event, resource, and store of one simulation run.
pub struct Environment {
    queue: EventQueue,
    now: SimTime,
    next_event_id: u64,
    next_process_id: u64,
    pub(crate) next_request_id: u64,
    pub(crate) events: BTreeMap<EventId, EventEntry>,
    pub(crate) procs: BTreeMap<ProcessId, ProcessEntry>,
    conditions: BTreeMap<EventId, Condition>,
    pub(crate) resources: Vec<ResourcePool>,
    pub(crate) requests: BTreeMap<RequestId, RequestEntry>,
    pub(crate) stores: Vec<StoreCore>,
    /// Set when an unobserved process failure must abort the run.
    unhandled: Option<KairosError>,
    events_processed: u64,
}

impl Environment {
    /// Create an environment starting at time zero.
    pub fn new() -> Self {
        Self::at(SimTime::ZERO)
    }

    /// Create an environment starting at an arbitrary initial time.
    pub fn at(initial: SimTime) -> Self {
        Environment {
            queue: EventQueue::new(),
            now: initial,
            next_event_id: 0,
            next_process_id: 0,
            next_request_id: 0,
            events: BTreeMap::new(),
            procs: BTreeMap::new(),
            conditions: BTreeMap::new(),
            resources: Vec::new(),
            requests: BTreeMap::new(),
            stores: Vec::new(),
            unhandled: None,
            events_processed: 0,
        }
    }

    /// Current virtual time.
    #[inline]
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Total events processed so far.
    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Number of entries still waiting in the queue.
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// The time of the next queued event, if any.
    pub fn peek_time(&self) -> Option<SimTime> {
        self.queue.peek_time()
    }

    // ── Event creation and triggering ─────────────────────────

    pub(crate) fn mint_event(&mut self, kind: EventKind) -> EventId {
        let id = EventId::new(self.next_event_id);
        self.next_event_id += 1;
        self.events.insert(id, EventEntry::new(kind));
        id
    }

    /// Mark a pending event as triggered with `outcome` and queue it for
    /// processing at `at`. Internal callers guarantee the event exists
    /// and is still pending.
    pub(crate) fn fire_at(&mut self, eid: EventId, at: SimTime, outcome: Outcome) {
        let entry = self
            .events
            .get_mut(&eid)
            .expect("fired an event with no entry");
        debug_assert_eq!(entry.state, EventState::Pending, "event fired twice");
        entry.state = EventState::Triggered;
        entry.outcome = Some(outcome);
        self.queue.schedule(eid, at);
    }

    /// Create a new manual event in the `Pending` state.
    pub fn event(&mut self) -> EventId {
        self.mint_event(EventKind::Plain)
    }

    /// Trigger a manual event with a value, scheduling its processing at
    /// the current time. Fails with `AlreadyTriggered` on re-trigger.
    pub fn succeed(&mut self, eid: EventId, value: Value) -> KairosResult<()> {
        self.trigger(eid, Ok(value))
    }

    /// Trigger a manual event with a failure.
    pub fn fail(&mut self, eid: EventId, failure: Failure) -> KairosResult<()> {
        self.trigger(eid, Err(failure))
    }

    fn trigger(&mut self, eid: EventId, outcome: Outcome) -> KairosResult<()> {
        let entry = self
            .events
            .get(&eid)
            .ok_or(KairosError::UnknownEvent(eid))?;
        if entry.state != EventState::Pending {
            return Err(KairosError::AlreadyTriggered(eid));
        }
        self.fire_at(eid, self.now, outcome);
        Ok(())
    }

    /// An event that triggers `delay` ticks from now with no payload.
    /// Fails with `InvalidDelay` if `delay` is negative.
    pub fn timeout(&mut self, delay: i64) -> KairosResult<EventId> {
        self.timeout_with(delay, Value::None)
    }

    /// An event that triggers `delay` ticks from now carrying `value`.
    pub fn timeout_with(&mut self, delay: i64, value: Value) -> KairosResult<EventId> {
        if delay < 0 {
            return Err(KairosError::InvalidDelay(delay));
        }
        let at = self
            .now
            .advance(delay as u64)
            .ok_or(KairosError::TimeOverflow)?;
        let eid = self.mint_event(EventKind::Plain);
        self.fire_at(eid, at, Ok(value));
        Ok(eid)
    }

    /// An event that triggers at the absolute time `at`.
    /// Fails with `CausalityError` if `at` is already in the past.
    pub fn timeout_at(&mut self, at: SimTime, value: Value) -> KairosResult<EventId> {
        if at.is_before(self.now) {
            return Err(KairosError::CausalityError {
                requested: at.ticks(),
                current: self.now.ticks(),
            });
        }
        let eid = self.mint_event(EventKind::Plain);
        self.fire_at(eid, at, Ok(value));
        Ok(eid)
    }

    /// Inspect an event's lifecycle state.
    pub fn event_state(&self, eid: EventId) -> KairosResult<EventState> {
        self.events
            .get(&eid)
            .map(|e| e.state)
            .ok_or(KairosError::UnknownEvent(eid))
    }

    /// The outcome of a triggered or processed event, if set.
    pub fn event_outcome(&self, eid: EventId) -> KairosResult<Option<Outcome>> {
        self.events
            .get(&eid)
            .map(|e| e.outcome.clone())
            .ok_or(KairosError::UnknownEvent(eid))
    }

    // ── Process management ────────────────────────────────────

    /// Register a process and schedule its first resumption at the
    /// current time, ordered after already-queued same-time events.
    pub fn spawn(&mut self, body: Box<dyn Process>) -> ProcessId {
        let pid = ProcessId::new(self.next_process_id);
        self.next_process_id += 1;
        let completion = self.mint_event(EventKind::Completion(pid));
        self.procs.insert(
            pid,
            ProcessEntry {
                body: Some(body),
                state: ProcessState::Created,
                wait: None,
                completion,
            },
        );
        let init = self.mint_event(EventKind::Plain);
        let entry = self.events.get_mut(&init).expect("just minted");
        entry.waiters.push(Waiter::Process(pid));
        entry.observed = true;
        self.procs.get_mut(&pid).expect("just inserted").wait = Some(init);
        self.fire_at(init, self.now, Ok(Value::None));
        trace!(%pid, "spawned process");
        pid
    }

    /// The event triggered when `pid` terminates or fails. Other
    /// processes (and `run_until_event`) can wait on it.
    pub fn completion_of(&self, pid: ProcessId) -> KairosResult<EventId> {
        self.procs
            .get(&pid)
            .map(|p| p.completion)
            .ok_or(KairosError::UnknownProcess(pid))
    }

    /// Inspect a process's lifecycle state.
    pub fn process_state(&self, pid: ProcessId) -> KairosResult<ProcessState> {
        self.procs
            .get(&pid)
            .map(|p| p.state)
            .ok_or(KairosError::UnknownProcess(pid))
    }

    /// Interrupt a suspended process, converting its current wait into
    /// an immediate resumption carrying an interrupt failure.
    ///
    /// Fails with `InvalidInterruptTarget` if the target is not
    /// currently suspended on a wait.
    pub fn interrupt(&mut self, target: ProcessId, cause: Value) -> KairosResult<()> {
        self.interrupt_with(target, InterruptCause::Custom(cause))
    }

    pub(crate) fn interrupt_with(
        &mut self,
        target: ProcessId,
        cause: InterruptCause,
    ) -> KairosResult<()> {
        let entry = self
            .procs
            .get(&target)
            .ok_or(KairosError::UnknownProcess(target))?;
        if entry.state != ProcessState::Suspended {
            return Err(KairosError::InvalidInterruptTarget(target));
        }
        // Detach from the current wait. The original event stays
        // scheduled and later fires with this process absent.
        if let Some(waited) = entry.wait {
            if let Some(ev) = self.events.get_mut(&waited) {
                ev.waiters.retain(|w| *w != Waiter::Process(target));
            }
        }
        debug!(%target, ?cause, "interrupt delivered");
        let echo = self.mint_event(EventKind::Plain);
        let ev = self.events.get_mut(&echo).expect("just minted");
        ev.waiters.push(Waiter::Process(target));
        ev.observed = true;
        self.procs.get_mut(&target).expect("checked above").wait = Some(echo);
        self.fire_at(echo, self.now, Err(Failure::Interrupted(cause)));
        Ok(())
    }

    // ── Event composition ─────────────────────────────────────

    /// A synthetic event that triggers once every component has
    /// triggered; its value is the list of component values in
    /// component order. An empty set triggers immediately.
    pub fn all_of(&mut self, components: &[EventId]) -> KairosResult<EventId> {
        self.condition(CondKind::All, components)
    }

    /// A synthetic event that triggers with the first component's value;
    /// the remaining components continue independently.
    pub fn any_of(&mut self, components: &[EventId]) -> KairosResult<EventId> {
        self.condition(CondKind::Any, components)
    }

    fn condition(&mut self, kind: CondKind, components: &[EventId]) -> KairosResult<EventId> {
        for c in components {
            if !self.events.contains_key(c) {
                return Err(KairosError::UnknownEvent(*c));
            }
        }
        let cid = self.mint_event(EventKind::Plain);
        let mut results: Vec<Option<Value>> = vec![None; components.len()];
        let mut remaining = components.len();
        let mut immediate: Option<Outcome> = None;

        for (i, c) in components.iter().enumerate() {
            let entry = self.events.get_mut(c).expect("validated above");
            entry.observed = true;
            if entry.state == EventState::Processed {
                // Already-settled components count right away.
                let outcome = entry.outcome.clone().expect("processed without outcome");
                match outcome {
                    Ok(v) => match kind {
                        CondKind::Any => {
                            immediate = Some(Ok(v));
                            break;
                        }
                        CondKind::All => {
                            results[i] = Some(v);
                            remaining -= 1;
                        }
                    },
                    Err(f) => {
                        immediate = Some(Err(f));
                        break;
                    }
                }
            } else {
                entry.waiters.push(Waiter::Condition(cid));
            }
        }

        if let Some(outcome) = immediate {
            self.detach_condition(cid, components);
            self.fire_at(cid, self.now, outcome);
            return Ok(cid);
        }
        if kind == CondKind::All && remaining == 0 {
            let vals = results
                .into_iter()
                .map(|v| v.expect("all components counted"))
                .collect();
            self.fire_at(cid, self.now, Ok(Value::List(vals)));
            return Ok(cid);
        }
        self.conditions.insert(
            cid,
            Condition {
                kind,
                components: components.to_vec(),
                results,
                remaining,
            },
        );
        Ok(cid)
    }

    fn detach_condition(&mut self, cid: EventId, components: &[EventId]) {
        for c in components {
            if let Some(ev) = self.events.get_mut(c) {
                ev.waiters.retain(|w| *w != Waiter::Condition(cid));
            }
        }
    }

    fn condition_notify(&mut self, cid: EventId, component: EventId, outcome: Outcome) {
        let Some(cond) = self.conditions.get_mut(&cid) else {
            return;
        };
        match outcome {
            Err(f) => {
                let comps = cond.components.clone();
                self.conditions.remove(&cid);
                self.detach_condition(cid, &comps);
                self.fire_at(cid, self.now, Err(f));
            }
            Ok(v) => match cond.kind {
                CondKind::Any => {
                    let comps = cond.components.clone();
                    self.conditions.remove(&cid);
                    self.detach_condition(cid, &comps);
                    self.fire_at(cid, self.now, Ok(v));
                }
                CondKind::All => {
                    let idx = cond
                        .components
                        .iter()
                        .position(|c| *c == component)
                        .expect("notified for a foreign component");
                    if cond.results[idx].is_none() {
                        cond.results[idx] = Some(v);
                        cond.remaining -= 1;
                    }
                    if cond.remaining == 0 {
                        let cond = self.conditions.remove(&cid).expect("present above");
                        let vals = cond
                            .results
                            .into_iter()
                            .map(|r| r.expect("all components counted"))
                            .collect();
                        self.fire_at(cid, self.now, Ok(Value::List(vals)));
                    }
                }
            },
        }
    }

    // ── Driving loop ──────────────────────────────────────────

    /// Process a single queue entry: advance time, mark the event
    /// processed, resume its waiters. Returns `Ok(false)` when the
    /// queue is empty.
    fn step(&mut self) -> KairosResult<bool> {
        let Some(entry) = self.queue.pop_next() else {
            return Ok(false);
        };
        // Virtual time must never go backward; the schedule APIs reject
        // past times, so a violation here is a kernel bug.
        if entry.at.is_before(self.now) {
            return Err(KairosError::CausalityError {
                requested: entry.at.ticks(),
                current: self.now.ticks(),
            });
        }
        self.now = entry.at;
        self.events_processed += 1;
        trace!(at = %entry.at, event = %entry.event, "processing event");
        self.process_event(entry.event);
        if let Some(err) = self.unhandled.take() {
            return Err(err);
        }
        Ok(true)
    }

    fn process_event(&mut self, eid: EventId) {
        let entry = self
            .events
            .get_mut(&eid)
            .expect("queued event with no entry");
        entry.state = EventState::Processed;
        let outcome = entry
            .outcome
            .clone()
            .expect("processed event with no outcome");
        let waiters = std::mem::take(&mut entry.waiters);
        let kind = entry.kind;
        let observed = entry.observed;

        for waiter in waiters {
            match waiter {
                Waiter::Process(pid) => {
                    let wake = match outcome.clone() {
                        Ok(v) => Wake::Value(v),
                        Err(f) => Wake::Failure(f),
                    };
                    self.step_process(pid, wake);
                }
                Waiter::Condition(cid) => {
                    self.condition_notify(cid, eid, outcome.clone());
                }
            }
        }

        // A failed completion that nothing ever waited on halts the run.
        if let EventKind::Completion(pid) = kind {
            if !observed {
                if let Err(f) = &outcome {
                    self.unhandled = Some(KairosError::ProcessFailure {
                        process: pid,
                        reason: f.reason(),
                    });
                }
            }
        }
    }

    fn step_process(&mut self, pid: ProcessId, wake: Wake) {
        let Some(entry) = self.procs.get_mut(&pid) else {
            return;
        };
        let Some(mut body) = entry.body.take() else {
            return;
        };
        let wake = if entry.state == ProcessState::Created {
            Wake::Start
        } else {
            wake
        };
        entry.state = ProcessState::Running;
        entry.wait = None;

        let result = {
            let mut ctx = Context { env: self, pid };
            body.resume(&mut ctx, wake)
        };

        let entry = self.procs.get_mut(&pid).expect("process entry vanished");
        entry.body = Some(body);
        match result {
            Ok(Step::Wait(target)) => {
                entry.state = ProcessState::Suspended;
                self.register_wait(pid, target);
            }
            Ok(Step::Done(value)) => {
                entry.state = ProcessState::Terminated;
                let completion = entry.completion;
                trace!(%pid, "process terminated");
                self.fire_at(completion, self.now, Ok(value));
            }
            Err(failure) => {
                entry.state = ProcessState::Failed;
                let completion = entry.completion;
                debug!(%pid, reason = %failure.reason(), "process failed");
                self.fire_at(completion, self.now, Err(failure));
            }
        }
    }

    fn register_wait(&mut self, pid: ProcessId, target: Target) {
        let eid = match target {
            Target::Event(e) => e,
            Target::Request(r) => match self.requests.get(&r) {
                Some(req) => req.grant,
                None => {
                    return self.fail_process(pid, KairosError::UnknownRequest(r).into());
                }
            },
            Target::Join(p) => match self.procs.get(&p) {
                Some(pe) => pe.completion,
                None => {
                    return self.fail_process(pid, KairosError::UnknownProcess(p).into());
                }
            },
        };
        let Some(entry) = self.events.get_mut(&eid) else {
            return self.fail_process(pid, KairosError::UnknownEvent(eid).into());
        };
        entry.observed = true;
        if entry.state == EventState::Processed {
            // Re-deliver a settled outcome through a fresh same-time
            // event rather than resuming recursively.
            let outcome = entry.outcome.clone().expect("processed without outcome");
            let echo = self.mint_event(EventKind::Plain);
            let ev = self.events.get_mut(&echo).expect("just minted");
            ev.waiters.push(Waiter::Process(pid));
            ev.observed = true;
            self.procs.get_mut(&pid).expect("suspended above").wait = Some(echo);
            self.fire_at(echo, self.now, outcome);
        } else {
            entry.waiters.push(Waiter::Process(pid));
            self.procs.get_mut(&pid).expect("suspended above").wait = Some(eid);
        }
    }

    /// Fail a process from inside the kernel (bad handle, failed grant).
    fn fail_process(&mut self, pid: ProcessId, failure: Failure) {
        let entry = self.procs.get_mut(&pid).expect("failing unknown process");
        entry.state = ProcessState::Failed;
        let completion = entry.completion;
        self.fire_at(completion, self.now, Err(failure));
    }

    // ── Run entry points ──────────────────────────────────────

    /// Run until the event queue is empty.
    ///
    /// Fails if an unhandled process failure escalates or a causality
    /// violation is detected.
    pub fn run(&mut self) -> KairosResult<Value> {
        while self.step()? {}
        Ok(Value::None)
    }

    /// Run until virtual time `until`, leaving later events queued and
    /// `now` exactly at `until`. Calling `run` again later continues
    /// draining the same queue.
    pub fn run_until(&mut self, until: SimTime) -> KairosResult<Value> {
        if until.is_before(self.now) {
            return Err(KairosError::CausalityError {
                requested: until.ticks(),
                current: self.now.ticks(),
            });
        }
        // An internal cutoff event: same-time events scheduled before it
        // still fire, everything after stays queued.
        let cutoff = self.mint_event(EventKind::Plain);
        self.fire_at(cutoff, until, Ok(Value::None));
        self.run_until_event(cutoff)
    }

    /// Run until `target` has been processed and return its value.
    ///
    /// Fails with `NoMoreEvents` if the queue drains first, and with
    /// the corresponding failure if the event resolves to one.
    pub fn run_until_event(&mut self, target: EventId) -> KairosResult<Value> {
        {
            let entry = self
                .events
                .get_mut(&target)
                .ok_or(KairosError::UnknownEvent(target))?;
            entry.observed = true;
        }
        loop {
            let done = self
                .events
                .get(&target)
                .map(|e| e.state == EventState::Processed)
                .unwrap_or(false);
            if done {
                break;
            }
            if !self.step()? {
                return Err(KairosError::NoMoreEvents);
            }
        }
        let entry = self.events.get(&target).expect("checked in loop");
        match entry.outcome.clone().expect("processed without outcome") {
            Ok(v) => Ok(v),
            Err(f) => match entry.kind {
                EventKind::Completion(pid) => Err(KairosError::ProcessFailure {
                    process: pid,
                    reason: f.reason(),
                }),
                EventKind::Plain => Err(KairosError::EventFailed(f.reason())),
            },
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

// ── Context ───────────────────────────────────────────────────────────

/// The handle a running process uses for every kernel operation during
/// one step. Borrows the environment mutably, so a step cannot race the
/// driving loop.
pub struct Context<'a> {
    pub(crate) env: &'a mut Environment,
    pub(crate) pid: ProcessId,
}

impl Context<'_> {
    /// Current virtual time.
    #[inline]
    pub fn now(&self) -> SimTime {
        self.env.now()
    }

    /// The id of the process executing this step.
    #[inline]
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// See [`Environment::timeout`].
    pub fn timeout(&mut self, delay: i64) -> KairosResult<EventId> {
        self.env.timeout(delay)
    }

    /// See [`Environment::timeout_with`].
    pub fn timeout_with(&mut self, delay: i64, value: Value) -> KairosResult<EventId> {
        self.env.timeout_with(delay, value)
    }

    /// See [`Environment::event`].
    pub fn event(&mut self) -> EventId {
        self.env.event()
    }

    /// See [`Environment::succeed`].
    pub fn succeed(&mut self, eid: EventId, value: Value) -> KairosResult<()> {
        self.env.succeed(eid, value)
    }

    /// See [`Environment::fail`].
    pub fn fail(&mut self, eid: EventId, failure: Failure) -> KairosResult<()> {
        self.env.fail(eid, failure)
    }

    /// See [`Environment::all_of`].
    pub fn all_of(&mut self, components: &[EventId]) -> KairosResult<EventId> {
        self.env.all_of(components)
    }

    /// See [`Environment::any_of`].
    pub fn any_of(&mut self, components: &[EventId]) -> KairosResult<EventId> {
        self.env.any_of(components)
    }

    /// Spawn a child process; it starts at the current time.
    pub fn spawn(&mut self, body: Box<dyn Process>) -> ProcessId {
        self.env.spawn(body)
    }

    /// The completion event of another process.
    pub fn completion_of(&self, pid: ProcessId) -> KairosResult<EventId> {
        self.env.completion_of(pid)
    }

    /// Interrupt another suspended process. A process cannot interrupt
    /// itself mid-step.
    pub fn interrupt(&mut self, target: ProcessId, cause: Value) -> KairosResult<()> {
        if target == self.pid {
            return Err(KairosError::InvalidInterruptTarget(target));
        }
        self.env.interrupt(target, cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<(u64, String)>>>;

    fn log(trace: &Log, at: SimTime, msg: impl Into<String>) {
        trace.borrow_mut().push((at.ticks(), msg.into()));
    }

    // A process that sleeps a fixed schedule of delays, logging each wake.
    struct Sleeper {
        name: String,
        delays: Vec<i64>,
        next: usize,
        trace: Log,
    }

    impl Sleeper {
        fn new(name: &str, delays: Vec<i64>, trace: Log) -> Box<Self> {
            Box::new(Sleeper {
                name: name.into(),
                delays,
                next: 0,
                trace,
            })
        }
    }

    impl Process for Sleeper {
        fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, Failure> {
            wake.into_value()?;
            if self.next > 0 {
                log(&self.trace, ctx.now(), format!("{} woke", self.name));
            }
            if self.next == self.delays.len() {
                return Ok(Step::Done(Value::text(self.name.clone())));
            }
            let delay = self.delays[self.next];
            self.next += 1;
            let ev = ctx.timeout(delay)?;
            Ok(Step::Wait(Target::Event(ev)))
        }
    }

    #[test]
    fn test_single_timeout_process() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        let pid = env.spawn(Sleeper::new("a", vec![5], trace.clone()));
        env.run().unwrap();
        assert_eq!(env.now(), SimTime::new(5));
        assert_eq!(env.process_state(pid).unwrap(), ProcessState::Terminated);
        assert_eq!(&*trace.borrow(), &[(5, "a woke".to_string())]);
    }

    #[test]
    fn test_initial_time() {
        let mut env = Environment::at(SimTime::new(100));
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        env.spawn(Sleeper::new("a", vec![5], trace.clone()));
        env.run().unwrap();
        assert_eq!(env.now(), SimTime::new(105));
        assert_eq!(&*trace.borrow(), &[(105, "a woke".to_string())]);
    }

    #[test]
    fn test_time_is_monotonic_across_processes() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        env.spawn(Sleeper::new("slow", vec![30, 30], trace.clone()));
        env.spawn(Sleeper::new("fast", vec![10, 10, 10, 10], trace.clone()));
        env.run().unwrap();
        let times: Vec<u64> = trace.borrow().iter().map(|(t, _)| *t).collect();
        for w in times.windows(2) {
            assert!(w[0] <= w[1], "time went backward: {:?}", times);
        }
    }

    #[test]
    fn test_same_time_wakes_in_schedule_order() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        env.spawn(Sleeper::new("first", vec![10], trace.clone()));
        env.spawn(Sleeper::new("second", vec![10], trace.clone()));
        env.run().unwrap();
        assert_eq!(
            &*trace.borrow(),
            &[(10, "first woke".to_string()), (10, "second woke".to_string())]
        );
    }

    #[test]
    fn test_negative_delay_rejected() {
        let mut env = Environment::new();
        assert_eq!(env.timeout(-1), Err(KairosError::InvalidDelay(-1)));
    }

    #[test]
    fn test_timeout_at_in_past_rejected() {
        let mut env = Environment::at(SimTime::new(10));
        let err = env.timeout_at(SimTime::new(3), Value::None).unwrap_err();
        assert_eq!(
            err,
            KairosError::CausalityError {
                requested: 3,
                current: 10
            }
        );
    }

    #[test]
    fn test_manual_event_retrigger_fails() {
        let mut env = Environment::new();
        let ev = env.event();
        env.succeed(ev, Value::Int(1)).unwrap();
        assert_eq!(
            env.succeed(ev, Value::Int(2)),
            Err(KairosError::AlreadyTriggered(ev))
        );
    }

    #[test]
    fn test_run_until_leaves_later_events_queued() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        // Terminates at 15; a second process would wake at 25.
        env.spawn(Sleeper::new("a", vec![15], trace.clone()));
        env.spawn(Sleeper::new("b", vec![25], trace.clone()));
        env.run_until(SimTime::new(20)).unwrap();
        assert_eq!(env.now(), SimTime::new(20));
        assert_eq!(&*trace.borrow(), &[(15, "a woke".to_string())]);
        assert!(env.pending_events() > 0);

        // Resuming continues draining the same queue.
        env.run().unwrap();
        assert_eq!(env.now(), SimTime::new(25));
        assert_eq!(trace.borrow().len(), 2);
    }

    #[test]
    fn test_run_until_in_past_rejected() {
        let mut env = Environment::at(SimTime::new(50));
        assert!(matches!(
            env.run_until(SimTime::new(10)),
            Err(KairosError::CausalityError { .. })
        ));
    }

    #[test]
    fn test_run_until_event_returns_value() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        let pid = env.spawn(Sleeper::new("a", vec![7], trace.clone()));
        let done = env.completion_of(pid).unwrap();
        let value = env.run_until_event(done).unwrap();
        assert_eq!(value, Value::text("a"));
        assert_eq!(env.now(), SimTime::new(7));
    }

    #[test]
    fn test_run_until_event_that_never_triggers() {
        let mut env = Environment::new();
        let ev = env.event();
        assert_eq!(env.run_until_event(ev), Err(KairosError::NoMoreEvents));
    }

    // A process that waits on one externally supplied event.
    struct WaitOn {
        target: Option<Target>,
        trace: Log,
    }

    impl Process for WaitOn {
        fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, Failure> {
            match self.target.take() {
                Some(target) => Ok(Step::Wait(target)),
                None => {
                    let v = wake.into_value()?;
                    log(&self.trace, ctx.now(), format!("got {}", v));
                    Ok(Step::Done(v))
                }
            }
        }
    }

    #[test]
    fn test_wait_on_manual_event() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        let ev = env.event();
        env.spawn(Box::new(WaitOn {
            target: Some(Target::Event(ev)),
            trace: trace.clone(),
        }));
        // Trigger from outside at time zero.
        env.succeed(ev, Value::Int(9)).unwrap();
        env.run().unwrap();
        assert_eq!(&*trace.borrow(), &[(0, "got 9".to_string())]);
    }

    #[test]
    fn test_join_another_process() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        let worker = env.spawn(Sleeper::new("worker", vec![12], trace.clone()));
        let watcher = env.spawn(Box::new(WaitOn {
            target: Some(Target::Join(worker)),
            trace: trace.clone(),
        }));
        env.run().unwrap();
        assert_eq!(env.process_state(watcher).unwrap(), ProcessState::Terminated);
        assert_eq!(
            trace.borrow().last().unwrap(),
            &(12, "got \"worker\"".to_string())
        );
    }

    #[test]
    fn test_join_already_terminated_process() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        let worker = env.spawn(Sleeper::new("worker", vec![3], trace.clone()));
        env.run().unwrap();
        // Worker is long done; a late joiner still observes the value.
        env.spawn(Box::new(WaitOn {
            target: Some(Target::Join(worker)),
            trace: trace.clone(),
        }));
        env.run().unwrap();
        assert_eq!(
            trace.borrow().last().unwrap(),
            &(3, "got \"worker\"".to_string())
        );
    }

    // A process that fails on its first step.
    struct Exploder;

    impl Process for Exploder {
        fn resume(&mut self, _ctx: &mut Context<'_>, _wake: Wake) -> Result<Step, Failure> {
            Err(Failure::error("kaboom"))
        }
    }

    #[test]
    fn test_unobserved_failure_halts_run() {
        let mut env = Environment::new();
        let pid = env.spawn(Box::new(Exploder));
        let err = env.run().unwrap_err();
        assert_eq!(
            err,
            KairosError::ProcessFailure {
                process: pid,
                reason: "kaboom".into()
            }
        );
        assert_eq!(env.process_state(pid).unwrap(), ProcessState::Failed);
    }

    // A process that joins another and absorbs its failure.
    struct Absorber {
        target: ProcessId,
        started: bool,
        trace: Log,
    }

    impl Process for Absorber {
        fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, Failure> {
            if !self.started {
                self.started = true;
                return Ok(Step::Wait(Target::Join(self.target)));
            }
            match wake.into_value() {
                Ok(_) => Err(Failure::error("expected a failure")),
                Err(f) => {
                    log(&self.trace, ctx.now(), format!("absorbed: {}", f.reason()));
                    Ok(Step::Done(Value::None))
                }
            }
        }
    }

    #[test]
    fn test_observed_failure_is_handled_locally() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        let bad = env.spawn(Box::new(Exploder));
        env.spawn(Box::new(Absorber {
            target: bad,
            started: false,
            trace: trace.clone(),
        }));
        env.run().unwrap();
        assert_eq!(&*trace.borrow(), &[(0, "absorbed: kaboom".to_string())]);
    }

    // ── Composition ───────────────────────────────────────────

    struct ComposeAll {
        delays: Vec<i64>,
        started: bool,
        trace: Log,
    }

    impl Process for ComposeAll {
        fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, Failure> {
            if !self.started {
                self.started = true;
                let evs: Vec<EventId> = self
                    .delays
                    .iter()
                    .map(|d| ctx.timeout_with(*d, Value::Int(*d)))
                    .collect::<Result<_, _>>()?;
                let all = ctx.all_of(&evs)?;
                return Ok(Step::Wait(Target::Event(all)));
            }
            let v = wake.into_value()?;
            log(&self.trace, ctx.now(), format!("all: {}", v));
            Ok(Step::Done(Value::None))
        }
    }

    #[test]
    fn test_all_of_waits_for_slowest() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        env.spawn(Box::new(ComposeAll {
            delays: vec![5, 20, 10],
            started: false,
            trace: trace.clone(),
        }));
        env.run().unwrap();
        // Values arrive in component order, not completion order.
        assert_eq!(&*trace.borrow(), &[(20, "all: [5, 20, 10]".to_string())]);
    }

    struct ComposeAny {
        delays: Vec<i64>,
        started: bool,
        trace: Log,
    }

    impl Process for ComposeAny {
        fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, Failure> {
            if !self.started {
                self.started = true;
                let evs: Vec<EventId> = self
                    .delays
                    .iter()
                    .map(|d| ctx.timeout_with(*d, Value::Int(*d)))
                    .collect::<Result<_, _>>()?;
                let any = ctx.any_of(&evs)?;
                return Ok(Step::Wait(Target::Event(any)));
            }
            let v = wake.into_value()?;
            log(&self.trace, ctx.now(), format!("any: {}", v));
            Ok(Step::Done(Value::None))
        }
    }

    #[test]
    fn test_any_of_fires_on_first() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        env.spawn(Box::new(ComposeAny {
            delays: vec![15, 4, 9],
            started: false,
            trace: trace.clone(),
        }));
        env.run().unwrap();
        assert_eq!(&*trace.borrow(), &[(4, "any: 4".to_string())]);
        // Remaining timeouts still drain without incident.
        assert_eq!(env.now(), SimTime::new(15));
    }

    #[test]
    fn test_all_of_empty_triggers_immediately() {
        let mut env = Environment::new();
        let all = env.all_of(&[]).unwrap();
        let v = env.run_until_event(all).unwrap();
        assert_eq!(v, Value::List(vec![]));
        assert_eq!(env.now(), SimTime::ZERO);
    }

    #[test]
    fn test_all_of_with_already_processed_component() {
        let mut env = Environment::new();
        let early = env.timeout_with(2, Value::Int(2)).unwrap();
        env.run().unwrap();
        // `early` is history; composing over it still counts its value.
        let late = env.timeout_with(5, Value::Int(5)).unwrap();
        let all = env.all_of(&[early, late]).unwrap();
        let v = env.run_until_event(all).unwrap();
        assert_eq!(v, Value::List(vec![Value::Int(2), Value::Int(5)]));
    }

    #[test]
    fn test_failed_component_fails_composition() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        let bad = env.spawn(Box::new(Exploder));
        let done = env.completion_of(bad).unwrap();
        let slow = env.timeout(50).unwrap();
        let all = env.all_of(&[done, slow]).unwrap();
        env.spawn(Box::new(Absorber {
            // Absorber joins a process; reuse WaitOn for a raw event.
            target: bad,
            started: false,
            trace: trace.clone(),
        }));
        let err = env.run_until_event(all).unwrap_err();
        assert_eq!(err, KairosError::EventFailed("kaboom".into()));
    }

    // ── Interrupts ────────────────────────────────────────────

    // Sleeps for 10 ticks, records how its wait ended.
    struct LongSleep {
        started: bool,
        trace: Log,
    }

    impl Process for LongSleep {
        fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, Failure> {
            if !self.started {
                self.started = true;
                let ev = ctx.timeout(10)?;
                return Ok(Step::Wait(Target::Event(ev)));
            }
            if let Some(cause) = wake.interrupted() {
                log(&self.trace, ctx.now(), format!("interrupted: {:?}", cause));
                return Ok(Step::Done(Value::None));
            }
            log(&self.trace, ctx.now(), "slept full 10");
            Ok(Step::Done(Value::None))
        }
    }

    // Waits 5 ticks, then interrupts its target.
    struct Interrupter {
        target: ProcessId,
        started: bool,
    }

    impl Process for Interrupter {
        fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, Failure> {
            if !self.started {
                self.started = true;
                let ev = ctx.timeout(5)?;
                return Ok(Step::Wait(Target::Event(ev)));
            }
            wake.into_value()?;
            ctx.interrupt(self.target, Value::text("enough"))?;
            Ok(Step::Done(Value::None))
        }
    }

    #[test]
    fn test_interrupt_ends_wait_early() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        let sleeper = env.spawn(Box::new(LongSleep {
            started: false,
            trace: trace.clone(),
        }));
        env.spawn(Box::new(Interrupter {
            target: sleeper,
            started: false,
        }));
        env.run().unwrap();
        // Resumes at 5 with the interrupt, not at 10 with a value.
        let t = trace.borrow();
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].0, 5);
        assert!(t[0].1.contains("interrupted"));
        assert!(t[0].1.contains("enough"));
    }

    #[test]
    fn test_interrupt_requires_suspended_target() {
        let trace: Log = Rc::new(RefCell::new(Vec::new()));
        let mut env = Environment::new();
        let pid = env.spawn(Sleeper::new("a", vec![2], trace.clone()));
        env.run().unwrap();
        // Terminated processes cannot be interrupted.
        assert_eq!(
            env.interrupt(pid, Value::None),
            Err(KairosError::InvalidInterruptTarget(pid))
        );
    }

    // A process that ignores the interrupt by propagating it.
    struct Unguarded {
        started: bool,
    }

    impl Process for Unguarded {
        fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, Failure> {
            if !self.started {
                self.started = true;
                let ev = ctx.timeout(10)?;
                return Ok(Step::Wait(Target::Event(ev)));
            }
            wake.into_value()?;
            Ok(Step::Done(Value::None))
        }
    }

    #[test]
    fn test_unhandled_interrupt_escalates() {
        let mut env = Environment::new();
        let victim = env.spawn(Box::new(Unguarded { started: false }));
        env.spawn(Box::new(Interrupter {
            target: victim,
            started: false,
        }));
        let err = env.run().unwrap_err();
        assert!(matches!(err, KairosError::ProcessFailure { process, .. } if process == victim));
    }

    #[test]
    fn test_deterministic_replay() {
        fn run_once() -> Vec<(u64, String)> {
            let trace: Log = Rc::new(RefCell::new(Vec::new()));
            let mut env = Environment::new();
            env.spawn(Sleeper::new("a", vec![3, 3, 3], trace.clone()));
            env.spawn(Sleeper::new("b", vec![2, 4, 3], trace.clone()));
            env.spawn(Sleeper::new("c", vec![9], trace.clone()));
            env.run().unwrap();
            let t = trace.borrow().clone();
            t
        }
        assert_eq!(run_once(), run_once());
    }
}
