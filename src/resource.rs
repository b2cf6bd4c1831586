//! Shared, capacity-bounded resources with queued acquisition.
//!
//! Three disciplines share one pool implementation:
//! - *Exclusive*: strict FIFO, first-come-first-served.
//! - *Priority*: queue ordered by `(priority, arrival)`; lower numbers
//!   are served first, equal priorities keep arrival order.
//! - *Preemptive*: like Priority, but an arriving request that is
//!   strictly more urgent than the worst current holder evicts that
//!   holder and takes its slot at the same virtual time. Equal priority
//!   never preempts.
//!
//! Pool state is only touched synchronously inside the scheduler step
//! that grants or releases, so `0 <= in_use <= capacity` and the queue
//! ordering hold whenever control returns to the driving loop.

use tracing::debug;

use crate::env::{Context, Environment};
use crate::error::{KairosError, KairosResult};
use crate::event::{EventId, EventKind, InterruptCause, Value};
use crate::process::ProcessId;
use crate::time::SimTime;

// ── Handles ───────────────────────────────────────────────────────────

/// Opaque handle to a resource pool owned by an `Environment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceId(usize);

impl ResourceId {
    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Opaque capability returned by `request`. The only way to touch a
/// slot: callers wait on it, then release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestId(u64);

impl RequestId {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Q{}", self.0)
    }
}

// ── Request lifecycle ─────────────────────────────────────────────────

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum RequestState {
    /// Queued, no slot yet.
    Waiting,
    /// Holding a slot.
    Granted,
    /// Slot given back, or a waiting request cancelled.
    Released,
    /// Forcibly evicted by a more urgent preemptive request.
    Preempted,
}

pub(crate) struct RequestEntry {
    pub(crate) resource: ResourceId,
    pub(crate) process: ProcessId,
    pub(crate) priority: i64,
    /// Monotonic arrival order, the tie-break among equal priorities.
    pub(crate) arrival_seq: u64,
    pub(crate) state: RequestState,
    /// Triggered when the slot is granted.
    pub(crate) grant: EventId,
    pub(crate) granted_at: Option<SimTime>,
}

// ── Pool ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Discipline {
    Fifo,
    Priority,
    Preemptive,
}

pub(crate) struct ResourcePool {
    pub(crate) capacity: usize,
    pub(crate) discipline: Discipline,
    /// Requests currently holding a slot.
    pub(crate) users: Vec<RequestId>,
    /// Waiting requests, kept sorted by `(priority, arrival_seq)`.
    /// For FIFO pools every priority is 0, so this is arrival order.
    pub(crate) queue: Vec<RequestId>,
}

// ── Environment operations ────────────────────────────────────────────

impl Environment {
    /// Create an exclusive (FIFO) resource.
    pub fn resource(&mut self, capacity: usize) -> KairosResult<ResourceId> {
        self.make_resource(capacity, Discipline::Fifo)
    }

    /// Create a priority resource: lower priority values served first.
    pub fn priority_resource(&mut self, capacity: usize) -> KairosResult<ResourceId> {
        self.make_resource(capacity, Discipline::Priority)
    }

    /// Create a preemptive priority resource.
    pub fn preemptive_resource(&mut self, capacity: usize) -> KairosResult<ResourceId> {
        self.make_resource(capacity, Discipline::Preemptive)
    }

    fn make_resource(&mut self, capacity: usize, discipline: Discipline) -> KairosResult<ResourceId> {
        if capacity == 0 {
            return Err(KairosError::InvalidCapacity);
        }
        let id = ResourceId(self.resources.len());
        self.resources.push(ResourcePool {
            capacity,
            discipline,
            users: Vec::new(),
            queue: Vec::new(),
        });
        Ok(id)
    }

    /// Slots currently in use.
    pub fn resource_in_use(&self, res: ResourceId) -> KairosResult<usize> {
        self.pool(res).map(|p| p.users.len())
    }

    /// Requests currently queued.
    pub fn resource_queued(&self, res: ResourceId) -> KairosResult<usize> {
        self.pool(res).map(|p| p.queue.len())
    }

    /// Inspect a request's lifecycle state.
    pub fn request_state(&self, rid: RequestId) -> KairosResult<RequestState> {
        self.requests
            .get(&rid)
            .map(|r| r.state)
            .ok_or(KairosError::UnknownRequest(rid))
    }

    fn pool(&self, res: ResourceId) -> KairosResult<&ResourcePool> {
        self.resources
            .get(res.0)
            .ok_or(KairosError::UnknownResource(res))
    }

    pub(crate) fn request_impl(
        &mut self,
        pid: ProcessId,
        res: ResourceId,
        priority: i64,
    ) -> KairosResult<RequestId> {
        let (capacity, discipline, in_use) = {
            let pool = self.pool(res)?;
            (pool.capacity, pool.discipline, pool.users.len())
        };
        // Exclusive pools ignore priority entirely.
        let priority = if discipline == Discipline::Fifo { 0 } else { priority };

        let rid = RequestId(self.next_request_id);
        self.next_request_id += 1;
        let grant = self.mint_event(EventKind::Plain);
        self.requests.insert(
            rid,
            RequestEntry {
                resource: res,
                process: pid,
                priority,
                arrival_seq: rid.0,
                state: RequestState::Waiting,
                grant,
                granted_at: None,
            },
        );

        if in_use < capacity {
            self.grant_request(res, rid);
            return Ok(rid);
        }

        if discipline == Discipline::Preemptive {
            // Worst holder: highest priority value, latest arrival.
            let victim = self.resources[res.0]
                .users
                .iter()
                .copied()
                .max_by_key(|u| {
                    let r = self.requests.get(u).expect("user without request entry");
                    (r.priority, r.arrival_seq)
                })
                .expect("full pool with no users");
            let victim_priority = self.requests[&victim].priority;
            // Strictly better only. Equal priority never preempts.
            if priority < victim_priority {
                self.preempt(res, victim, rid)?;
                return Ok(rid);
            }
        }

        self.enqueue_request(res, rid, priority);
        Ok(rid)
    }

    fn grant_request(&mut self, res: ResourceId, rid: RequestId) {
        self.resources[res.0].users.push(rid);
        let now = self.now();
        let entry = self.requests.get_mut(&rid).expect("granting unknown request");
        entry.state = RequestState::Granted;
        entry.granted_at = Some(now);
        let grant = entry.grant;
        debug!(%res, %rid, process = %entry.process, "slot granted");
        self.fire_at(grant, now, Ok(Value::None));
    }

    fn enqueue_request(&mut self, res: ResourceId, rid: RequestId, priority: i64) {
        let key = (priority, rid.0);
        let pos = self.resources[res.0]
            .queue
            .iter()
            .position(|q| {
                let r = &self.requests[q];
                (r.priority, r.arrival_seq) > key
            })
            .unwrap_or(self.resources[res.0].queue.len());
        self.resources[res.0].queue.insert(pos, rid);
    }

    fn preempt(&mut self, res: ResourceId, victim: RequestId, newcomer: RequestId) -> KairosResult<()> {
        let now = self.now();
        self.resources[res.0].users.retain(|u| *u != victim);
        let entry = self.requests.get_mut(&victim).expect("preempting unknown request");
        entry.state = RequestState::Preempted;
        let victim_pid = entry.process;
        let since = entry.granted_at.unwrap_or(now);
        let by = self.requests[&newcomer].process;
        debug!(%res, %victim, %newcomer, "preempting slot holder");
        self.grant_request(res, newcomer);
        self.interrupt_with(
            victim_pid,
            InterruptCause::Preempted {
                by,
                usage_since: since,
            },
        )
    }

    pub(crate) fn release_impl(&mut self, rid: RequestId) -> KairosResult<()> {
        let entry = self
            .requests
            .get_mut(&rid)
            .ok_or(KairosError::UnknownRequest(rid))?;
        let res = entry.resource;
        match entry.state {
            RequestState::Granted => {
                entry.state = RequestState::Released;
                self.resources[res.0].users.retain(|u| *u != rid);
                debug!(%res, %rid, "slot released");
                self.grant_next(res);
                Ok(())
            }
            // Cancelling a queued request is the scoped-acquisition
            // exit path for a process interrupted while waiting.
            RequestState::Waiting => {
                entry.state = RequestState::Released;
                self.resources[res.0].queue.retain(|q| *q != rid);
                Ok(())
            }
            // The evicted holder's exit path runs release too.
            RequestState::Preempted => Ok(()),
            RequestState::Released => Err(KairosError::ResourceOverrelease(rid)),
        }
    }

    /// Hand freed slots to the best queued requests, synchronously
    /// within the current logical step.
    fn grant_next(&mut self, res: ResourceId) {
        loop {
            let pool = &self.resources[res.0];
            if pool.users.len() >= pool.capacity || pool.queue.is_empty() {
                break;
            }
            let rid = self.resources[res.0].queue.remove(0);
            self.grant_request(res, rid);
        }
    }
}

// ── Context operations ────────────────────────────────────────────────

impl Context<'_> {
    /// Request a slot with neutral priority. Granted immediately while
    /// the pool is under capacity, queued otherwise.
    pub fn request(&mut self, res: ResourceId) -> KairosResult<RequestId> {
        let pid = self.pid();
        self.env.request_impl(pid, res, 0)
    }

    /// Request a slot with an explicit priority (lower = more urgent).
    /// On a preemptive pool this may evict the worst current holder.
    pub fn request_with_priority(
        &mut self,
        res: ResourceId,
        priority: i64,
    ) -> KairosResult<RequestId> {
        let pid = self.pid();
        self.env.request_impl(pid, res, priority)
    }

    /// Release a granted slot (or cancel a still-waiting request).
    /// Releasing an already-released request fails with
    /// `ResourceOverrelease`.
    pub fn release(&mut self, rid: RequestId) -> KairosResult<()> {
        self.env.release_impl(rid)
    }
}
