//! Capacity-bounded item stores with blocking put/get.
//!
//! A store buffers `Value` items in FIFO order. `put` blocks while the
//! buffer is full, `get` blocks while it is empty, and `get_where`
//! blocks until some buffered item satisfies a predicate, removing the
//! first match and leaving the rest in place. Waiters of each kind are
//! FIFO among themselves; a predicate getter that matches nothing is
//! skipped, not starved, so later getters still make progress.

use std::collections::VecDeque;

use tracing::trace;

use crate::env::{Context, Environment};
use crate::error::{KairosError, KairosResult};
use crate::event::{EventId, EventKind, Outcome, Value};

// ── Handle ────────────────────────────────────────────────────────────

/// Opaque handle to a store owned by an `Environment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct StoreId(usize);

impl StoreId {
    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

// ── Internals ─────────────────────────────────────────────────────────

type Predicate = Box<dyn Fn(&Value) -> bool>;

struct PutWaiter {
    event: EventId,
    item: Value,
}

struct GetWaiter {
    event: EventId,
    /// `None` takes the oldest item; `Some` takes the first match.
    filter: Option<Predicate>,
}

pub(crate) struct StoreCore {
    /// `None` means unbounded.
    capacity: Option<usize>,
    items: VecDeque<Value>,
    putters: VecDeque<PutWaiter>,
    getters: VecDeque<GetWaiter>,
}

impl StoreCore {
    fn has_space(&self) -> bool {
        match self.capacity {
            None => true,
            Some(cap) => self.items.len() < cap,
        }
    }
}

// ── Environment operations ────────────────────────────────────────────

impl Environment {
    /// Create a store. `None` capacity means unbounded (the default in
    /// the canonical usage); `Some(0)` is rejected.
    pub fn store(&mut self, capacity: Option<usize>) -> KairosResult<StoreId> {
        if capacity == Some(0) {
            return Err(KairosError::InvalidCapacity);
        }
        let id = StoreId(self.stores.len());
        self.stores.push(StoreCore {
            capacity,
            items: VecDeque::new(),
            putters: VecDeque::new(),
            getters: VecDeque::new(),
        });
        Ok(id)
    }

    /// Number of buffered items.
    pub fn store_len(&self, sid: StoreId) -> KairosResult<usize> {
        self.core(sid).map(|s| s.items.len())
    }

    /// Snapshot of the buffered items in FIFO order.
    pub fn store_items(&self, sid: StoreId) -> KairosResult<Vec<Value>> {
        self.core(sid)
            .map(|s| s.items.iter().cloned().collect())
    }

    fn core(&self, sid: StoreId) -> KairosResult<&StoreCore> {
        self.stores.get(sid.0).ok_or(KairosError::UnknownStore(sid))
    }

    pub(crate) fn put_impl(&mut self, sid: StoreId, item: Value) -> KairosResult<EventId> {
        self.core(sid)?;
        let event = self.mint_event(EventKind::Plain);
        self.stores[sid.0].putters.push_back(PutWaiter { event, item });
        self.settle_store(sid);
        Ok(event)
    }

    pub(crate) fn get_impl(
        &mut self,
        sid: StoreId,
        filter: Option<Predicate>,
    ) -> KairosResult<EventId> {
        self.core(sid)?;
        let event = self.mint_event(EventKind::Plain);
        self.stores[sid.0].getters.push_back(GetWaiter { event, filter });
        self.settle_store(sid);
        Ok(event)
    }

    /// Admit blocked puts and satisfy matching gets until a fixpoint.
    /// Each satisfied waiter's event fires at the current time; actual
    /// process resumption goes through the queue as usual.
    fn settle_store(&mut self, sid: StoreId) {
        let mut fired: Vec<(EventId, Outcome)> = Vec::new();
        {
            let store = &mut self.stores[sid.0];
            loop {
                let mut progress = false;

                while store.has_space() {
                    let Some(put) = store.putters.pop_front() else {
                        break;
                    };
                    store.items.push_back(put.item);
                    fired.push((put.event, Ok(Value::None)));
                    progress = true;
                }

                let mut i = 0;
                while i < store.getters.len() {
                    let matched = match &store.getters[i].filter {
                        None => {
                            if store.items.is_empty() {
                                None
                            } else {
                                Some(0)
                            }
                        }
                        Some(pred) => store.items.iter().position(|item| pred(item)),
                    };
                    if let Some(idx) = matched {
                        let item = store.items.remove(idx).expect("matched index in range");
                        let get = store.getters.remove(i).expect("getter index in range");
                        fired.push((get.event, Ok(item)));
                        progress = true;
                    } else {
                        i += 1;
                    }
                }

                if !progress {
                    break;
                }
            }
        }
        let now = self.now();
        for (event, outcome) in fired {
            trace!(%sid, %event, "store waiter satisfied");
            self.fire_at(event, now, outcome);
        }
    }
}

// ── Context operations ────────────────────────────────────────────────

impl Context<'_> {
    /// Put an item into the store. The returned event triggers once the
    /// item is buffered (immediately while there is space).
    pub fn put(&mut self, sid: StoreId, item: Value) -> KairosResult<EventId> {
        self.env.put_impl(sid, item)
    }

    /// Take the oldest item. The returned event triggers with the item
    /// once one is available.
    pub fn get(&mut self, sid: StoreId) -> KairosResult<EventId> {
        self.env.get_impl(sid, None)
    }

    /// Take the first buffered item satisfying `predicate`, leaving
    /// non-matching items in place. Scans in FIFO order.
    pub fn get_where(
        &mut self,
        sid: StoreId,
        predicate: impl Fn(&Value) -> bool + 'static,
    ) -> KairosResult<EventId> {
        self.env.get_impl(sid, Some(Box::new(predicate)))
    }
}
