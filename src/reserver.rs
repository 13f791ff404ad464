//! Recovery/backfill/scrub/snap-trim reservers (spec §4.1 "Reservers",
//! §4.5 "Concurrency controls"): bounded async semaphores that support
//! priority preemption, so a more-degraded PG can bump a less-degraded one
//! out of a slot.
//!
//! The teacher repo's closest analogue is `tools::ParallelHandler` (a
//! bounded worker pool fed by a channel); reservers instead need priority
//! ordering and preemption, which a plain channel can't express, so this
//! module builds a small priority-queue-backed semaphore instead of reusing
//! `ParallelHandler` directly.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::types::PgId;

/// Strict priority total order for reservation requests (spec §9: "define a
/// strict priority total order and document it" rather than replicate the
/// upstream's snap-trim/recovery priority-inversion issue). Higher variants
/// sort first; within a class, a numeric priority further orders (e.g. "how
/// degraded" a PG is) and ties break oldest-first (FIFO) to avoid starving
/// same-priority waiters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReservationClass {
    SnapTrim = 0,
    Scrub = 1,
    RemoteRecovery = 2,
    LocalRecovery = 3,
}

#[derive(Clone, Copy, Debug)]
struct Waiter {
    class: ReservationClass,
    urgency: u32,
    sequence: u64,
    pg: PgId,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}
impl Eq for Waiter {}
impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl Waiter {
    /// Reversed sequence so `BinaryHeap` (a max-heap) pops the
    /// highest-class, highest-urgency, *oldest* waiter first.
    fn sort_key(&self) -> (ReservationClass, u32, std::cmp::Reverse<u64>) {
        (self.class, self.urgency, std::cmp::Reverse(self.sequence))
    }
}

/// A held slot. Releases automatically on drop, waking the next waiter.
pub struct Reservation {
    pg: PgId,
    reserver: Arc<Reserver>,
    released: bool,
}

impl Reservation {
    pub fn pg(&self) -> PgId {
        self.pg
    }

    /// Releases the slot early, before the object currently in flight
    /// finishes, for the cooperative-preemption case spec §4.5 describes
    /// ("yields after finishing its in-flight object" — callers invoke this
    /// once that object completes rather than waiting for `Drop`).
    pub fn release_now(mut self) {
        self.reserver.release(self.pg);
        self.released = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.released {
            self.reserver.release(self.pg);
            self.released = true;
        }
    }
}

struct Inner {
    capacity: usize,
    in_use: Vec<(ReservationClass, u32, PgId)>,
    queue: BinaryHeap<(Waiter, oneshot::Sender<()>)>,
    next_sequence: u64,
}

/// A bounded, priority-preemptible reservation pool. One instance models
/// one of spec §4.1's three reservers (local recovery / remote recovery /
/// snap-trim) when constructed with the matching capacity; scrub uses a
/// fourth instance the same way.
pub struct Reserver {
    inner: Mutex<Inner>,
}

impl Reserver {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                capacity,
                in_use: Vec::new(),
                queue: BinaryHeap::new(),
                next_sequence: 0,
            }),
        })
    }

    /// Acquires a slot, preempting the lowest-priority holder if the pool is
    /// full and this request outranks it (spec §4.5: "A higher-priority
    /// reservation ... may preempt a lower-priority reservation, which
    /// yields after finishing its in-flight object"). Preemption here evicts
    /// the victim's bookkeeping entry immediately; the real system cannot
    /// force another thread to stop mid-object, so the victim's own
    /// `Reservation::drop`/`release_now` simply becomes a no-op double
    /// release guarded by `released`.
    pub async fn acquire(
        self: &Arc<Self>,
        pg: PgId,
        class: ReservationClass,
        urgency: u32,
    ) -> Reservation {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.in_use.len() < inner.capacity {
                inner.in_use.push((class, urgency, pg));
                None
            } else if let Some(victim_idx) = weakest_holder_index(&inner.in_use, class, urgency) {
                inner.in_use.remove(victim_idx);
                inner.in_use.push((class, urgency, pg));
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let sequence = inner.next_sequence;
                inner.next_sequence += 1;
                inner.queue.push((Waiter { class, urgency, sequence, pg }, tx));
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
        Reservation { pg, reserver: Arc::clone(self), released: false }
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock().unwrap().in_use.len()
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Releases a slot and wakes the next highest-priority waiter, if any
    /// (spec §4.1: "completion of one slot awakens the next waiter").
    fn release(&self, pg: PgId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.in_use.iter().position(|(_, _, p)| *p == pg) {
            inner.in_use.remove(pos);
        }
        if let Some((waiter, tx)) = inner.queue.pop() {
            inner.in_use.push((waiter.class, waiter.urgency, waiter.pg));
            let _ = tx.send(());
        }
    }
}

fn weakest_holder_index(
    in_use: &[(ReservationClass, u32, PgId)],
    class: ReservationClass,
    urgency: u32,
) -> Option<usize> {
    let (weakest_idx, &(weak_class, weak_urgency, _)) = in_use
        .iter()
        .enumerate()
        .min_by_key(|(_, (c, u, _))| (*c, *u))?;
    if (class, urgency) > (weak_class, weak_urgency) {
        Some(weakest_idx)
    } else {
        None
    }
}
