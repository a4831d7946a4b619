//! Timer queue
//!
//! Guests sleep by parking a waker keyed on a monotonic wake-at time.
//! The sandbox drive loop asks for the nearest deadline, advances the
//! real clock, and fires whatever came due.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::clock::Clock;
use crate::kernel::cancel::CancelState;

struct TimerEntry {
    wake_at_ms: u64,
    seq: u64,
    waker: Waker,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at_ms == other.wake_at_ms && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.wake_at_ms, self.seq).cmp(&(other.wake_at_ms, other.seq))
    }
}

pub struct TimerQueue {
    clock: Rc<dyn Clock>,
    heap: RefCell<BinaryHeap<Reverse<TimerEntry>>>,
    next_seq: std::cell::Cell<u64>,
}

impl TimerQueue {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            heap: RefCell::new(BinaryHeap::new()),
            next_seq: std::cell::Cell::new(0),
        }
    }

    /// Sleep until `ms` milliseconds from now.
    pub fn sleep(self: &Rc<Self>, ms: u64) -> SleepFuture {
        SleepFuture {
            queue: self.clone(),
            wake_at_ms: self.clock.monotonic_ms() + ms,
            cancel: None,
        }
    }

    /// Sleep that resolves early once `cancel` fires (the waker arrives
    /// through `fire_all`).
    pub fn sleep_with_cancel(self: &Rc<Self>, ms: u64, cancel: CancelState) -> SleepFuture {
        SleepFuture {
            queue: self.clone(),
            wake_at_ms: self.clock.monotonic_ms() + ms,
            cancel: Some(cancel),
        }
    }

    fn register(&self, wake_at_ms: u64, waker: Waker) {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        self.heap.borrow_mut().push(Reverse(TimerEntry {
            wake_at_ms,
            seq,
            waker,
        }));
    }

    /// Wake every timer at or before the current time. Returns how many
    /// fired.
    pub fn fire_due(&self) -> usize {
        let now = self.clock.monotonic_ms();
        let mut fired = 0;
        loop {
            let due = {
                let heap = self.heap.borrow();
                matches!(heap.peek(), Some(Reverse(e)) if e.wake_at_ms <= now)
            };
            if !due {
                break;
            }
            let Reverse(entry) = self.heap.borrow_mut().pop().expect("peeked above");
            entry.waker.wake();
            fired += 1;
        }
        fired
    }

    /// Wake every parked timer regardless of its deadline. Cancellation
    /// uses this so sleepers re-poll and observe the cancel state.
    pub fn fire_all(&self) -> usize {
        let entries: Vec<Reverse<TimerEntry>> = self.heap.borrow_mut().drain().collect();
        let fired = entries.len();
        for Reverse(entry) in entries {
            entry.waker.wake();
        }
        fired
    }

    /// Earliest pending wake-at time.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.heap.borrow().peek().map(|Reverse(e)| e.wake_at_ms)
    }

    pub fn clear(&self) {
        self.heap.borrow_mut().clear();
    }
}

pub struct SleepFuture {
    queue: Rc<TimerQueue>,
    wake_at_ms: u64,
    cancel: Option<CancelState>,
}

impl Future for SleepFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(cancel) = &self.cancel {
            if cancel.check().is_some() {
                return Poll::Ready(());
            }
        }
        if self.queue.clock.monotonic_ms() >= self.wake_at_ms {
            Poll::Ready(())
        } else {
            self.queue.register(self.wake_at_ms, cx.waker().clone());
            Poll::Pending
        }
    }
}
