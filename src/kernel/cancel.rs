//! Cancellation state
//!
//! One shared cell per shell session: the driver arms a deadline before
//! each command and may set an explicit cancel reason; guests observe it
//! at suspension points and through the `check_cancel` host call.

use std::cell::Cell;
use std::rc::Rc;

use crate::clock::Clock;

/// Why execution is being unwound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Timeout,
    Cancelled,
}

impl CancelReason {
    /// Conventional shell exit code for the reason.
    pub fn exit_code(&self) -> i32 {
        match self {
            CancelReason::Timeout => 124,
            CancelReason::Cancelled => 130,
        }
    }
}

#[derive(Clone)]
pub struct CancelState {
    clock: Rc<dyn Clock>,
    deadline_ms: Rc<Cell<Option<u64>>>,
    reason: Rc<Cell<Option<CancelReason>>>,
}

impl CancelState {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            deadline_ms: Rc::new(Cell::new(None)),
            reason: Rc::new(Cell::new(None)),
        }
    }

    /// Arm the deadline for the command that is about to run.
    pub fn arm(&self, deadline_ms: Option<u64>) {
        self.deadline_ms.set(deadline_ms);
        self.reason.set(None);
    }

    /// Request cancellation with an explicit reason.
    pub fn cancel(&self, reason: CancelReason) {
        if self.reason.get().is_none() {
            self.reason.set(Some(reason));
        }
    }

    /// Poll the state; a deadline in the past latches `Timeout`.
    pub fn check(&self) -> Option<CancelReason> {
        if let Some(reason) = self.reason.get() {
            return Some(reason);
        }
        if let Some(deadline) = self.deadline_ms.get() {
            if self.clock.monotonic_ms() >= deadline {
                self.reason.set(Some(CancelReason::Timeout));
                return Some(CancelReason::Timeout);
            }
        }
        None
    }

    pub fn deadline_ms(&self) -> Option<u64> {
        self.deadline_ms.get()
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_deadline_latches_timeout() {
        let clock = ManualClock::new();
        let cancel = CancelState::new(Rc::new(clock.clone()));
        cancel.arm(Some(100));
        assert_eq!(cancel.check(), None);
        clock.advance(100);
        assert_eq!(cancel.check(), Some(CancelReason::Timeout));
        // Stays latched even if the deadline is re-read.
        assert_eq!(cancel.check(), Some(CancelReason::Timeout));
    }

    #[test]
    fn test_explicit_cancel_wins_over_later_timeout() {
        let clock = ManualClock::new();
        let cancel = CancelState::new(Rc::new(clock.clone()));
        cancel.arm(Some(50));
        cancel.cancel(CancelReason::Cancelled);
        clock.advance(100);
        assert_eq!(cancel.check(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn test_arm_clears_previous_reason() {
        let clock = ManualClock::new();
        let cancel = CancelState::new(Rc::new(clock.clone()));
        cancel.cancel(CancelReason::Cancelled);
        cancel.arm(Some(1000));
        assert_eq!(cancel.check(), None);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CancelReason::Timeout.exit_code(), 124);
        assert_eq!(CancelReason::Cancelled.exit_code(), 130);
    }
}
