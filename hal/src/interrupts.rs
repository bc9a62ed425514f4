//! # Interrupt-Time Completion
//!
//! A [`Completion`] is the meeting point between a thread blocked on a
//! request and the interrupt path that pops the matching reply. The
//! interrupt side only ever calls [`Completion::complete`]; a host reset
//! calls [`Completion::abort_for_reset`] so that waiters return promptly
//! instead of running out their timeout.

use crate::mpi::Reply;
use crate::timer::{Clock, Deadline};
use spin::Mutex;

/// State of a completion slot
#[derive(Debug, Clone)]
pub enum CompletionState {
    /// Nobody is waiting; replies are dropped
    Idle,
    /// A request is outstanding
    Pending,
    /// The reply arrived
    Complete(Reply),
    /// The adapter was reset while the request was outstanding
    Reset,
}

/// Outcome of [`Completion::wait`]
#[derive(Debug, Clone)]
pub enum WaitResult {
    /// The reply arrived in time
    Completed(Reply),
    /// The bounded wait elapsed
    TimedOut,
    /// A host reset cancelled the request
    Reset,
}

/// Single-owner wait object for one outstanding request
#[derive(Debug)]
pub struct Completion {
    state: Mutex<CompletionState>,
}

impl Completion {
    /// Create an idle completion
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState::Idle),
        }
    }

    /// Mark a request as outstanding
    pub fn arm(&self) {
        *self.state.lock() = CompletionState::Pending;
    }

    /// Deliver a reply (interrupt context)
    ///
    /// Returns `false` if nobody was waiting for it.
    pub fn complete(&self, reply: Reply) -> bool {
        let mut state = self.state.lock();
        match *state {
            CompletionState::Pending => {
                *state = CompletionState::Complete(reply);
                true
            }
            _ => false,
        }
    }

    /// Force an outstanding request into the reset state
    pub fn abort_for_reset(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            CompletionState::Pending => {
                *state = CompletionState::Reset;
                true
            }
            _ => false,
        }
    }

    /// Whether a request is outstanding
    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), CompletionState::Pending)
    }

    /// Stop waiting after a timeout
    ///
    /// A result that landed after the last check is returned instead of
    /// being dropped.
    pub fn abandon(&self) -> Option<WaitResult> {
        let mut state = self.state.lock();
        match core::mem::replace(&mut *state, CompletionState::Idle) {
            CompletionState::Complete(reply) => Some(WaitResult::Completed(reply)),
            CompletionState::Reset => Some(WaitResult::Reset),
            CompletionState::Idle | CompletionState::Pending => None,
        }
    }

    /// Take a finished result, leaving the slot idle
    pub fn try_take(&self) -> Option<WaitResult> {
        let mut state = self.state.lock();
        match core::mem::replace(&mut *state, CompletionState::Idle) {
            CompletionState::Complete(reply) => Some(WaitResult::Completed(reply)),
            CompletionState::Reset => Some(WaitResult::Reset),
            other => {
                *state = other;
                None
            }
        }
    }

    /// Wait for the reply, calling `poll` before every check
    ///
    /// `poll` is how a waiter drives the reply queue when interrupts are
    /// not being delivered on another CPU. On timeout the completion is
    /// abandoned, so a reply that races the deadline is either returned or
    /// refused by [`complete`](Self::complete), never lost in between.
    pub fn wait<F: FnMut()>(&self, clock: &dyn Clock, timeout_ms: u64, mut poll: F) -> WaitResult {
        let deadline = Deadline::after(clock, timeout_ms);
        loop {
            poll();
            if let Some(result) = self.try_take() {
                return result;
            }
            if deadline.expired(clock) {
                return self.abandon().unwrap_or(WaitResult::TimedOut);
            }
            clock.delay_ms(1);
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
