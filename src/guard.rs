//! Reader admission for the mapped container.
//!
//! Lookups and loads run concurrently against the read buffer without
//! locks. Teardown must not unmap it under them, so every reader enters a
//! [`ReaderGate`] and the closer waits until the gate has drained.
//!
//! Gate states, held in one signed counter:
//!
//! | value      | meaning                                   |
//! |------------|-------------------------------------------|
//! | `n >= 0`   | open, `n` readers inside                  |
//! | `-(n + 1)` | closing, `n` readers still inside         |
//! | `-1`       | closed, no reader inside, none admitted   |
//!
//! Transitions: `enter` takes `n -> n + 1` only while open; `exit` takes
//! `n -> n - 1` when open and `-(n + 1) -> -n` when closing; `close` takes
//! `n -> -(n + 1)` once and then spins until the value reaches `-1`.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_utils::Backoff;
use tracing::debug;

const CLOSED: i64 = -1;

#[derive(Debug, Default)]
pub struct ReaderGate {
    state: AtomicI64,
}

impl ReaderGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a reader unless the gate is closing or closed.
    pub fn enter(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current < 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases a reader admitted by [`ReaderGate::enter`].
    pub fn exit(&self) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = if current > 0 {
                current - 1
            } else if current < CLOSED {
                current + 1
            } else {
                debug_assert!(false, "reader gate exit without matching enter");
                return;
            };
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Stops admitting readers and waits for those inside to leave.
    ///
    /// Returns `true` for the call that performed the close; concurrent or
    /// repeated calls wait for the drain and return `false`.
    pub fn close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        let closed_here = loop {
            if current < 0 {
                break false;
            }
            match self.state.compare_exchange_weak(
                current,
                -(current + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current > 0 {
                        debug!(readers = current, "waiting for cache readers to drain");
                    }
                    break true;
                }
                Err(actual) => current = actual,
            }
        };

        let backoff = Backoff::new();
        while self.state.load(Ordering::Acquire) != CLOSED {
            backoff.snooze();
        }
        closed_here
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// Readers currently inside.
    pub fn active_readers(&self) -> usize {
        let state = self.state.load(Ordering::Acquire);
        let readers = if state >= 0 { state } else { -(state + 1) };
        readers as usize
    }
}

/// A value that readers borrow through a [`ReaderGate`] and the closer takes
/// once the gate has drained.
pub struct Guarded<T> {
    gate: ReaderGate,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: shared references only reach the value while the gate is open,
// and the one mutation (`close_and_take`) happens after the gate is closed
// and drained, by the single caller that closed it.
unsafe impl<T: Send + Sync> Sync for Guarded<T> {}
unsafe impl<T: Send> Send for Guarded<T> {}

impl<T> Guarded<T> {
    pub fn new(value: Option<T>) -> Self {
        Self {
            gate: ReaderGate::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Borrows the value, or `None` if there is none or the gate is closing.
    pub fn enter(&self) -> Option<ReadGuard<'_, T>> {
        if !self.gate.enter() {
            return None;
        }
        // SAFETY: the gate is open for us, so `close_and_take` cannot run
        // until this reader exits.
        match unsafe { &*self.value.get() } {
            Some(value) => Some(ReadGuard { owner: self, value }),
            None => {
                self.gate.exit();
                None
            }
        }
    }

    /// Closes the gate, waits for readers and hands the value to the caller
    /// that performed the close. Everyone else gets `None`.
    pub fn close_and_take(&self) -> Option<T> {
        if !self.gate.close() {
            return None;
        }
        // SAFETY: the gate is closed and drained and this call closed it, so
        // no reader and no other closer can observe the cell.
        unsafe { (*self.value.get()).take() }
    }

    pub fn gate(&self) -> &ReaderGate {
        &self.gate
    }
}

impl<T> std::fmt::Debug for Guarded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guarded").field("gate", &self.gate).finish_non_exhaustive()
    }
}

pub struct ReadGuard<'a, T> {
    owner: &'a Guarded<T>,
    value: &'a T,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.gate.exit();
    }
}
