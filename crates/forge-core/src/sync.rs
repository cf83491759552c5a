//! # Synchronization Primitives
//!
//! Fences and events for CPU-GPU synchronization.
//!
//! A [`Fence`] holds a monotonically increasing completion value that the
//! device timeline advances. The CPU side registers an [`Event`] against a
//! target value and blocks on it. Waits have no timeout: a stalled timeline
//! stalls the waiting thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

// =============================================================================
// EVENT
// =============================================================================

/// Manual-reset event
///
/// The OS-level wait primitive the CPU blocks on. Once set it stays set
/// until [`Event::reset`] is called.
#[derive(Debug, Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Create a non-signaled event
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event and wake all waiters
    pub fn set(&self) {
        let mut signaled = self
            .inner
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *signaled = true;
        self.inner.cond.notify_all();
    }

    /// Return the event to the non-signaled state
    pub fn reset(&self) {
        *self
            .inner
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Check without blocking
    pub fn is_set(&self) -> bool {
        *self
            .inner
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the event is set (infinite wait)
    pub fn wait(&self) {
        let mut signaled = self
            .inner
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*signaled {
            signaled = self
                .inner
                .cond
                .wait(signaled)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

// =============================================================================
// FENCE
// =============================================================================

/// GPU fence for CPU-GPU synchronization
///
/// Fences use a monotonically increasing value. The device timeline signals
/// values as it retires work; the CPU waits for a value through an event.
/// Cloning a fence yields another reference to the same counter.
#[derive(Debug, Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

#[derive(Debug)]
struct FenceInner {
    /// Highest value signaled so far
    completed: AtomicU64,
    /// Events waiting for a value, guarded together with the check
    waiters: spin::Mutex<Vec<(u64, Event)>>,
}

impl Fence {
    /// Create a fence with an initial completed value
    pub fn new(initial_value: u64) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                completed: AtomicU64::new(initial_value),
                waiters: spin::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Get the last completed value
    pub fn completed_value(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Check if value has been signaled
    pub fn is_signaled(&self, value: u64) -> bool {
        self.completed_value() >= value
    }

    /// Advance the completed value and release matching waiters
    ///
    /// Values never move backwards; signaling a lower value is ignored.
    pub fn signal(&self, value: u64) {
        let previous = self.inner.completed.fetch_max(value, Ordering::AcqRel);
        log::trace!("fence signal {} (was {})", value, previous);

        let mut waiters = self.inner.waiters.lock();
        waiters.retain(|(target, event)| {
            if *target <= value.max(previous) {
                event.set();
                false
            } else {
                true
            }
        });
    }

    /// Set `event` once the fence reaches `value`
    ///
    /// Sets the event immediately if the value is already complete.
    pub fn set_event_on_completion(&self, value: u64, event: &Event) {
        let mut waiters = self.inner.waiters.lock();
        if self.is_signaled(value) {
            event.set();
        } else {
            waiters.push((value, event.clone()));
        }
    }

    /// Block the calling thread until `value` is reached
    pub fn wait(&self, value: u64) {
        if self.is_signaled(value) {
            return;
        }
        let event = Event::new();
        self.set_event_on_completion(value, &event);
        event.wait();
    }
}
