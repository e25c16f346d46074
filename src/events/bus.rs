//! Typed publish/subscribe bus.
//!
//! One [`EventBus`] exists per event kind; the argument type is the payload
//! delivered to listeners (`()` for connect/disconnect, [`Collision`] for
//! collisions).
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use sphero_wire::events::EventBus;
//!
//! let bus: EventBus<u8> = EventBus::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//!
//! let counter = seen.clone();
//! bus.subscribe(move |value: &u8| {
//!     counter.fetch_add(*value as usize, Ordering::SeqCst);
//! });
//!
//! assert_eq!(bus.publish(&3).unwrap(), 1);
//! assert_eq!(seen.load(Ordering::SeqCst), 3);
//! ```
//!
//! [`Collision`]: crate::events::Collision

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::listener::{BoxListener, Listener};
use crate::error::{Result, SpheroError};

/// Registry of listeners for one event kind.
///
/// Publishing is synchronous: every listener registered when
/// [`publish`](Self::publish) starts runs before it returns, in registration
/// order. The listener list is snapshotted first, so a listener may
/// subscribe or publish on the same bus without deadlocking.
pub struct EventBus<A> {
    listeners: Mutex<Vec<BoxListener<A>>>,
}

impl<A: 'static> EventBus<A> {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener. Duplicates are not detected.
    pub fn subscribe<L>(&self, listener: L)
    where
        L: Listener<A>,
    {
        self.subscribe_shared(Arc::new(listener));
    }

    /// Register an already shared listener.
    pub fn subscribe_shared(&self, listener: BoxListener<A>) {
        self.lock().push(listener);
    }

    /// Invoke every registered listener with `args`.
    ///
    /// A panicking listener does not stop delivery to the others: the panic
    /// is caught and logged, the remaining listeners still run, and the
    /// failure is reported afterwards.
    ///
    /// Returns the number of listeners notified, or
    /// [`SpheroError::ListenerPanicked`] if any of them panicked.
    pub fn publish(&self, args: &A) -> Result<usize> {
        let snapshot: Vec<BoxListener<A>> = self.lock().clone();
        let total = snapshot.len();
        let mut failed = 0;

        for listener in &snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.notify(args)));
            if outcome.is_err() {
                failed += 1;
                tracing::error!(failed, total, "Listener panicked during publish");
            }
        }

        if failed > 0 {
            return Err(SpheroError::ListenerPanicked { failed, total });
        }
        Ok(total)
    }

    /// Remove all listeners.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BoxListener<A>>> {
        // Listeners never run under this lock, so a poisoned guard still
        // holds a consistent list.
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A: 'static> Default for EventBus<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: 'static> fmt::Debug for EventBus<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.len())
            .finish()
    }
}
