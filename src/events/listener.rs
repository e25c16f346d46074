//! Listener contract for event buses.

use std::sync::Arc;

/// Something that wants to be told about an event.
///
/// Every `Fn(&A) + Send + Sync` closure is a listener, so most callers never
/// implement this trait by hand.
pub trait Listener<A>: Send + Sync + 'static {
    /// Handle one published event.
    fn notify(&self, args: &A);
}

impl<A, F> Listener<A> for F
where
    F: Fn(&A) + Send + Sync + 'static,
{
    fn notify(&self, args: &A) {
        self(args)
    }
}

/// Shared, type-erased listener as stored by a bus.
pub type BoxListener<A> = Arc<dyn Listener<A>>;
