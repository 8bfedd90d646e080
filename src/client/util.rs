use std::sync::{Mutex, MutexGuard, PoisonError};

use event_listener::Event;


/// A one-shot value that any number of tasks can wait for.
///
/// The first call to `Completion::complete` sets the value permanently and
/// wakes every waiter. Later calls are ignored, so all waiters observe the
/// same value no matter when they start waiting.
#[derive(Debug)]
pub(crate) struct Completion<T> {
    value: Mutex<Option<T>>,
    event: Event,
}

impl<T: Clone> Completion<T> {
    /// Creates a new, unset [`Completion`].
    #[inline]
    #[must_use]
    pub(crate) fn new() -> Self {
        Self { value: Mutex::new(None), event: Event::new() }
    }

    // Only ever held for a clone or a store, never across an await
    #[inline]
    fn slot(&self) -> MutexGuard<'_, Option<T>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the value if it is still unset and wakes all waiters.
    ///
    /// Returns whether this call set the value.
    pub(crate) fn complete(&self, value: T) -> bool {
        {
            let mut slot = self.slot();
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
        }
        self.event.notify(usize::MAX);
        true
    }

    /// Returns a copy of the value, if set.
    #[inline]
    #[must_use]
    pub(crate) fn get(&self) -> Option<T> {
        self.slot().clone()
    }

    /// Tests whether the value was set.
    #[inline]
    #[must_use]
    pub(crate) fn is_set(&self) -> bool {
        self.slot().is_some()
    }

    /// Waits until the value is set, then returns a copy of it.
    pub(crate) async fn wait(&self) -> T {
        loop {
            if let Some(v) = self.get() {
                return v;
            }
            // Register before checking again to not miss a notification
            let listener = self.event.listen();
            if let Some(v) = self.get() {
                return v;
            }
            listener.await;
        }
    }
}
