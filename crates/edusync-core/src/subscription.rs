//! Cancellation handles
//!
//! Every registration in the engine (event handlers, remote change feeds,
//! collection observers) hands back a [`Subscription`]. Dropping it or
//! calling [`Subscription::unsubscribe`] releases the registration.

use std::fmt;

/// Guard that runs its cleanup exactly once
#[must_use = "dropping a Subscription immediately cancels it"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to release
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Release the registration now
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    /// Keep the registration alive for the rest of the process
    pub fn detach(mut self) {
        self.cancel = None;
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
