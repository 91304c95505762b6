//! One-shot completion handles for asynchronous operations
//!
//! A [`Promise`] is fulfilled at most once; every [`Completion`] cloned from
//! the same pair observes that one value. Callers can block ([`Completion::wait`],
//! [`Completion::wait_timeout`]), poll ([`Completion::try_get`]) or register a
//! callback ([`Completion::on_ready`]).
//!
//! Fulfilling twice is not an error: the first value wins and later ones are
//! dropped. Background paths racing to finish the same operation rely on this.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

type Callback<T> = Box<dyn FnOnce(&T) + Send>;

struct Slot<T> {
    value: Option<T>,
    callbacks: Vec<Callback<T>>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// Producer side of a one-shot completion
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer side of a one-shot completion
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

/// Create a connected promise/completion pair
pub fn completion_pair<T: Clone + Send + 'static>() -> (Promise<T>, Completion<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            value: None,
            callbacks: Vec::new(),
        }),
        ready: Condvar::new(),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
        },
        Completion { shared },
    )
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Deliver the value; returns false if a value was already delivered
    pub fn fulfill(&self, value: T) -> bool {
        let callbacks = {
            let mut slot = self.shared.slot.lock();
            if slot.value.is_some() {
                return false;
            }
            slot.value = Some(value.clone());
            std::mem::take(&mut slot.callbacks)
        };
        self.shared.ready.notify_all();
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    /// Whether a value was delivered
    pub fn is_fulfilled(&self) -> bool {
        self.shared.slot.lock().value.is_some()
    }

    /// Completion observing this promise
    pub fn completion(&self) -> Completion<T> {
        Completion {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    /// Completion that is already fulfilled
    pub fn ready(value: T) -> Self {
        let (promise, completion) = completion_pair();
        promise.fulfill(value);
        completion
    }

    /// Block until the value arrives
    pub fn wait(&self) -> T {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(value) = &slot.value {
                return value.clone();
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Block until the value arrives or `timeout` passes
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(value) = &slot.value {
                return Some(value.clone());
            }
            if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                return slot.value.clone();
            }
        }
    }

    /// The value, if already delivered
    pub fn try_get(&self) -> Option<T> {
        self.shared.slot.lock().value.clone()
    }

    /// Whether the value was delivered
    pub fn is_ready(&self) -> bool {
        self.shared.slot.lock().value.is_some()
    }

    /// Run `callback` with the value once it arrives
    ///
    /// Runs immediately on the calling thread if the value is already there,
    /// otherwise on the thread that fulfills the promise.
    pub fn on_ready(&self, callback: impl FnOnce(&T) + Send + 'static) {
        let value = {
            let mut slot = self.shared.slot.lock();
            match &slot.value {
                Some(value) => value.clone(),
                None => {
                    slot.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&value);
    }
}

impl<T: fmt::Debug> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("value", &self.shared.slot.lock().value)
            .finish()
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("value", &self.shared.slot.lock().value)
            .finish()
    }
}
