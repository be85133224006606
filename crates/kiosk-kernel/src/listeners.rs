//! [`ListenerRegistry`] – zero-argument change callbacks.
//!
//! Listeners are compared by identity: registering the same `Arc` twice is a
//! no-op.  They are invoked synchronously in registration order, each under
//! `catch_unwind`, so one panicking listener neither stops the others nor
//! poisons the registry.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::error;

pub type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `listener`.  Returns `false` if this exact listener is
    /// already registered.
    pub fn add(&self, listener: Listener) -> bool {
        let mut entries = self.entries();
        if entries.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        entries.push(listener);
        true
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every listener once.  Returns how many completed without
    /// panicking.
    pub fn notify(&self) -> usize {
        // Snapshot so a listener may register another without deadlocking.
        let snapshot: Vec<Listener> = self.entries().clone();
        let mut completed = 0;
        for (index, listener) in snapshot.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| listener())) {
                Ok(()) => completed += 1,
                Err(_) => error!(index, "state listener panicked"),
            }
        }
        completed
    }
}
