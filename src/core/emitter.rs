//! Multi-listener broadcast keyed by event name.
//!
//! `Emitter` is the delivery mechanism behind the root handler: monitoring
//! listeners registered with `on()` and the events dispatcher's subscriptions
//! both end up in the same table. Emission is synchronous, in registration
//! order, and a panicking listener never stops the others.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

type ListenerFn<T> = dyn Fn(&str, &T) + Send + Sync;

/// A listener callback with pointer identity.
///
/// Two `Listener`s are equal when they are clones of the same callback, which
/// is what `off()` and unsubscribe match against.
pub struct Listener<T>(Arc<ListenerFn<T>>);

impl<T> Listener<T> {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&str, &T) + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    pub fn call(&self, name: &str, payload: &T) {
        (self.0)(name, payload)
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> PartialEq for Listener<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl<T> Eq for Listener<T> {}

impl<T> fmt::Debug for Listener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({:p})", self.addr())
    }
}

/// Name-indexed listener table.
pub struct Emitter<T> {
    listeners: Mutex<HashMap<String, Vec<Listener<T>>>>,
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Vec<Listener<T>>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `listener` for `name`. Returns false if it was already there.
    pub fn on(&self, name: &str, listener: Listener<T>) -> bool {
        let mut table = self.table();
        let listeners = table.entry(name.to_string()).or_default();
        if listeners.contains(&listener) {
            log::trace!("Listener already registered for {}", name);
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Remove `listener` from `name`. Absent listeners are ignored.
    pub fn off(&self, name: &str, listener: &Listener<T>) -> bool {
        let mut table = self.table();
        let Some(listeners) = table.get_mut(name) else {
            return false;
        };
        let Some(index) = listeners.iter().position(|l| l == listener) else {
            return false;
        };
        listeners.remove(index);
        if listeners.is_empty() {
            table.remove(name);
        }
        true
    }

    /// Invoke every listener for `name`. Returns how many ran without panicking.
    pub fn emit(&self, name: &str, payload: &T) -> usize {
        // Snapshot so listeners may call on()/off() re-entrantly.
        let listeners = match self.table().get(name) {
            Some(listeners) => listeners.clone(),
            None => return 0,
        };

        log::trace!("Emitting {} to {} listeners", name, listeners.len());

        let mut delivered = 0;
        for (i, listener) in listeners.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.call(name, payload))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    log::warn!("Listener {} for {} panicked, continuing", i, name);
                }
            }
        }
        delivered
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.table().get(name).map_or(0, Vec::len)
    }

    pub fn has_listener(&self, name: &str, listener: &Listener<T>) -> bool {
        self.table()
            .get(name)
            .is_some_and(|listeners| listeners.contains(listener))
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.table().clear();
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}
