//! Events dispatcher
//!
//! Two independent structures live here:
//!
//! - the subscription table, `(event name, destination) -> callbacks`, whose
//!   length is the reference count that drives enable/disable directives, and
//! - the root emitter, `event name -> callbacks`, which drives delivery.
//!
//! Delivery goes through the emitter only, so a callback subscribed through one
//! destination also sees the same event coming from any other destination.
//! Consumers that care about the origin check `Event::origin` themselves.

use crate::core::emitter::{Emitter, Listener};
use crate::core::handle::{AddressableHandle, ContextDescriptor, ContextId};
use crate::core::message::{event_module_name, Event};
use crate::error::DispatchError;
use crate::handler::router::Router;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    event_name: String,
    destination: ContextId,
}

impl SubscriptionKey {
    fn new(event_name: &str, destination: ContextId) -> Self {
        Self {
            event_name: event_name.to_string(),
            destination,
        }
    }
}

#[derive(Default)]
struct DispatcherState {
    subscriptions: HashMap<SubscriptionKey, Vec<Listener<Event>>>,
    destroyed: bool,
}

impl DispatcherState {
    /// Remove one occurrence of `callback` under `key`. Returns the remaining
    /// count, or `None` if there was nothing to remove.
    fn remove_entry(&mut self, key: &SubscriptionKey, callback: &Listener<Event>) -> Option<usize> {
        let listeners = self.subscriptions.get_mut(key)?;
        let index = listeners.iter().position(|l| l == callback)?;
        listeners.remove(index);
        let remaining = listeners.len();
        if remaining == 0 {
            self.subscriptions.remove(key);
        }
        Some(remaining)
    }

    fn is_listening(&self, event_name: &str, callback: &Listener<Event>) -> bool {
        self.subscriptions
            .iter()
            .any(|(key, listeners)| key.event_name == event_name && listeners.contains(callback))
    }
}

/// Subscription bookkeeping for one session.
///
/// All mutations are serialized behind one async lock which stays held while a
/// directive is in flight, so the count table and the realms' gates never
/// disagree once a call returns.
pub struct EventsDispatcher {
    router: Arc<Router>,
    emitter: Arc<Emitter<Event>>,
    state: Mutex<DispatcherState>,
}

impl EventsDispatcher {
    pub(crate) fn new(router: Arc<Router>, emitter: Arc<Emitter<Event>>) -> Self {
        Self {
            router,
            emitter,
            state: Mutex::new(DispatcherState::default()),
        }
    }

    /// Subscribe `callback` to `event_name`, enabling the event in the realm
    /// named by `descriptor` if this is its first subscriber there.
    ///
    /// If the realm rejects the directive the subscription is rolled back and
    /// the error returned.
    pub async fn subscribe(
        &self,
        event_name: &str,
        descriptor: &ContextDescriptor,
        callback: Listener<Event>,
    ) -> Result<(), DispatchError> {
        if event_module_name(event_name).is_none() {
            return Err(DispatchError::InvalidEventName(event_name.to_string()));
        }

        let destination = descriptor.destination();
        let mut state = self.state.lock().await;
        if state.destroyed {
            return Err(DispatchError::unavailable(destination, "session destroyed"));
        }

        let key = SubscriptionKey::new(event_name, descriptor.context_id);
        let count = {
            let listeners = state.subscriptions.entry(key.clone()).or_default();
            listeners.push(callback.clone());
            listeners.len()
        };
        self.emitter.on(event_name, callback.clone());

        if count == 1 {
            log::debug!("First subscriber for {} at {}, enabling", event_name, destination);
            if let Err(err) = self
                .router
                .set_event_gate(descriptor.context_id, event_name, true)
                .await
            {
                log::warn!("Could not enable {} at {}: {}", event_name, destination, err);
                self.router.discard_event_gate(descriptor.context_id, event_name);
                state.remove_entry(&key, &callback);
                if !state.is_listening(event_name, &callback) {
                    self.emitter.off(event_name, &callback);
                }
                return Err(err);
            }
        } else {
            log::trace!("{} at {} now has {} subscribers", event_name, destination, count);
        }

        Ok(())
    }

    /// Remove one subscription of `callback`. Unknown or already removed
    /// subscriptions are ignored; this never fails.
    ///
    /// The root emitter keeps one entry per listener, shared with
    /// `RootMessageHandler::on`. Once `callback` has no subscription left for
    /// `event_name` that entry is removed, including a registration made
    /// directly with `on` for the same listener.
    pub async fn unsubscribe(
        &self,
        event_name: &str,
        descriptor: &ContextDescriptor,
        callback: &Listener<Event>,
    ) {
        let destination = descriptor.destination();
        let mut state = self.state.lock().await;
        if state.destroyed {
            return;
        }

        let key = SubscriptionKey::new(event_name, descriptor.context_id);
        let Some(remaining) = state.remove_entry(&key, callback) else {
            log::trace!("No subscription of {:?} to {} at {}", callback, event_name, destination);
            return;
        };

        if !state.is_listening(event_name, callback) {
            self.emitter.off(event_name, callback);
        }

        if remaining == 0 {
            log::debug!("Last subscriber for {} at {} left, disabling", event_name, destination);
            if let Err(err) = self
                .router
                .set_event_gate(descriptor.context_id, event_name, false)
                .await
            {
                // The realm is gone, so there is no gate left to close.
                log::debug!("Could not disable {} at {}: {}", event_name, destination, err);
            }
        }
    }

    /// Whether the realm at `destination` currently has `event_name` enabled,
    /// as reported by the realm itself. The root is never gated.
    pub async fn is_subscribed(
        &self,
        event_name: &str,
        destination: &AddressableHandle,
    ) -> Result<bool, DispatchError> {
        match destination {
            AddressableHandle::Root => Ok(false),
            AddressableHandle::Realm { context_id } => {
                self.router.query_event_gate(*context_id, event_name).await
            }
        }
    }

    /// Number of active subscriptions for `event_name` at `destination`.
    pub async fn subscription_count(&self, event_name: &str, destination: &ContextDescriptor) -> usize {
        let key = SubscriptionKey::new(event_name, destination.context_id);
        self.state
            .lock()
            .await
            .subscriptions
            .get(&key)
            .map_or(0, Vec::len)
    }

    /// Drop every subscription held at a realm that was detached. Nothing is
    /// sent to the realm; its handler is already gone.
    pub(crate) async fn forget_destination(&self, context_id: ContextId) {
        let mut state = self.state.lock().await;
        if state.destroyed {
            return;
        }

        let keys: Vec<SubscriptionKey> = state
            .subscriptions
            .keys()
            .filter(|key| key.destination == context_id)
            .cloned()
            .collect();
        for key in &keys {
            let Some(listeners) = state.subscriptions.remove(key) else {
                continue;
            };
            for listener in &listeners {
                if !state.is_listening(&key.event_name, listener) {
                    self.emitter.off(&key.event_name, listener);
                }
            }
        }
        if !keys.is_empty() {
            log::debug!("Dropped {} subscription keys of detached realm#{}", keys.len(), context_id);
        }
    }

    /// Forget every subscription. No disable directives are sent: the realms
    /// are torn down together with the session.
    pub async fn destroy(&self) {
        let mut state = self.state.lock().await;
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        let subscriptions = std::mem::take(&mut state.subscriptions);
        for (key, listeners) in &subscriptions {
            for listener in listeners {
                self.emitter.off(&key.event_name, listener);
            }
        }
        log::debug!("Events dispatcher destroyed ({} subscription keys dropped)", subscriptions.len());
    }
}
