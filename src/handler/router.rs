//! Router - command delivery from the root to realm handlers
//!
//! The router keeps an arena of realms keyed by `ContextId`. The host attaches a
//! context when the corresponding window appears and detaches it when the window
//! goes away; the realm handler itself is only spawned when the first request
//! for that context arrives. Every request gets a `u64` id, its reply sender is
//! parked in the pending table, and the root's upstream pump resolves it when
//! the realm answers. Whatever happens to the realm, each pending entry is
//! completed exactly once.
//!
//! The router also remembers which events each attached context should have
//! enabled, as last directed by the events dispatcher. A realm handler that is
//! started again after a crash comes up with those gates already open.

use crate::core::handle::{AddressableHandle, ContextId};
use crate::core::message::{Command, RealmRequest, RealmRequestBody};
use crate::core::message::Upstream;
use crate::error::DispatchError;
use crate::handler::module::ModuleCatalog;
use crate::handler::realm::RealmMessageHandler;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

type Reply = oneshot::Sender<Result<Value, DispatchError>>;

struct PendingRequest {
    destination: AddressableHandle,
    /// Realm handler instance the request was queued on
    instance: u64,
    reply: Reply,
}

#[derive(Default)]
struct RouterState {
    /// Attached contexts; `None` until the handler is first needed.
    realms: HashMap<ContextId, Option<RealmMessageHandler>>,
    pending: HashMap<u64, PendingRequest>,
    /// Events switched on per context by directives
    event_gates: HashMap<ContextId, BTreeSet<String>>,
    destroyed: bool,
}

pub struct Router {
    catalog: Arc<ModuleCatalog>,
    upstream: mpsc::UnboundedSender<Upstream>,
    next_request_id: AtomicU64,
    next_instance: AtomicU64,
    state: Mutex<RouterState>,
}

impl Router {
    pub(crate) fn new(catalog: Arc<ModuleCatalog>, upstream: mpsc::UnboundedSender<Upstream>) -> Self {
        Self {
            catalog,
            upstream,
            next_request_id: AtomicU64::new(1),
            next_instance: AtomicU64::new(1),
            state: Mutex::new(RouterState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `context_id` addressable. Returns false if it already was, or if
    /// the router has been destroyed.
    pub(crate) fn attach_realm(&self, context_id: ContextId) -> bool {
        let mut state = self.lock();
        if state.destroyed || state.realms.contains_key(&context_id) {
            return false;
        }
        log::debug!("Attached realm#{}", context_id);
        state.realms.insert(context_id, None);
        true
    }

    /// Tear down the realm for `context_id`. Its in-flight requests fail with
    /// `DestinationUnavailable` and its enabled events are forgotten.
    pub(crate) fn detach_realm(&self, context_id: ContextId) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.realms.remove(&context_id) else {
            return false;
        };
        state.event_gates.remove(&context_id);
        let destination = AddressableHandle::Realm { context_id };
        if let Some(mut realm) = slot {
            realm.destroy();
        }
        let failed = Self::fail_pending(&mut state, |pending| pending.destination == destination, "realm detached");
        log::debug!("Detached {} ({} in-flight requests failed)", destination, failed);
        true
    }

    pub fn is_attached(&self, context_id: ContextId) -> bool {
        self.lock().realms.contains_key(&context_id)
    }

    /// Contexts whose handler is currently running.
    pub fn live_realms(&self) -> Vec<ContextId> {
        let state = self.lock();
        let mut live: Vec<ContextId> = state
            .realms
            .iter()
            .filter(|(_, slot)| slot.as_ref().is_some_and(|realm| !realm.is_closed()))
            .map(|(id, _)| *id)
            .collect();
        live.sort();
        live
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Events currently switched on for `context_id`, sorted.
    pub fn enabled_events(&self, context_id: ContextId) -> Vec<String> {
        self.lock()
            .event_gates
            .get(&context_id)
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Route `command` to its realm and wait for the outcome.
    pub async fn dispatch(&self, command: Command) -> Result<Value, DispatchError> {
        let context_id = match command.destination {
            AddressableHandle::Realm { context_id } => context_id,
            AddressableHandle::Root => {
                return Err(DispatchError::unavailable(
                    AddressableHandle::Root,
                    "the router only addresses realms",
                ))
            }
        };
        let body = RealmRequestBody::Command {
            module_name: command.module_name,
            command_name: command.command_name,
            params: command.params,
        };
        self.request(context_id, body).await
    }

    /// Deliver an enable/disable directive and wait for its acknowledgment.
    pub(crate) async fn set_event_gate(
        &self,
        context_id: ContextId,
        event_name: &str,
        enabled: bool,
    ) -> Result<(), DispatchError> {
        let body = RealmRequestBody::SetEventGate {
            event_name: event_name.to_string(),
            enabled,
        };
        self.request(context_id, body).await.map(|_| ())
    }

    /// Ask the realm for its cached gate flag.
    pub(crate) async fn query_event_gate(
        &self,
        context_id: ContextId,
        event_name: &str,
    ) -> Result<bool, DispatchError> {
        let body = RealmRequestBody::QueryEventGate {
            event_name: event_name.to_string(),
        };
        let value = self.request(context_id, body).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Forget an enable directive the realm rejected.
    pub(crate) fn discard_event_gate(&self, context_id: ContextId, event_name: &str) {
        let mut state = self.lock();
        if let Some(events) = state.event_gates.get_mut(&context_id) {
            events.remove(event_name);
            if events.is_empty() {
                state.event_gates.remove(&context_id);
            }
        }
    }

    async fn request(&self, context_id: ContextId, body: RealmRequestBody) -> Result<Value, DispatchError> {
        let destination = AddressableHandle::Realm { context_id };
        let (id, receiver) = self.enqueue(context_id, body)?;
        let mut guard = PendingGuard {
            router: self,
            id,
            armed: true,
        };
        let result = receiver
            .await
            .unwrap_or_else(|_| Err(DispatchError::unavailable(destination, "request dropped")));
        guard.armed = false;
        result
    }

    /// Queue `body` on the realm, spawning its handler if needed. Queueing
    /// happens under the router lock, so requests reach one realm in call order.
    fn enqueue(
        &self,
        context_id: ContextId,
        body: RealmRequestBody,
    ) -> Result<(u64, oneshot::Receiver<Result<Value, DispatchError>>), DispatchError> {
        let destination = AddressableHandle::Realm { context_id };
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.destroyed {
            return Err(DispatchError::unavailable(destination, "session destroyed"));
        }

        let slot = state
            .realms
            .get_mut(&context_id)
            .ok_or_else(|| DispatchError::unavailable(destination, "no such realm"))?;

        if slot.as_ref().is_some_and(RealmMessageHandler::is_closed) {
            log::warn!("{} handler stopped unexpectedly, restarting", destination);
            *slot = None;
        }

        let event_gates = state.event_gates.entry(context_id).or_default();
        let realm = slot.get_or_insert_with(|| {
            let instance = self.next_instance.fetch_add(1, Ordering::SeqCst);
            let registry = self.catalog.build_registry(&destination);
            RealmMessageHandler::spawn(
                context_id,
                instance,
                registry,
                event_gates.iter(),
                self.upstream.clone(),
            )
        });
        let instance = realm.instance();

        // Recorded before sending: a handler started after this point must
        // see the directive's effect even if this instance never applies it.
        if let RealmRequestBody::SetEventGate { event_name, enabled } = &body {
            if *enabled {
                event_gates.insert(event_name.clone());
            } else {
                event_gates.remove(event_name);
            }
        }
        if event_gates.is_empty() {
            state.event_gates.remove(&context_id);
        }

        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        log::trace!("Routing request {} to {}: {}", id, destination, body.label());
        realm
            .send(RealmRequest { id, body })
            .map_err(|_| DispatchError::unavailable(destination, "realm handler stopped"))?;

        let (reply, receiver) = oneshot::channel();
        state.pending.insert(
            id,
            PendingRequest {
                destination,
                instance,
                reply,
            },
        );
        Ok((id, receiver))
    }

    /// Complete the pending request `id`. Late answers (after detach or
    /// timeout) are dropped.
    pub(crate) fn resolve(&self, id: u64, result: Result<Value, DispatchError>) {
        let pending = self.lock().pending.remove(&id);
        match pending {
            Some(pending) => {
                if pending.reply.send(result).is_err() {
                    log::trace!("Caller of request {} is no longer waiting", id);
                }
            }
            None => log::trace!("Dropping late response for request {}", id),
        }
    }

    /// A realm task ended. Fail whatever was still queued on it and forget
    /// the handler so the next request starts a fresh one.
    pub(crate) fn realm_gone(&self, instance: u64) {
        let mut state = self.lock();
        for slot in state.realms.values_mut() {
            if slot.as_ref().is_some_and(|realm| realm.instance() == instance) {
                *slot = None;
            }
        }
        let failed = Self::fail_pending(&mut state, |pending| pending.instance == instance, "realm handler stopped");
        if failed > 0 {
            log::warn!("Realm instance {} ended with {} requests in flight", instance, failed);
        }
    }

    /// Stop every realm and fail every pending request. Later requests fail
    /// without spawning anything.
    pub fn destroy(&self) {
        let mut state = self.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        state.event_gates.clear();
        for (_, slot) in state.realms.drain() {
            if let Some(mut realm) = slot {
                realm.destroy();
            }
        }
        let failed = Self::fail_pending(&mut state, |_| true, "session destroyed");
        log::debug!("Router destroyed ({} in-flight requests failed)", failed);
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    fn fail_pending<F>(state: &mut RouterState, matches: F, reason: &str) -> usize
    where
        F: Fn(&PendingRequest) -> bool,
    {
        let ids: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, pending)| matches(pending))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(pending) = state.pending.remove(id) {
                let _ = pending
                    .reply
                    .send(Err(DispatchError::unavailable(pending.destination, reason)));
            }
        }
        ids.len()
    }
}

/// Drops the pending entry of a request whose caller stopped waiting, e.g.
/// on timeout.
struct PendingGuard<'a> {
    router: &'a Router,
    id: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.router.lock().pending.remove(&self.id).is_some() {
            log::trace!("Request {} abandoned by its caller", self.id);
        }
    }
}
