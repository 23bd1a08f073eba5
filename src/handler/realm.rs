//! Realm message handler
//!
//! One `RealmMessageHandler` runs per live realm. It owns the realm's module
//! registry and its event gates, and drains a single mailbox on its own tokio
//! task, so requests to one realm are applied strictly in the order they were
//! queued. Results and events go back to the root over the shared upstream
//! channel.

use crate::core::handle::{AddressableHandle, ContextId};
use crate::core::message::{event_module_name, RealmRequest, RealmRequestBody, Upstream};
use crate::error::DispatchError;
use crate::handler::module::{ModuleContext, ModuleRegistry};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Handle to a running realm task.
pub struct RealmMessageHandler {
    handle: AddressableHandle,
    /// Distinguishes successive handlers for the same context id
    instance: u64,
    /// Mailbox of the realm task
    mailbox: mpsc::UnboundedSender<RealmRequest>,
    /// Channel for sending shutdown signal
    shutdown_sender: Option<oneshot::Sender<()>>,
    /// Handle to the message processing task
    task: Option<JoinHandle<()>>,
}

impl RealmMessageHandler {
    /// Start the realm task with `enabled_events` already switched on. Must be
    /// called from within a tokio runtime.
    pub(crate) fn spawn<'a>(
        context_id: ContextId,
        instance: u64,
        mut registry: ModuleRegistry,
        enabled_events: impl IntoIterator<Item = &'a String>,
        upstream: mpsc::UnboundedSender<Upstream>,
    ) -> Self {
        let handle = AddressableHandle::Realm { context_id };
        let (mailbox, receiver) = mpsc::unbounded_channel();
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        log::debug!(
            "Spawning {} with modules {:?}",
            handle,
            registry.names()
        );

        let mut gates = HashMap::new();
        for event_name in enabled_events {
            let module = event_module_name(event_name).and_then(|name| registry.get_mut(name));
            match module {
                Some(module) => {
                    module.on_event_gate(event_name, true);
                    gates.insert(event_name.clone(), true);
                }
                None => log::debug!("{}: no module for {}, gate left closed", handle, event_name),
            }
        }
        if !gates.is_empty() {
            log::debug!("{}: starting with {} events enabled", handle, gates.len());
        }

        let state = RealmState {
            handle,
            instance,
            registry,
            gates,
            upstream,
        };
        let task = tokio::spawn(state.run_message_loop(receiver, shutdown_receiver));

        Self {
            handle,
            instance,
            mailbox,
            shutdown_sender: Some(shutdown_sender),
            task: Some(task),
        }
    }

    pub fn handle(&self) -> AddressableHandle {
        self.handle
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    /// True once the realm task has stopped receiving.
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// Queue a request. Hands the request back if the realm task is gone.
    pub(crate) fn send(&self, request: RealmRequest) -> Result<(), RealmRequest> {
        self.mailbox.send(request).map_err(|e| e.0)
    }

    /// Stop the realm task. Requests still queued or running are abandoned;
    /// the router fails their callers.
    pub fn destroy(&mut self) {
        if let Some(shutdown_sender) = self.shutdown_sender.take() {
            log::debug!("Sending shutdown signal to {}", self.handle);
            let _ = shutdown_sender.send(());
        }

        // A module may be suspended inside a command; don't wait for it.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for RealmMessageHandler {
    fn drop(&mut self) {
        if self.shutdown_sender.is_some() || self.task.is_some() {
            log::debug!("{} dropped without explicit destroy, performing cleanup", self.handle);
            self.destroy();
        }
    }
}

struct RealmState {
    handle: AddressableHandle,
    instance: u64,
    registry: ModuleRegistry,
    /// Event name -> open. Written only by SetEventGate directives.
    gates: HashMap<String, bool>,
    upstream: mpsc::UnboundedSender<Upstream>,
}

impl RealmState {
    async fn run_message_loop(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<RealmRequest>,
        mut shutdown_receiver: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_receiver => {
                    log::debug!("{} received shutdown signal, stopping message loop", self.handle);
                    break;
                }
                request = receiver.recv() => {
                    match request {
                        Some(request) => {
                            log::trace!("{} handling request {}: {}", self.handle, request.id, request.body.label());
                            let id = request.id;
                            let result = self.handle_request(request.body).await;
                            if self.upstream.send(Upstream::Response { id, result }).is_err() {
                                log::debug!("{}: upstream closed, stopping message loop", self.handle);
                                break;
                            }
                        }
                        None => {
                            log::debug!("{} mailbox closed", self.handle);
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_request(&mut self, body: RealmRequestBody) -> Result<Value, DispatchError> {
        let RealmState {
            handle,
            registry,
            gates,
            upstream,
            ..
        } = self;

        match body {
            RealmRequestBody::Command {
                module_name,
                command_name,
                params,
            } => {
                let module = registry.get_mut(&module_name).ok_or_else(|| {
                    DispatchError::ModuleNotFound {
                        module: module_name.clone(),
                        destination: *handle,
                    }
                })?;

                let ctx = ModuleContext::new(*handle, Some(&*gates), &*upstream);
                module
                    .handle_command(&command_name, params, &ctx)
                    .await
                    .map_err(|e| DispatchError::from_module(&module_name, &command_name, e))
            }
            RealmRequestBody::SetEventGate {
                event_name,
                enabled,
            } => {
                let module_name = event_module_name(&event_name)
                    .ok_or_else(|| DispatchError::InvalidEventName(event_name.clone()))?;
                let module = registry.get_mut(module_name).ok_or_else(|| {
                    DispatchError::ModuleNotFound {
                        module: module_name.to_string(),
                        destination: *handle,
                    }
                })?;

                if enabled {
                    gates.insert(event_name.clone(), true);
                } else {
                    gates.remove(&event_name);
                }
                module.on_event_gate(&event_name, enabled);
                log::debug!(
                    "{}: gate for {} {}",
                    handle,
                    event_name,
                    if enabled { "enabled" } else { "disabled" }
                );
                Ok(Value::Bool(enabled))
            }
            RealmRequestBody::QueryEventGate { event_name } => Ok(Value::Bool(
                gates.get(&event_name).copied().unwrap_or(false),
            )),
        }
    }
}

impl Drop for RealmState {
    // Runs on normal exit, abort and module panic alike.
    fn drop(&mut self) {
        let _ = self.upstream.send(Upstream::RealmGone {
            instance: self.instance,
        });
    }
}
