//! Root message handler
//!
//! The root is the session: it owns the router, the events dispatcher and the
//! emitter that delivers events to listeners. Everything realms send upward
//! arrives on one channel and is drained by the upstream pump task, which
//! resolves pending requests, delivers events and notices stopped realms in
//! the order the realms sent them.

use crate::config::SessionConfig;
use crate::core::emitter::{Emitter, Listener};
use crate::core::handle::{AddressableHandle, ContextId};
use crate::core::message::{Command, Event, EventCategory, Upstream};
use crate::error::DispatchError;
use crate::handler::events_dispatcher::EventsDispatcher;
use crate::handler::module::{ModuleCatalog, ModuleContext, ModuleRegistry};
use crate::handler::router::Router;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Create a session root with default configuration.
///
/// Must be called from within a tokio runtime.
pub fn create_root(session_id: impl Into<String>, catalog: ModuleCatalog) -> RootMessageHandler {
    RootMessageHandler::with_config(SessionConfig::new(session_id), catalog)
}

pub struct RootMessageHandler {
    config: SessionConfig,
    /// Modules hosted by the root itself
    modules: tokio::sync::Mutex<ModuleRegistry>,
    router: Arc<Router>,
    events_dispatcher: EventsDispatcher,
    emitter: Arc<Emitter<Event>>,
    upstream: mpsc::UnboundedSender<Upstream>,
    /// Channel for stopping the upstream pump
    shutdown_sender: Mutex<Option<oneshot::Sender<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl RootMessageHandler {
    /// Must be called from within a tokio runtime.
    pub fn with_config(config: SessionConfig, catalog: ModuleCatalog) -> Self {
        let (upstream, receiver) = mpsc::unbounded_channel();
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        let modules = catalog.build_registry(&AddressableHandle::Root);
        let router = Arc::new(Router::new(Arc::new(catalog), upstream.clone()));
        let emitter = Arc::new(Emitter::new());
        let events_dispatcher = EventsDispatcher::new(router.clone(), emitter.clone());

        let pump = tokio::spawn(Self::run_upstream_pump(
            receiver,
            router.clone(),
            emitter.clone(),
            shutdown_receiver,
        ));

        log::info!(
            "Session {} created (root modules: {:?})",
            config.session_id,
            modules.names()
        );

        Self {
            config,
            modules: tokio::sync::Mutex::new(modules),
            router,
            events_dispatcher,
            emitter,
            upstream,
            shutdown_sender: Mutex::new(Some(shutdown_sender)),
            pump: Mutex::new(Some(pump)),
            destroyed: AtomicBool::new(false),
        }
    }

    async fn run_upstream_pump(
        mut receiver: mpsc::UnboundedReceiver<Upstream>,
        router: Arc<Router>,
        emitter: Arc<Emitter<Event>>,
        mut shutdown_receiver: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_receiver => {
                    log::debug!("Upstream pump received shutdown signal");
                    break;
                }
                message = receiver.recv() => {
                    match message {
                        Some(Upstream::Response { id, result }) => router.resolve(id, result),
                        Some(Upstream::Event(event)) => {
                            let delivered = emitter.emit(&event.name, &event);
                            log::trace!("Event {} from {} delivered to {} listeners", event.name, event.origin, delivered);
                        }
                        Some(Upstream::RealmGone { instance }) => router.realm_gone(instance),
                        None => {
                            log::debug!("Upstream channel closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn events_dispatcher(&self) -> &EventsDispatcher {
        &self.events_dispatcher
    }

    /// Make a realm addressable. See `Router::attach_realm`.
    pub fn attach_realm(&self, context_id: ContextId) -> bool {
        self.router.attach_realm(context_id)
    }

    /// Tear a realm down. Its in-flight commands fail and its subscriptions
    /// are dropped, so a realm attached later under the same id starts with
    /// none.
    pub async fn detach_realm(&self, context_id: ContextId) -> bool {
        if !self.router.detach_realm(context_id) {
            return false;
        }
        self.events_dispatcher.forget_destination(context_id).await;
        true
    }

    /// Execute `command` at its destination, using the configured timeout if
    /// there is one.
    pub async fn handle_command(&self, command: Command) -> Result<Value, DispatchError> {
        match self.config.command_timeout() {
            Some(limit) => self.handle_command_timeout(command, limit).await,
            None => self.execute(command).await,
        }
    }

    /// Execute `command`, giving up after `limit`. The command keeps running
    /// in its realm; its eventual answer is discarded.
    pub async fn handle_command_timeout(
        &self,
        command: Command,
        limit: Duration,
    ) -> Result<Value, DispatchError> {
        let label = format!("{}.{} at {}", command.module_name, command.command_name, command.destination);
        match tokio::time::timeout(limit, self.execute(command)).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("{} timed out after {:?}", label, limit);
                Err(DispatchError::Timeout(limit))
            }
        }
    }

    async fn execute(&self, command: Command) -> Result<Value, DispatchError> {
        if self.is_destroyed() {
            return Err(DispatchError::unavailable(command.destination, "session destroyed"));
        }
        log::trace!(
            "Handling {}.{} for {}",
            command.module_name,
            command.command_name,
            command.destination
        );

        match command.destination {
            AddressableHandle::Root => self.execute_local(command).await,
            AddressableHandle::Realm { .. } => self.router.dispatch(command).await,
        }
    }

    async fn execute_local(&self, command: Command) -> Result<Value, DispatchError> {
        let Command {
            module_name,
            command_name,
            params,
            ..
        } = command;

        let mut modules = self.modules.lock().await;
        let module = modules
            .get_mut(&module_name)
            .ok_or_else(|| DispatchError::ModuleNotFound {
                module: module_name.clone(),
                destination: AddressableHandle::Root,
            })?;

        let ctx = ModuleContext::new(AddressableHandle::Root, None, &self.upstream);
        module
            .handle_command(&command_name, params, &ctx)
            .await
            .map_err(|e| DispatchError::from_module(&module_name, &command_name, e))
    }

    /// Register a listener for `event_name` directly on the root emitter.
    /// No realm is told to start emitting.
    pub fn on(&self, event_name: &str, listener: Listener<Event>) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.emitter.on(event_name, listener)
    }

    pub fn off(&self, event_name: &str, listener: &Listener<Event>) -> bool {
        self.emitter.off(event_name, listener)
    }

    /// Emit an event originating at the root. Delivered synchronously; returns
    /// the number of listeners reached.
    pub fn emit(&self, event_name: &str, payload: Value) -> usize {
        let event = Event {
            name: event_name.to_string(),
            origin: AddressableHandle::Root,
            category: EventCategory::Monitoring,
            payload,
        };
        self.emitter.emit(event_name, &event)
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        self.emitter.listener_count(event_name)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Tear the session down: outstanding commands fail, subscriptions are
    /// forgotten without directives, and no listener is called afterwards.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Destroying session {}", self.config.session_id);

        self.router.destroy();
        self.events_dispatcher.destroy().await;
        self.emitter.clear();
        self.stop_pump();
    }

    fn stop_pump(&self) {
        if let Some(shutdown_sender) = self
            .shutdown_sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = shutdown_sender.send(());
        }
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
    }
}

impl Drop for RootMessageHandler {
    fn drop(&mut self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            log::debug!(
                "Session {} dropped without explicit destroy, performing cleanup",
                self.config.session_id
            );
            self.router.destroy();
            self.emitter.clear();
            self.stop_pump();
        }
    }
}
