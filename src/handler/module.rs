//! Module contract, per-handler module registry and module catalog.
//!
//! A module is a named unit of command/event logic. Each handler owns its own
//! `ModuleRegistry`, built from the session's `ModuleCatalog` when the handler
//! is created, so two realms never share module state.

use crate::core::handle::AddressableHandle;
use crate::core::message::{Event, EventCategory, Upstream};
use crate::error::ModuleError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Command and event logic hosted by a message handler.
#[async_trait]
pub trait Module: Send {
    /// Execute `command`. Return `ModuleError::UnknownCommand` for names this
    /// module does not implement.
    async fn handle_command(
        &mut self,
        command: &str,
        params: Value,
        ctx: &ModuleContext<'_>,
    ) -> Result<Value, ModuleError>;

    /// Called after the handler applied an enable/disable directive for one
    /// of this module's events.
    fn on_event_gate(&mut self, _event_name: &str, _enabled: bool) {}
}

/// What a module sees of its owning handler while executing a command.
pub struct ModuleContext<'a> {
    handle: AddressableHandle,
    gates: Option<&'a HashMap<String, bool>>,
    upstream: &'a mpsc::UnboundedSender<Upstream>,
}

impl<'a> ModuleContext<'a> {
    pub(crate) fn new(
        handle: AddressableHandle,
        gates: Option<&'a HashMap<String, bool>>,
        upstream: &'a mpsc::UnboundedSender<Upstream>,
    ) -> Self {
        Self {
            handle,
            gates,
            upstream,
        }
    }

    /// Address of the handler running this module.
    pub fn handle(&self) -> AddressableHandle {
        self.handle
    }

    /// Local gate flag for `event_name`. Handlers without gates (the root)
    /// report every event as enabled.
    pub fn is_event_enabled(&self, event_name: &str) -> bool {
        match self.gates {
            Some(gates) => gates.get(event_name).copied().unwrap_or(false),
            None => true,
        }
    }

    /// Emit a gated event. Returns false, without emitting, while the gate is
    /// closed.
    pub fn emit_event(&self, event_name: &str, payload: Value) -> bool {
        if !self.is_event_enabled(event_name) {
            log::trace!("{}: gate closed for {}, not emitting", self.handle, event_name);
            return false;
        }
        self.send(event_name, EventCategory::Gated, payload)
    }

    /// Emit a monitoring event. Never gated.
    pub fn emit_monitoring(&self, event_name: &str, payload: Value) -> bool {
        self.send(event_name, EventCategory::Monitoring, payload)
    }

    fn send(&self, event_name: &str, category: EventCategory, payload: Value) -> bool {
        let event = Event {
            name: event_name.to_string(),
            origin: self.handle,
            category,
            payload,
        };
        match self.upstream.send(Upstream::Event(event)) {
            Ok(()) => true,
            Err(_) => {
                log::debug!("{}: root is gone, dropping {}", self.handle, event_name);
                false
            }
        }
    }
}

/// Module name -> module instance, owned by one handler.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Box<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, module: Box<dyn Module>) {
        self.modules.insert(name.into(), module);
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn Module>> {
        self.modules.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Creates a fresh module instance for one handler.
pub trait ModuleFactory: Send + Sync {
    fn create_module(&self, handle: &AddressableHandle) -> Box<dyn Module>;
}

impl<F> ModuleFactory for F
where
    F: Fn(&AddressableHandle) -> Box<dyn Module> + Send + Sync,
{
    fn create_module(&self, handle: &AddressableHandle) -> Box<dyn Module> {
        self(handle)
    }
}

/// Which modules exist at the root and in every realm of a session.
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    root: BTreeMap<String, Arc<dyn ModuleFactory>>,
    realm: BTreeMap<String, Arc<dyn ModuleFactory>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root_module(
        mut self,
        name: impl Into<String>,
        factory: impl ModuleFactory + 'static,
    ) -> Self {
        self.root.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn with_realm_module(
        mut self,
        name: impl Into<String>,
        factory: impl ModuleFactory + 'static,
    ) -> Self {
        self.realm.insert(name.into(), Arc::new(factory));
        self
    }

    /// Instantiate the registry for a new handler at `handle`.
    pub fn build_registry(&self, handle: &AddressableHandle) -> ModuleRegistry {
        let factories = match handle {
            AddressableHandle::Root => &self.root,
            AddressableHandle::Realm { .. } => &self.realm,
        };
        let mut registry = ModuleRegistry::new();
        for (name, factory) in factories {
            registry.insert(name.clone(), factory.create_module(handle));
        }
        registry
    }
}
