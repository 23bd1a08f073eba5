//! realm-bus - hierarchical command routing and context-scoped event
//! subscriptions between a root and isolated realms.

pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod modules;

// 公開API
pub use crate::config::SessionConfig;
pub use crate::core::{
    AddressableHandle, Command, ContextDescriptor, ContextId, Emitter, Event, EventCategory,
    HandlerKind, Listener,
};
pub use crate::error::{ConfigError, DispatchError, ModuleError};
pub use crate::handler::{
    create_root, EventsDispatcher, Module, ModuleCatalog, ModuleContext, ModuleFactory,
    RootMessageHandler,
};
