//! Modules shipped with the crate.

pub mod event_emitter;

pub use event_emitter::{EventEmitterModule, EVENT_EMITTER_MODULE};

use crate::handler::module::ModuleCatalog;

/// Catalog hosting the diagnostic `eventemitter` module in every realm.
pub fn diagnostic_catalog() -> ModuleCatalog {
    ModuleCatalog::new().with_realm_module(EVENT_EMITTER_MODULE, EventEmitterModule::factory)
}
