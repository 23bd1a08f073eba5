//! Message handlers and the machinery connecting them.

pub mod events_dispatcher;
pub mod module;
pub mod realm;
pub mod root;
pub mod router;

pub use events_dispatcher::EventsDispatcher;
pub use module::{Module, ModuleCatalog, ModuleContext, ModuleFactory, ModuleRegistry};
pub use realm::RealmMessageHandler;
pub use root::{create_root, RootMessageHandler};
pub use router::Router;
