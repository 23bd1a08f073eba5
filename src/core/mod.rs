//! Core value types and the generic emitter.
//!
//! Nothing in here knows about realms or routing; the handler layer builds on
//! these pieces.

pub mod emitter;
pub mod handle;
pub mod message;

// Re-exports for convenience
pub use emitter::{Emitter, Listener};
pub use handle::{AddressableHandle, ContextDescriptor, ContextId, HandlerKind};
pub use message::{event_module_name, Command, Event, EventCategory};
