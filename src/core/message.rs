//! Message types exchanged between the root and its realms.

use crate::core::handle::AddressableHandle;
use crate::error::DispatchError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command addressed to one module at one destination.
///
/// Accepted on the wire as
/// `{"moduleName", "commandName", "destination": {...}, "params"?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub module_name: String,
    pub command_name: String,
    pub destination: AddressableHandle,
    #[serde(default)]
    pub params: Value,
}

impl Command {
    pub fn new(
        module_name: impl Into<String>,
        command_name: impl Into<String>,
        destination: AddressableHandle,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            command_name: command_name.into(),
            destination,
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Whether an event goes through the subscription gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventCategory {
    /// Forwarded only while the origin realm's gate for the name is open.
    Gated,
    /// Diagnostics: always forwarded, never gated.
    Monitoring,
}

/// An event as seen by listeners on the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub name: String,
    pub origin: AddressableHandle,
    pub category: EventCategory,
    pub payload: Value,
}

/// Module part of an event name (`"eventemitter.testEvent"` -> `"eventemitter"`).
pub fn event_module_name(event_name: &str) -> Option<&str> {
    match event_name.split_once('.') {
        Some((module, event)) if !module.is_empty() && !event.is_empty() => Some(module),
        _ => None,
    }
}

/// Work item in a realm mailbox, correlated by `id`.
#[derive(Debug)]
pub(crate) struct RealmRequest {
    pub id: u64,
    pub body: RealmRequestBody,
}

#[derive(Debug)]
pub(crate) enum RealmRequestBody {
    Command {
        module_name: String,
        command_name: String,
        params: Value,
    },
    /// Enable/disable directive from the events dispatcher.
    SetEventGate { event_name: String, enabled: bool },
    QueryEventGate { event_name: String },
}

impl RealmRequestBody {
    pub fn label(&self) -> String {
        match self {
            RealmRequestBody::Command {
                module_name,
                command_name,
                ..
            } => format!("{}.{}", module_name, command_name),
            RealmRequestBody::SetEventGate {
                event_name,
                enabled,
            } => format!("setEventGate({}, {})", event_name, enabled),
            RealmRequestBody::QueryEventGate { event_name } => {
                format!("queryEventGate({})", event_name)
            }
        }
    }
}

/// Everything flowing upward from handlers to the root, on one channel.
#[derive(Debug)]
pub(crate) enum Upstream {
    Response {
        id: u64,
        result: Result<Value, DispatchError>,
    },
    Event(Event),
    /// A realm task ended; carries its instance number.
    RealmGone { instance: u64 },
}
