//! Addressing types for message handlers.
//!
//! Every handler in a session is reachable through an [`AddressableHandle`].
//! Realms come and go as the host creates and destroys windows, so a handle is
//! a plain value: it never borrows the handler it names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of one realm (window, frame, worker...) in the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ContextId {
    fn from(id: u64) -> Self {
        ContextId(id)
    }
}

/// Kind of message handler a handle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandlerKind {
    Root,
    Realm,
}

/// Address of a message handler: the session root or one realm.
///
/// Serialized as `{"kind": "root"}` or `{"kind": "realm", "contextId": 7}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AddressableHandle {
    Root,
    Realm {
        #[serde(rename = "contextId")]
        context_id: ContextId,
    },
}

impl AddressableHandle {
    pub fn realm(context_id: u64) -> Self {
        AddressableHandle::Realm {
            context_id: context_id.into(),
        }
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            AddressableHandle::Root => HandlerKind::Root,
            AddressableHandle::Realm { .. } => HandlerKind::Realm,
        }
    }

    /// Context id of a realm handle, `None` for the root.
    pub fn context_id(&self) -> Option<ContextId> {
        match self {
            AddressableHandle::Root => None,
            AddressableHandle::Realm { context_id } => Some(*context_id),
        }
    }
}

impl fmt::Display for AddressableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressableHandle::Root => write!(f, "root"),
            AddressableHandle::Realm { context_id } => write!(f, "realm#{}", context_id),
        }
    }
}

/// Addressing metadata supplied with a subscription.
///
/// A descriptor only decides which realm receives the enable/disable
/// directive. It does not restrict which callbacks see an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextDescriptor {
    pub context_id: ContextId,
}

impl ContextDescriptor {
    pub fn new(context_id: u64) -> Self {
        Self {
            context_id: ContextId(context_id),
        }
    }

    /// The single destination this descriptor resolves to.
    pub fn destination(&self) -> AddressableHandle {
        AddressableHandle::Realm {
            context_id: self.context_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handle_wire_shape() {
        let realm = AddressableHandle::realm(7);
        assert_eq!(
            serde_json::to_value(realm).unwrap(),
            json!({"kind": "realm", "contextId": 7})
        );
        assert_eq!(
            serde_json::to_value(AddressableHandle::Root).unwrap(),
            json!({"kind": "root"})
        );
    }

    #[test]
    fn test_handle_accessors() {
        let realm = AddressableHandle::realm(3);
        assert_eq!(realm.kind(), HandlerKind::Realm);
        assert_eq!(realm.context_id(), Some(ContextId(3)));
        assert_eq!(realm.to_string(), "realm#3");

        assert_eq!(AddressableHandle::Root.kind(), HandlerKind::Root);
        assert_eq!(AddressableHandle::Root.context_id(), None);
    }

    #[test]
    fn test_descriptor_resolves_to_single_realm() {
        let descriptor = ContextDescriptor::new(42);
        assert_eq!(descriptor.destination(), AddressableHandle::realm(42));
    }
}
