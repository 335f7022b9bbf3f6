//! The adapter registry (spec.md §4.2): a name-keyed mapping from backend-id
//! to adapter instance.
//!
//! Modeled after the `AdapterRegistry` pattern used for cross-agent hook
//! normalization elsewhere in the ecosystem, generalized from a fixed,
//! built-in `Vec` of adapters to an open, caller-populated map (this crate's
//! adapters are third-party-implementable, so the registry can't know them
//! in advance).

use std::collections::HashMap;

use crate::adapter::Adapter;
use crate::error::AgentRelayError;

/// Single-writer configuration store. Not `Sync`-guarded: callers are
/// expected to finish registering adapters before concurrent lookups begin
/// (spec.md §5).
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Box<dyn Adapter>>,
    order: Vec<String>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        AdapterRegistry {
            adapters: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register an adapter under its own `backend_id`. Fails if that name is
    /// already registered.
    pub fn register(&mut self, adapter: Box<dyn Adapter>) -> Result<(), AgentRelayError> {
        let name = adapter.backend_id().to_string();
        if self.adapters.contains_key(&name) {
            return Err(AgentRelayError::DuplicateAdapter(name));
        }
        self.order.push(name.clone());
        self.adapters.insert(name, adapter);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&dyn Adapter> {
        self.adapters.get(name).map(|b| b.as_ref())
    }

    /// Registered names, in insertion order.
    pub fn list(&self) -> &[String] {
        &self.order
    }

    /// Remove a registered adapter, returning whether one was present.
    pub fn unregister(&mut self, name: &str) -> bool {
        let removed = self.adapters.remove(name).is_some();
        if removed {
            self.order.retain(|n| n != name);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterOptions;
    use crate::adapter::AdapterItem;
    use futures::stream::{self, BoxStream};
    use futures::StreamExt;

    struct StubAdapter {
        id: &'static str,
        available: bool,
    }

    impl Adapter for StubAdapter {
        fn backend_id(&self) -> &str {
            self.id
        }

        fn available(&self) -> bool {
            self.available
        }

        fn run(&self, _prompt: String, _options: AdapterOptions) -> BoxStream<'static, AdapterItem> {
            stream::empty().boxed()
        }
    }

    #[test]
    fn register_then_lookup_succeeds() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Box::new(StubAdapter {
                id: "alpha",
                available: true,
            }))
            .unwrap();
        assert!(registry.lookup("alpha").is_some());
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Box::new(StubAdapter {
                id: "alpha",
                available: true,
            }))
            .unwrap();
        let err = registry
            .register(Box::new(StubAdapter {
                id: "alpha",
                available: true,
            }))
            .unwrap_err();
        assert!(matches!(err, AgentRelayError::DuplicateAdapter(name) if name == "alpha"));
    }

    #[test]
    fn list_preserves_insertion_order() {
        let mut registry = AdapterRegistry::new();
        for id in ["c", "a", "b"] {
            registry
                .register(Box::new(StubAdapter { id, available: true }))
                .unwrap();
        }
        assert_eq!(registry.list(), &["c".to_string(), "a".to_string(), "b".to_string()]);
    }

    #[test]
    fn unregister_removes_and_reports_presence() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Box::new(StubAdapter {
                id: "alpha",
                available: true,
            }))
            .unwrap();
        assert!(registry.unregister("alpha"));
        assert!(!registry.unregister("alpha"));
        assert!(registry.lookup("alpha").is_none());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn len_and_is_empty_track_contents() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.is_empty());
        registry
            .register(Box::new(StubAdapter {
                id: "alpha",
                available: true,
            }))
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }
}
