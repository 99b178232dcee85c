//! Lookup from policy identifiers to backend loaders.

use dashmap::DashMap;
use ferrovox_kernel::BackendLoader;
use std::sync::Arc;
use tracing::debug;

/// Registry of loaders keyed by the identifier used in the policy document.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    loaders: Arc<DashMap<String, Arc<dyn BackendLoader>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loader under its own identifier. Replaces any previous one.
    pub fn register(&self, loader: Arc<dyn BackendLoader>) {
        let id = loader.identifier().to_string();
        debug!(identifier = %id, "backend loader registered");
        self.loaders.insert(id, loader);
    }

    pub fn with_loader(self, loader: Arc<dyn BackendLoader>) -> Self {
        self.register(loader);
        self
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<dyn BackendLoader>> {
        self.loaders.get(identifier).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.loaders.contains_key(identifier)
    }

    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.loaders.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackendLoader;

    #[test]
    fn test_register_and_lookup() {
        let registry = BackendRegistry::new()
            .with_loader(Arc::new(MockBackendLoader::new("large-v3")))
            .with_loader(Arc::new(MockBackendLoader::new("base")));

        assert!(registry.contains("base"));
        assert!(registry.get("medium").is_none());
        assert_eq!(registry.identifiers(), vec!["base", "large-v3"]);
        assert_eq!(registry.get("large-v3").unwrap().identifier(), "large-v3");
    }
}
