//! Provider adapter registry
//!
//! In-memory registry mapping provider identifiers to adapter instances.
//! Populated once at startup; read-mostly afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use crate::providers::ProviderAdapter;

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("provider '{name}' not found")]
    ProviderNotFound { name: String },
}

/// Registry of provider adapters keyed by identifier
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, identifier: &str, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(identifier.to_string(), adapter);
    }

    pub fn get(&self, identifier: &str) -> Result<Arc<dyn ProviderAdapter>, RegistryError> {
        self.adapters
            .get(identifier)
            .cloned()
            .ok_or_else(|| RegistryError::ProviderNotFound {
                name: identifier.to_string(),
            })
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.adapters.contains_key(identifier)
    }

    pub fn identifiers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}
