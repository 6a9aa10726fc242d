//! Driver registry.
//!
//! Drivers are looked up by the provider URL stored on a target. The
//! registry is built during startup and immutable afterwards, so lookups on
//! the dispatch path take no lock.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::ShoesProvider;

/// Errors from registry construction.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("driver already registered for {0}")]
    Duplicate(String),
}

/// Registry of provider drivers keyed on provider URL.
#[derive(Default)]
pub struct ProviderRegistry {
    drivers: HashMap<String, Arc<dyn ShoesProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under a provider URL.
    pub fn register(
        &mut self,
        provider_url: &str,
        driver: Arc<dyn ShoesProvider>,
    ) -> Result<(), RegistryError> {
        if self.drivers.contains_key(provider_url) {
            return Err(RegistryError::Duplicate(provider_url.to_string()));
        }
        self.drivers.insert(provider_url.to_string(), driver);
        Ok(())
    }

    /// Driver for a provider URL, if one is registered.
    pub fn get(&self, provider_url: &str) -> Option<Arc<dyn ShoesProvider>> {
        self.drivers.get(provider_url).cloned()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}
