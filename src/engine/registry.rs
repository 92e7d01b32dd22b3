// SPDX-License-Identifier: Apache-2.0

//! Adapter Registry
//!
//! Static registration table for datasource adapters, keyed by datasource id.
//! Populated once at process start; no runtime discovery or reflection.
//! Registration is idempotent per id: the last registration for an id wins.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::traits::DatasourceAdapter;
use crate::engine::types::AdapterProfile;

struct Entry {
    profile: AdapterProfile,
    adapter: Arc<dyn DatasourceAdapter>,
}

/// Registry that holds all registered datasource adapters
pub struct AdapterRegistry {
    entries: HashMap<String, Entry>,
}

impl AdapterRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers an adapter under its profile id. Re-registering an id
    /// replaces the previous entry.
    pub fn register(&mut self, profile: AdapterProfile, adapter: Arc<dyn DatasourceAdapter>) {
        self.entries
            .insert(profile.id.clone(), Entry { profile, adapter });
    }

    /// Gets an adapter by datasource id
    pub fn get(&self, datasource_id: &str) -> Option<Arc<dyn DatasourceAdapter>> {
        self.entries.get(datasource_id).map(|e| e.adapter.clone())
    }

    /// Gets the registration profile for a datasource id
    pub fn get_profile(&self, datasource_id: &str) -> Option<&AdapterProfile> {
        self.entries.get(datasource_id).map(|e| &e.profile)
    }

    /// Lists all registered datasource ids, sorted for stable output
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the number of registered adapters
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no adapters are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
