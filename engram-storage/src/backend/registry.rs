//! Family adapter registry and key namespacing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use engram_core::StorageFamily;

use super::{BackendFamily, InMemoryBackend, InMemoryVectorBackend};

/// Isolation prefix applied to every backend key.
///
/// Several engines can share physical storage as long as their namespaces
/// differ: `scope("k")` becomes `"{namespace}:k"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self(namespace.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scope(&self, key: &str) -> String {
        format!("{}:{}", self.0, key)
    }

    /// Key prefix shared by every scoped key.
    pub fn prefix(&self) -> String {
        self.scope("")
    }

    /// Strip this namespace from a backend key. `None` for foreign keys.
    pub fn unscope<'a>(&self, scoped: &'a str) -> Option<&'a str> {
        scoped
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
    }
}

/// One adapter per storage family.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<StorageFamily, Arc<dyn BackendFamily>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-process adapters for every given family.
    pub fn in_memory(families: impl IntoIterator<Item = StorageFamily>) -> Self {
        let mut registry = Self::new();
        registry.fill_missing(families);
        registry
    }

    /// Register an adapter, replacing any previous one for its family.
    pub fn with_backend(mut self, backend: Arc<dyn BackendFamily>) -> Self {
        self.insert(backend);
        self
    }

    pub fn insert(&mut self, backend: Arc<dyn BackendFamily>) {
        self.backends.insert(backend.family(), backend);
    }

    /// Install in-process adapters for families that have none.
    pub fn fill_missing(&mut self, families: impl IntoIterator<Item = StorageFamily>) {
        for family in families {
            self.backends
                .entry(family)
                .or_insert_with(|| default_backend(family));
        }
    }

    /// Drop adapters whose family is not in `enabled`.
    pub fn retain(&mut self, enabled: &BTreeSet<StorageFamily>) {
        self.backends.retain(|family, _| enabled.contains(family));
    }

    pub fn get(&self, family: StorageFamily) -> Option<&Arc<dyn BackendFamily>> {
        self.backends.get(&family)
    }

    pub fn families(&self) -> impl Iterator<Item = StorageFamily> + '_ {
        self.backends.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StorageFamily, &Arc<dyn BackendFamily>)> {
        self.backends.iter().map(|(family, backend)| (*family, backend))
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("families", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn default_backend(family: StorageFamily) -> Arc<dyn BackendFamily> {
    match family {
        StorageFamily::Vector => Arc::new(InMemoryVectorBackend::default()),
        other => Arc::new(InMemoryBackend::new(other)),
    }
}
