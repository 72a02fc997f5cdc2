//! Runtime backend registry with priority-ordered selection.
//!
//! Backends register either explicitly on an instance, or process-wide by placing a
//! registrar in [`BACKEND_REGISTRARS`] from their own crate. The global registry runs all
//! registrars exactly once, the first time it is accessed.

use std::sync::{Arc, OnceLock, RwLock};

use super::{Backend, BackendId};
use crate::error::{Error, Result};

/// Registrars contributed by backend crates at link time.
#[linkme::distributed_slice]
pub static BACKEND_REGISTRARS: [fn(&BackendRegistry)] = [..];

/// Priority-ordered collection of backends.
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<Vec<Arc<dyn Backend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry populated from [`BACKEND_REGISTRARS`].
    pub fn global() -> &'static BackendRegistry {
        static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();
        GLOBAL_REGISTRY.get_or_init(|| {
            let registry = BackendRegistry::new();
            for registrar in BACKEND_REGISTRARS.iter() {
                registrar(&registry);
            }
            registry
        })
    }

    /// Adds a backend, replacing any previous one with the same id.
    ///
    /// Backends are kept sorted by descending priority; equal priorities keep
    /// registration order.
    pub fn register(&self, backend: Arc<dyn Backend>) {
        let mut backends = self.backends.write().expect("backend registry poisoned");
        let id = backend.id();
        backends.retain(|existing| existing.id() != id);
        let priority = backend.capabilities().priority;
        let position = backends
            .iter()
            .position(|existing| existing.capabilities().priority < priority)
            .unwrap_or(backends.len());
        tracing::debug!(backend = %id, priority, "registering backend");
        backends.insert(position, backend);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Backend>> {
        self.backends
            .read()
            .expect("backend registry poisoned")
            .iter()
            .find(|backend| backend.id().as_str() == id)
            .cloned()
    }

    pub fn has_backend(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// All backends in priority order.
    pub fn backends(&self) -> Vec<Arc<dyn Backend>> {
        self.backends
            .read()
            .expect("backend registry poisoned")
            .clone()
    }

    pub fn list_backends(&self) -> Vec<BackendId> {
        self.backends().iter().map(|backend| backend.id()).collect()
    }

    /// Backends to consider for assignment.
    ///
    /// An empty preference list means every backend in priority order; otherwise exactly
    /// the named backends in the given order. Unknown names are a configuration error.
    pub fn ordered(&self, preferences: &[String]) -> Result<Vec<Arc<dyn Backend>>> {
        if preferences.is_empty() {
            return Ok(self.backends());
        }
        preferences
            .iter()
            .map(|name| {
                self.get(name).ok_or_else(|| {
                    Error::Config(format!(
                        "preferred backend {name} is not registered (available: {})",
                        self.list_backends()
                            .iter()
                            .map(|id| id.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ))
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.list_backends())
            .finish()
    }
}
