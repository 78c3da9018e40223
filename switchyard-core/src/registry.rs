//! Model registry: the catalog of known models keyed by composite identifier.
//!
//! Holds the curated built-in catalog plus whatever adapters report on each
//! status refresh. Registration overwrites in place; no history is kept.

use crate::error::RegistryError;
use crate::providers::{cloud, embedded};
use crate::types::{BackendKind, Capability, ModelDescriptor, ModelId};
use std::collections::HashMap;
use std::sync::RwLock;

/// Criteria for [`ModelRegistry::list`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    pub capability: Option<Capability>,
    pub backend: Option<BackendKind>,
    pub installed_only: bool,
}

impl ModelFilter {
    pub fn capability(capability: Capability) -> Self {
        Self {
            capability: Some(capability),
            ..Default::default()
        }
    }

    pub fn backend(backend: BackendKind) -> Self {
        Self {
            backend: Some(backend),
            ..Default::default()
        }
    }

    pub fn installed(mut self) -> Self {
        self.installed_only = true;
        self
    }

    pub fn matches(&self, descriptor: &ModelDescriptor) -> bool {
        self.capability.is_none_or(|c| descriptor.supports(c))
            && self.backend.is_none_or(|b| descriptor.backend() == b)
            && (!self.installed_only || descriptor.installed)
    }
}

/// Thread-safe model catalog.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<ModelId, ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the curated embedded and cloud catalogs.
    pub fn with_builtin_catalog() -> Self {
        let registry = Self::new();
        let builtin = embedded::curated_catalog()
            .iter()
            .map(|entry| entry.descriptor())
            .chain(cloud::known_models());
        for descriptor in builtin {
            // Catalog entries always declare capabilities.
            let _ = registry.register(descriptor);
        }
        registry
    }

    /// Add or replace a descriptor.
    pub fn register(&self, descriptor: ModelDescriptor) -> Result<(), RegistryError> {
        if descriptor.capabilities.is_empty() {
            return Err(RegistryError::EmptyCapabilities { id: descriptor.id });
        }
        let mut models = self.models.write().unwrap_or_else(|e| e.into_inner());
        tracing::trace!(model = %descriptor.id, "Registered model");
        models.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Register every descriptor, skipping (and logging) invalid ones.
    pub fn register_all(&self, descriptors: impl IntoIterator<Item = ModelDescriptor>) -> usize {
        let mut count = 0;
        for descriptor in descriptors {
            match self.register(descriptor) {
                Ok(()) => count += 1,
                Err(e) => tracing::warn!(error = %e, "Skipping invalid model descriptor"),
            }
        }
        count
    }

    /// Replace what a reachable backend reports as installed.
    ///
    /// Entries of `backend` missing from `reported` stay listed but are marked
    /// not installed, so catalog models fall back to their downloadable form.
    pub fn sync_backend(&self, backend: BackendKind, reported: &[ModelDescriptor]) -> usize {
        {
            let mut models = self.models.write().unwrap_or_else(|e| e.into_inner());
            for descriptor in models.values_mut() {
                if descriptor.backend() == backend
                    && descriptor.installed
                    && !reported.iter().any(|r| r.id == descriptor.id)
                {
                    tracing::debug!(model = %descriptor.id, "Model no longer installed");
                    descriptor.installed = false;
                }
            }
        }
        self.register_all(reported.iter().cloned())
    }

    /// Descriptors matching `filter`, sorted by backend priority then name.
    pub fn list(&self, filter: &ModelFilter) -> Vec<ModelDescriptor> {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ModelDescriptor> = models
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn find(&self, id: &ModelId) -> Result<ModelDescriptor, RegistryError> {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        models.get(id).cloned().ok_or_else(|| RegistryError::NotFound {
            id: id.to_string(),
        })
    }

    pub fn remove(&self, id: &ModelId) -> Result<ModelDescriptor, RegistryError> {
        let mut models = self.models.write().unwrap_or_else(|e| e.into_inner());
        models.remove(id).ok_or_else(|| RegistryError::NotFound {
            id: id.to_string(),
        })
    }

    /// Resolve a user-supplied model reference.
    ///
    /// A composite `<backend>/<name>` id is returned as-is when registered. A
    /// bare name is matched against every backend in priority order,
    /// preferring installed copies.
    pub fn resolve(&self, reference: &str) -> Result<ModelDescriptor, RegistryError> {
        if let Ok(id) = reference.parse::<ModelId>() {
            if let Ok(found) = self.find(&id) {
                return Ok(found);
            }
        }
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        let mut candidates: Vec<&ModelDescriptor> =
            models.values().filter(|d| d.id.name == reference).collect();
        candidates.sort_by_key(|d| (!d.installed, d.backend().cost_rank()));
        candidates
            .first()
            .map(|d| (*d).clone())
            .ok_or_else(|| RegistryError::NotFound {
                id: reference.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.models.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_model(backend: BackendKind, name: &str) -> ModelDescriptor {
        ModelDescriptor::new(ModelId::new(backend, name), name, [Capability::Chat])
    }

    #[test]
    fn test_register_and_find() {
        let registry = ModelRegistry::new();
        let desc = chat_model(BackendKind::LocalDaemon, "llama3.2:3b");
        registry.register(desc.clone()).unwrap();
        assert_eq!(registry.find(&desc.id).unwrap(), desc);
    }

    #[test]
    fn test_register_rejects_empty_capabilities() {
        let registry = ModelRegistry::new();
        let desc = ModelDescriptor::new(
            ModelId::new(BackendKind::Cloud, "mystery"),
            "Mystery",
            std::iter::empty(),
        );
        let err = registry.register(desc).unwrap_err();
        assert!(matches!(err, RegistryError::EmptyCapabilities { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregistration_overwrites_in_place() {
        let registry = ModelRegistry::new();
        let desc = chat_model(BackendKind::LocalDaemon, "qwen2.5:7b");
        registry.register(desc.clone()).unwrap();
        registry.register(desc.clone().installed(true)).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.find(&desc.id).unwrap().installed);
    }

    #[test]
    fn test_find_missing() {
        let registry = ModelRegistry::new();
        let err = registry
            .find(&ModelId::new(BackendKind::Cloud, "nope"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Model not found: cloud/nope");
    }

    #[test]
    fn test_list_filters() {
        let registry = ModelRegistry::new();
        registry
            .register(chat_model(BackendKind::LocalDaemon, "a").installed(true))
            .unwrap();
        registry
            .register(chat_model(BackendKind::Cloud, "b"))
            .unwrap();
        registry
            .register(ModelDescriptor::new(
                ModelId::new(BackendKind::Cloud, "text-embedding-3-small"),
                "Embeddings",
                [Capability::Embed],
            ))
            .unwrap();

        assert_eq!(registry.list(&ModelFilter::default()).len(), 3);
        assert_eq!(registry.list(&ModelFilter::capability(Capability::Chat)).len(), 2);
        assert_eq!(registry.list(&ModelFilter::backend(BackendKind::Cloud)).len(), 2);
        let installed = registry.list(&ModelFilter::default().installed());
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].id.name, "a");
    }

    #[test]
    fn test_resolve_bare_name_prefers_installed_then_priority() {
        let registry = ModelRegistry::new();
        registry
            .register(chat_model(BackendKind::Cloud, "shared").installed(true))
            .unwrap();
        registry
            .register(chat_model(BackendKind::LocalDaemon, "shared"))
            .unwrap();
        assert_eq!(
            registry.resolve("shared").unwrap().backend(),
            BackendKind::Cloud
        );

        registry
            .register(chat_model(BackendKind::EmbeddedRuntime, "shared").installed(true))
            .unwrap();
        assert_eq!(
            registry.resolve("shared").unwrap().backend(),
            BackendKind::EmbeddedRuntime
        );
        assert!(registry.resolve("absent").is_err());
    }

    #[test]
    fn test_sync_backend_clears_models_the_backend_dropped() {
        let registry = ModelRegistry::with_builtin_catalog();
        let catalog = registry
            .list(&ModelFilter::backend(BackendKind::EmbeddedRuntime))
            .remove(0);
        let local = chat_model(BackendKind::EmbeddedRuntime, "my-model").installed(true);
        let daemon = chat_model(BackendKind::LocalDaemon, "qwen").installed(true);
        registry.register(daemon.clone()).unwrap();
        registry.sync_backend(
            BackendKind::EmbeddedRuntime,
            &[catalog.clone().installed(true), local.clone()],
        );
        assert!(registry.find(&catalog.id).unwrap().installed);

        registry.sync_backend(BackendKind::EmbeddedRuntime, &[]);
        assert!(!registry.find(&catalog.id).unwrap().installed);
        assert!(!registry.find(&local.id).unwrap().installed);
        // Other backends are untouched.
        assert!(registry.find(&daemon.id).unwrap().installed);
    }

    #[test]
    fn test_remove() {
        let registry = ModelRegistry::new();
        let desc = chat_model(BackendKind::LocalDaemon, "custom");
        registry.register(desc.clone()).unwrap();
        registry.remove(&desc.id).unwrap();
        assert!(registry.remove(&desc.id).is_err());
    }

    #[test]
    fn test_builtin_catalog_is_populated() {
        let registry = ModelRegistry::with_builtin_catalog();
        assert!(!registry.list(&ModelFilter::backend(BackendKind::EmbeddedRuntime)).is_empty());
        assert!(!registry.list(&ModelFilter::capability(Capability::AudioTranscribe)).is_empty());
    }
}
