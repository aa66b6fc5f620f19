//! Process-wide registry of storage providers.
//!
//! The registry maps provider names to provider implementations and
//! records which providers are valid for each environment type. It is a
//! cheap cloneable handle over shared state; [`Registry::global`] returns
//! the process-wide instance, while tests construct their own so they can
//! run in parallel without cross-talk.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use thiserror::Error;

use super::StorageProvider;

/// Errors raised by registry lookups.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Raised when no provider is registered under the requested name.
    #[error("storage provider {0:?} not found")]
    ProviderNotFound(String),
}

#[derive(Default)]
struct Inner {
    providers: HashMap<String, Arc<dyn StorageProvider>>,
    environs: HashMap<String, Vec<String>>,
}

/// Handle to a set of registered storage providers.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide registry instance.
    #[must_use]
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Registers `provider` under `name`, replacing any previous
    /// registration. Passing `None` unregisters the name.
    pub fn register(&self, name: &str, provider: Option<Arc<dyn StorageProvider>>) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        match provider {
            Some(provider) => {
                inner.providers.insert(name.to_owned(), provider);
            }
            None => {
                inner.providers.remove(name);
            }
        }
    }

    /// Looks up the provider registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ProviderNotFound`] for unknown names.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn StorageProvider>, RegistryError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .providers
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::ProviderNotFound(name.to_owned()))
    }

    /// Declares the ordered provider list valid for an environment type.
    pub fn register_environ_providers(&self, environ_type: &str, providers: &[&str]) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let entry = inner
            .environs
            .entry(environ_type.to_owned())
            .or_default();
        for provider in providers {
            if !entry.iter().any(|existing| existing == provider) {
                entry.push((*provider).to_owned());
            }
        }
    }

    /// Returns the ordered provider list for an environment type.
    #[must_use]
    pub fn environ_providers(&self, environ_type: &str) -> Vec<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .environs
            .get(environ_type)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        EnvironConfig, FilesystemSource, PoolConfig, ProviderScope, SourceError, StorageKind,
        VolumeSource,
    };

    struct NullProvider;

    impl StorageProvider for NullProvider {
        fn is_dynamic(&self) -> bool {
            true
        }

        fn scope(&self) -> ProviderScope {
            ProviderScope::Environ
        }

        fn supports(&self, _kind: StorageKind) -> bool {
            true
        }

        fn volume_source(
            &self,
            _environ: &EnvironConfig,
            _pool: &PoolConfig,
        ) -> Result<Arc<dyn VolumeSource>, SourceError> {
            Err(SourceError::provider("no sources"))
        }

        fn filesystem_source(
            &self,
            _environ: &EnvironConfig,
            _pool: &PoolConfig,
        ) -> Result<Arc<dyn FilesystemSource>, SourceError> {
            Err(SourceError::provider("no sources"))
        }
    }

    #[test]
    fn lookup_of_unknown_provider_fails() {
        let registry = Registry::new();
        assert_eq!(
            registry.lookup("missing").err().map(|err| err.to_string()),
            Some(String::from(r#"storage provider "missing" not found"#))
        );
    }

    #[test]
    fn register_and_unregister_round_trip() {
        let registry = Registry::new();
        registry.register("null", Some(Arc::new(NullProvider)));
        assert!(registry.lookup("null").is_ok());
        registry.register("null", None);
        assert!(registry.lookup("null").is_err());
    }

    #[test]
    fn environ_provider_lists_are_ordered_and_deduplicated() {
        let registry = Registry::new();
        registry.register_environ_providers("testenv", &["loop", "rootfs"]);
        registry.register_environ_providers("testenv", &["rootfs", "tmpfs"]);
        assert_eq!(
            registry.environ_providers("testenv"),
            vec![
                String::from("loop"),
                String::from("rootfs"),
                String::from("tmpfs")
            ]
        );
    }
}
