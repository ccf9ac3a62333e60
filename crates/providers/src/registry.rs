//! Provider registry: one adapter instance per upstream kind, built once
//! at startup and shared by the pipeline and the REST surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use weft_domain::frame::ProviderKind;
use weft_domain::{Error, Result};

use crate::ollama::OllamaProvider;
use crate::openai::OpenAiProvider;
use crate::traits::ChatProvider;

pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn ChatProvider>>,
}

impl ProviderRegistry {
    /// An empty registry; adapters are added with [`ProviderRegistry::insert`].
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register (or replace) the adapter for a kind.
    pub fn insert(&mut self, kind: ProviderKind, provider: Arc<dyn ChatProvider>) {
        self.providers.insert(kind, provider);
    }

    /// Build adapters for every supported kind with the configured coarse
    /// request deadline.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let mut providers: HashMap<ProviderKind, Arc<dyn ChatProvider>> = HashMap::new();
        providers.insert(
            ProviderKind::Ollama,
            Arc::new(OllamaProvider::new(request_timeout)?),
        );
        providers.insert(
            ProviderKind::OpenAi,
            Arc::new(OpenAiProvider::new(request_timeout)?),
        );
        tracing::info!(providers = providers.len(), "provider registry ready");
        Ok(Self { providers })
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ChatProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no adapter for provider '{kind}'")))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_serves_both_kinds() {
        let registry = ProviderRegistry::new(Duration::from_secs(30)).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get(ProviderKind::Ollama).unwrap().kind(),
            ProviderKind::Ollama
        );
        assert_eq!(
            registry.get(ProviderKind::OpenAi).unwrap().kind(),
            ProviderKind::OpenAi
        );
    }
}
