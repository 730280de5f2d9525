use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::provider::{require_key, require_payload, CloudBackupProvider, ProviderError};

/// In-memory object store
#[derive(Clone)]
pub struct InMemoryBackupProvider {
    name: String,
    objects: Arc<DashMap<String, Bytes>>,
}

impl InMemoryBackupProvider {
    /// Empty store named `in-memory`
    pub fn new() -> Self {
        Self::with_name("in-memory")
    }

    /// Empty store reporting `name` as its provider name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Arc::new(DashMap::new()),
        }
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl Default for InMemoryBackupProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudBackupProvider for InMemoryBackupProvider {
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), ProviderError> {
        require_key(key)?;
        require_payload(&data)?;
        self.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Bytes, ProviderError> {
        require_key(key)?;
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ProviderError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), ProviderError> {
        require_key(key)?;
        self.objects.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ProviderError> {
        require_key(key)?;
        Ok(self.objects.contains_key(key))
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
