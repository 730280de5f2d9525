// Cloud backup provider contract - one trait, independent vendor adapters

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors reported by a provider adapter
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The key does not exist in the store
    #[error("object not found: {0}")]
    NotFound(String),

    /// Empty key, empty payload or a key the backend cannot address
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing bucket, container, region or credentials
    #[error("provider not configured: {0}")]
    Configuration(String),

    /// Opaque failure from the vendor SDK or the backing store
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Object storage capability used by [`CloudBackupManager`].
///
/// Implementations are thin translators onto a vendor API. They must not
/// retry; cancellation is the caller dropping the returned future.
///
/// [`CloudBackupManager`]: super::CloudBackupManager
#[async_trait]
pub trait CloudBackupProvider: Send + Sync {
    /// Store `data` at `key`, replacing any existing object
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), ProviderError>;

    /// Fetch the object at `key`; [`ProviderError::NotFound`] when absent
    async fn download(&self, key: &str) -> Result<Bytes, ProviderError>;

    /// Keys starting with `prefix`, in no particular order
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ProviderError>;

    /// Remove the object at `key`. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), ProviderError>;

    /// Whether an object is stored at `key`
    async fn exists(&self, key: &str) -> Result<bool, ProviderError>;

    /// Human-readable backend name, used in logs and errors
    fn provider_name(&self) -> &str;

    /// Validate configuration and connectivity without mutating remote state
    async fn health_check(&self) -> Result<(), ProviderError>;
}

pub(crate) fn require_key(key: &str) -> Result<(), ProviderError> {
    if key.is_empty() {
        return Err(ProviderError::InvalidInput("key is required".to_string()));
    }
    Ok(())
}

pub(crate) fn require_payload(data: &[u8]) -> Result<(), ProviderError> {
    if data.is_empty() {
        return Err(ProviderError::InvalidInput("data cannot be empty".to_string()));
    }
    Ok(())
}
