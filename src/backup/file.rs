// Filesystem backup provider - object keys map onto a directory tree
// Suits mounted volumes (NFS, SMB, FUSE-mounted buckets)

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use super::provider::{require_key, require_payload, CloudBackupProvider, ProviderError};

/// Distinguishes temp files of concurrent uploads to the same key
static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Backup provider storing each object as a file under a root directory
pub struct FileBackupProvider {
    root: PathBuf,
    name: String,
}

impl FileBackupProvider {
    /// Use `root` as the bucket. The directory must exist before
    /// [`health_check`](CloudBackupProvider::health_check) passes.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            name: "filesystem".to_string(),
        }
    }

    /// Directory acting as the bucket
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, ProviderError> {
        require_key(key)?;
        if key.starts_with('/') || key.ends_with('/') {
            return Err(ProviderError::InvalidInput(format!(
                "key '{}' must be relative and name an object",
                key
            )));
        }

        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return Err(ProviderError::InvalidInput(format!(
                    "key '{}' contains an invalid path segment",
                    key
                )));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn io_error(action: &str, key: &str, e: std::io::Error) -> ProviderError {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProviderError::NotFound(key.to_string())
        } else {
            ProviderError::Backend(anyhow::anyhow!("Failed to {} '{}': {}", action, key, e))
        }
    }

    /// Every object key under the root, using '/' separators
    async fn walk_keys(&self) -> Result<Vec<String>, ProviderError> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::io_error("read directory", &key_prefix, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::io_error("read directory entry", &key_prefix, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Self::io_error("stat", &name, e))?;

                let key = format!("{}{}", key_prefix, name);
                if file_type.is_dir() {
                    pending.push((entry.path(), format!("{}/", key)));
                } else if !name.ends_with(".tmp") {
                    keys.push(key);
                }
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl CloudBackupProvider for FileBackupProvider {
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), ProviderError> {
        require_payload(&data)?;
        let path = self.object_path(key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_error("create directory for", key, e))?;
        }

        let tmp_path = path.with_file_name(format!(
            "{}.{}.{}.tmp",
            path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            std::process::id(),
            UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp_path, &data)
            .await
            .map_err(|e| Self::io_error("write", key, e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| Self::io_error("commit", key, e))?;

        debug!(key = %key, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Bytes, ProviderError> {
        let path = self.object_path(key)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| Self::io_error("read", key, e))?;
        Ok(Bytes::from(data))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ProviderError> {
        let keys = self.walk_keys().await?;
        Ok(keys.into_iter().filter(|key| key.starts_with(prefix)).collect())
    }

    async fn delete(&self, key: &str) -> Result<(), ProviderError> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error("delete", key, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, ProviderError> {
        let path = self.object_path(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| Self::io_error("stat", key, e))
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ProviderError::Configuration(format!(
                "backup root {} is not a directory",
                self.root.display()
            ))),
            Err(e) => Err(ProviderError::Configuration(format!(
                "backup root {} is not accessible: {}",
                self.root.display(),
                e
            ))),
        }
    }
}
