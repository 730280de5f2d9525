// S3 Backup Provider
// Works against AWS S3 or an S3-compatible service (LocalStack, MinIO)

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::debug;

use super::provider::{require_key, require_payload, CloudBackupProvider, ProviderError};

/// S3 provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3ProviderConfig {
    /// Bucket holding the backups
    pub bucket_name: String,
    /// AWS region of the bucket
    pub region: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint_url: Option<String>,
    /// Address the bucket in the path instead of the host name
    pub force_path_style: bool,
}

impl Default for S3ProviderConfig {
    fn default() -> Self {
        Self {
            bucket_name: "agent-checkpoints".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl S3ProviderConfig {
    /// Read `S3_BUCKET_NAME`, `AWS_REGION`, `S3_ENDPOINT_URL` and
    /// `S3_FORCE_PATH_STYLE`, falling back to the defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bucket_name: env::var("S3_BUCKET_NAME").unwrap_or(defaults.bucket_name),
            region: env::var("AWS_REGION").unwrap_or(defaults.region),
            endpoint_url: env::var("S3_ENDPOINT_URL").ok(),
            force_path_style: env::var("S3_FORCE_PATH_STYLE").is_ok(),
        }
    }
}

/// S3-backed object store for checkpoint backups
pub struct S3BackupProvider {
    client: Client,
    config: S3ProviderConfig,
}

impl S3BackupProvider {
    /// Build a client from the default AWS credential chain
    pub async fn new(config: S3ProviderConfig) -> Result<Self, ProviderError> {
        if config.bucket_name.is_empty() {
            return Err(ProviderError::Configuration("bucket name not configured".to_string()));
        }
        if config.region.is_empty() {
            return Err(ProviderError::Configuration("region not configured".to_string()));
        }

        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        // Support for LocalStack/MinIO with custom endpoint
        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self { client, config })
    }

    /// Target bucket
    pub fn bucket_name(&self) -> &str {
        &self.config.bucket_name
    }
}

fn backend(action: &str, key: &str, e: impl std::fmt::Display) -> ProviderError {
    ProviderError::Backend(anyhow::anyhow!("Failed to {} '{}' in S3: {}", action, key, e))
}

#[async_trait]
impl CloudBackupProvider for S3BackupProvider {
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), ProviderError> {
        require_key(key)?;
        require_payload(&data)?;
        let size = data.len();

        self.client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| backend("upload", key, e))?;

        debug!(bucket = %self.config.bucket_name, key = %key, bytes = size, "Uploaded object to S3");
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Bytes, ProviderError> {
        require_key(key)?;

        let response = match self
            .client
            .get_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(ProviderError::NotFound(key.to_string()));
                }
                return Err(backend("download", key, service_error));
            }
        };

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| backend("read body of", key, e))?
            .into_bytes();

        Ok(body)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ProviderError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket_name)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| backend("list", prefix, e))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(|key| key.to_string())),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), ProviderError> {
        require_key(key)?;

        self.client
            .delete_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| backend("delete", key, e))?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ProviderError> {
        require_key(key)?;

        match self
            .client
            .head_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(backend("check existence of", key, service_error))
                }
            }
        }
    }

    fn provider_name(&self) -> &str {
        "AWS S3"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        // A listing under a prefix that never exists checks credentials,
        // bucket access and connectivity without touching any object
        self.client
            .list_objects_v2()
            .bucket(&self.config.bucket_name)
            .prefix("health-check-nonexistent-prefix")
            .max_keys(1)
            .send()
            .await
            .map_err(|e| backend("health check", &self.config.bucket_name, e))?;

        Ok(())
    }
}
