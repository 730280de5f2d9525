// Cloud Backup Manager - key derivation, backup/restore, retention and sync
// on top of a single CloudBackupProvider

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument};

use super::provider::{CloudBackupProvider, ProviderError};
use crate::checkpoint::{validate_agent_id, Checkpoint};
use crate::{CheckpointError, Result};

/// Downloads in flight while listing an agent's backups
const LIST_CONCURRENCY: usize = 8;

/// How [`CloudBackupManager::sync_checkpoints`] treats checkpoints that are
/// already backed up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Upload every checkpoint, replacing existing objects
    #[default]
    Overwrite,
    /// Upload only checkpoints whose key does not exist yet. Mutations made
    /// locally after the first backup are not pushed.
    SkipExisting,
}

/// Backup statistics for one agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupStats {
    /// Backups that could be downloaded
    pub total_backups: usize,
    /// Sum of object sizes in bytes
    pub total_size: u64,
    /// Checkpoint ID with the smallest timestamp
    pub oldest_backup: Option<String>,
    /// Checkpoint ID with the largest timestamp
    pub newest_backup: Option<String>,
}

/// Backs up checkpoints into one provider under a key prefix.
///
/// Keys are `<prefix><agent_id>/<checkpoint_id>.json`. Operations are not
/// coordinated with each other: a cleanup running alongside a backup for the
/// same agent may delete the new object.
pub struct CloudBackupManager {
    provider: Arc<dyn CloudBackupProvider>,
    prefix: String,
    sync_mode: SyncMode,
}

impl CloudBackupManager {
    /// Wrap `provider`. The prefix is normalized to end in exactly one `/`;
    /// an empty prefix roots keys at the bucket root.
    pub fn new(provider: Arc<dyn CloudBackupProvider>, prefix: impl AsRef<str>) -> Self {
        Self {
            provider,
            prefix: normalize_prefix(prefix.as_ref()),
            sync_mode: SyncMode::default(),
        }
    }

    /// Choose how [`sync_checkpoints`](Self::sync_checkpoints) treats existing backups
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Normalized key prefix, empty or ending in `/`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Current sync mode
    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// Display name of the wrapped provider
    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    /// Object key for a checkpoint
    pub fn checkpoint_key(&self, agent_id: &str, checkpoint_id: &str) -> String {
        format!("{}{}/{}.json", self.prefix, agent_id, checkpoint_id)
    }

    fn agent_prefix(&self, agent_id: &str) -> String {
        format!("{}{}/", self.prefix, agent_id)
    }

    fn provider_error(&self, operation: &'static str, key: &str, source: ProviderError) -> CheckpointError {
        match source {
            ProviderError::NotFound(_) => {
                CheckpointError::NotFound(format!("backup object not found: {}", key))
            }
            ProviderError::InvalidInput(message) => CheckpointError::InvalidInput(message),
            source => CheckpointError::Provider {
                provider: self.provider.provider_name().to_string(),
                operation,
                key: key.to_string(),
                source,
            },
        }
    }

    /// Serialize a checkpoint and upload it to its derived key
    #[instrument(skip(self, checkpoint), fields(checkpoint_id = %checkpoint.id, agent_id = %checkpoint.agent_id))]
    pub async fn backup_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        validate_agent_id(&checkpoint.agent_id)?;
        let key = self.checkpoint_key(&checkpoint.agent_id, &checkpoint.id);
        let data = checkpoint.to_json()?;
        let size = data.len();

        self.provider
            .upload(&key, Bytes::from(data))
            .await
            .map_err(|e| self.provider_error("upload", &key, e))?;

        info!(
            key = %key,
            size_bytes = size,
            provider = %self.provider.provider_name(),
            "Checkpoint backed up"
        );
        Ok(())
    }

    /// Download and decode one backed-up checkpoint
    #[instrument(skip(self))]
    pub async fn restore_checkpoint(&self, checkpoint_id: &str, agent_id: &str) -> Result<Checkpoint> {
        validate_agent_id(agent_id)?;
        let key = self.checkpoint_key(agent_id, checkpoint_id);
        self.fetch(&key).await
    }

    async fn fetch(&self, key: &str) -> Result<Checkpoint> {
        let data = self
            .provider
            .download(key)
            .await
            .map_err(|e| self.provider_error("download", key, e))?;
        Checkpoint::from_json(&data)
    }

    /// Keys of an agent's backups; objects that do not follow the key layout
    /// are ignored
    async fn agent_keys(&self, agent_id: &str) -> Result<Vec<String>> {
        validate_agent_id(agent_id)?;
        let prefix = self.agent_prefix(agent_id);
        let keys = self
            .provider
            .list(&prefix)
            .await
            .map_err(|e| self.provider_error("list", &prefix, e))?;

        Ok(keys
            .into_iter()
            .filter(|key| {
                key.strip_prefix(&prefix)
                    .and_then(|name| name.strip_suffix(".json"))
                    .map_or(false, |id| !id.is_empty() && !id.contains('/'))
            })
            .collect())
    }

    /// Download a listed key. `None` when the object was deleted after it
    /// was listed.
    async fn fetch_listed(&self, key: &str) -> Result<Option<Bytes>> {
        match self.provider.download(key).await {
            Ok(data) => Ok(Some(data)),
            Err(ProviderError::NotFound(_)) => {
                debug!(key = %key, "Listed backup vanished before download");
                Ok(None)
            }
            Err(e) => Err(self.provider_error("download", key, e)),
        }
    }

    async fn fetch_all(&self, keys: Vec<String>) -> Result<Vec<Checkpoint>> {
        let fetched: Vec<Option<Checkpoint>> = stream::iter(keys)
            .map(|key| async move {
                match self.fetch_listed(&key).await? {
                    Some(data) => Checkpoint::from_json(&data).map(Some),
                    None => Ok(None),
                }
            })
            .buffered(LIST_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(fetched.into_iter().flatten().collect())
    }

    /// Every backed-up checkpoint of one agent, in provider order. Objects
    /// deleted between listing and download are skipped; any other download
    /// or decode failure fails the call.
    #[instrument(skip(self))]
    pub async fn list_checkpoints(&self, agent_id: &str) -> Result<Vec<Checkpoint>> {
        let keys = self.agent_keys(agent_id).await?;
        self.fetch_all(keys).await
    }

    /// Every backed-up checkpoint under the prefix, across all agents
    #[instrument(skip(self))]
    pub async fn list_all_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let keys = self
            .provider
            .list(&self.prefix)
            .await
            .map_err(|e| self.provider_error("list", &self.prefix, e))?;

        let keys = keys
            .into_iter()
            .filter(|key| {
                key.strip_prefix(self.prefix.as_str())
                    .and_then(|rest| rest.strip_suffix(".json"))
                    .and_then(|rest| rest.split_once('/'))
                    .map_or(false, |(agent, id)| {
                        !agent.is_empty() && !id.is_empty() && !id.contains('/')
                    })
            })
            .collect();

        self.fetch_all(keys).await
    }

    /// Delete one backup. Deleting an absent backup succeeds.
    #[instrument(skip(self))]
    pub async fn delete_checkpoint(&self, checkpoint_id: &str, agent_id: &str) -> Result<()> {
        validate_agent_id(agent_id)?;
        let key = self.checkpoint_key(agent_id, checkpoint_id);
        self.provider
            .delete(&key)
            .await
            .map_err(|e| self.provider_error("delete", &key, e))?;

        info!(key = %key, "Backup deleted");
        Ok(())
    }

    /// Whether a backup exists for the checkpoint
    pub async fn exists(&self, checkpoint_id: &str, agent_id: &str) -> Result<bool> {
        validate_agent_id(agent_id)?;
        let key = self.checkpoint_key(agent_id, checkpoint_id);
        self.provider
            .exists(&key)
            .await
            .map_err(|e| self.provider_error("exists", &key, e))
    }

    /// Keep the `max_backups` newest backups of an agent and delete the rest.
    /// Stops at the first failed delete. Returns the number deleted.
    #[instrument(skip(self))]
    pub async fn cleanup_old_backups(&self, agent_id: &str, max_backups: usize) -> Result<usize> {
        let mut backups = self.list_checkpoints(agent_id).await?;
        if backups.len() <= max_backups {
            debug!(agent_id = %agent_id, backups = backups.len(), "No backups to clean up");
            return Ok(0);
        }

        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));

        let mut deleted = 0;
        for stale in &backups[max_backups..] {
            self.delete_checkpoint(&stale.id, agent_id).await?;
            deleted += 1;
        }

        info!(
            agent_id = %agent_id,
            deleted = deleted,
            retained = max_backups,
            "Cleaned up old backups"
        );
        Ok(deleted)
    }

    /// Push checkpoints of one agent to the provider according to the sync
    /// mode. Every checkpoint must belong to `agent_id`; the batch is checked
    /// before anything is uploaded. Stops at the first failure. Returns the
    /// number uploaded.
    #[instrument(skip(self, checkpoints), fields(count = checkpoints.len()))]
    pub async fn sync_checkpoints(&self, agent_id: &str, checkpoints: &[Checkpoint]) -> Result<usize> {
        validate_agent_id(agent_id)?;
        if let Some(foreign) = checkpoints.iter().find(|c| c.agent_id != agent_id) {
            return Err(CheckpointError::InvalidInput(format!(
                "checkpoint {} belongs to agent {}, not {}",
                foreign.id, foreign.agent_id, agent_id
            )));
        }

        let mut uploaded = 0;
        for checkpoint in checkpoints {
            if self.sync_mode == SyncMode::SkipExisting
                && self.exists(&checkpoint.id, agent_id).await?
            {
                continue;
            }
            self.backup_checkpoint(checkpoint).await?;
            uploaded += 1;
        }

        info!(
            agent_id = %agent_id,
            uploaded = uploaded,
            skipped = checkpoints.len() - uploaded,
            "Checkpoints synced"
        );
        Ok(uploaded)
    }

    /// Count and size an agent's backups. Each object is downloaded once;
    /// objects that vanish after listing are not counted.
    #[instrument(skip(self))]
    pub async fn get_backup_stats(&self, agent_id: &str) -> Result<BackupStats> {
        let keys = self.agent_keys(agent_id).await?;
        let mut stats = BackupStats::default();

        let mut oldest: Option<Checkpoint> = None;
        let mut newest: Option<Checkpoint> = None;

        for key in &keys {
            let Some(data) = self.fetch_listed(key).await? else {
                continue;
            };
            stats.total_backups += 1;
            stats.total_size += data.len() as u64;

            let checkpoint = Checkpoint::from_json(&data)?;
            if oldest.as_ref().map_or(true, |o| checkpoint.timestamp < o.timestamp) {
                oldest = Some(checkpoint.clone());
            }
            if newest.as_ref().map_or(true, |n| checkpoint.timestamp > n.timestamp) {
                newest = Some(checkpoint);
            }
        }

        stats.oldest_backup = oldest.map(|c| c.id);
        stats.newest_backup = newest.map(|c| c.id);
        Ok(stats)
    }

    /// Delegate to the provider's health check
    pub async fn health_check(&self) -> Result<()> {
        self.provider
            .health_check()
            .await
            .map_err(|e| self.provider_error("health check", &self.prefix, e))
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}
