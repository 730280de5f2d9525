// Integration tests for CloudBackupManager over the bundled providers
// plus a flaky provider for failure paths

use agent_checkpoint::backup::{
    BackupStats, CloudBackupManager, CloudBackupProvider, FileBackupProvider,
    InMemoryBackupProvider, ProviderError, SyncMode,
};
use agent_checkpoint::checkpoint::{
    AgentProgress, Checkpoint, CheckpointConfig, CheckpointManager, MemoryState, OpenFile,
};
use agent_checkpoint::CheckpointError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn checkpoint(agent_id: &str, n: i64) -> Checkpoint {
    let mut checkpoint = Checkpoint::with_id(
        format!("chk_{}_{}", agent_id, n),
        agent_id,
        base_time() + Duration::seconds(n),
    );
    checkpoint.progress = AgentProgress::running(10).with_task("task", "Backup test");
    checkpoint
        .memory_state
        .working_memory
        .insert("n".to_string(), json!(n));
    checkpoint
}

fn ids(checkpoints: &[Checkpoint]) -> HashSet<String> {
    checkpoints.iter().map(|c| c.id.clone()).collect()
}

/// Wraps the in-memory store and fails selected operations on demand
#[derive(Default)]
struct FlakyProvider {
    inner: InMemoryBackupProvider,
    uploads: AtomicUsize,
    deletes: AtomicUsize,
    fail_uploads_after: Option<usize>,
    fail_deletes: AtomicBool,
    unhealthy: bool,
    /// Keys reported by `list` that no longer exist
    stale_keys: Vec<String>,
}

#[async_trait]
impl CloudBackupProvider for FlakyProvider {
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), ProviderError> {
        let attempt = self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.fail_uploads_after.map_or(false, |limit| attempt >= limit) {
            return Err(ProviderError::Backend(anyhow::anyhow!("quota exceeded")));
        }
        self.inner.upload(key, data).await
    }

    async fn download(&self, key: &str) -> Result<Bytes, ProviderError> {
        self.inner.download(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ProviderError> {
        let mut keys = self.inner.list(prefix).await?;
        keys.extend(self.stale_keys.iter().filter(|k| k.starts_with(prefix)).cloned());
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), ProviderError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ProviderError::Backend(anyhow::anyhow!("access denied")));
        }
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, ProviderError> {
        self.inner.exists(key).await
    }

    fn provider_name(&self) -> &str {
        "flaky"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.unhealthy {
            return Err(ProviderError::Configuration("bucket not configured".to_string()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_backup_and_restore_in_memory() {
    let provider = Arc::new(InMemoryBackupProvider::new());
    let manager = CloudBackupManager::new(provider.clone(), "backups");
    assert_eq!(manager.prefix(), "backups/");
    assert_eq!(manager.provider_name(), "in-memory");

    let mut original = checkpoint("agent-1", 1).with_metadata("origin", json!("test"));
    original.open_files.push(OpenFile::new("src/main.rs", "fn main() {}"));

    manager.backup_checkpoint(&original).await.unwrap();
    assert_eq!(provider.keys(), vec!["backups/agent-1/chk_agent-1_1.json".to_string()]);

    let restored = manager
        .restore_checkpoint(&original.id, "agent-1")
        .await
        .unwrap();
    assert_eq!(restored, original);
}

#[tokio::test]
async fn test_backup_and_restore_on_filesystem() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(FileBackupProvider::new(dir.path()));
    let manager = CloudBackupManager::new(provider, "nested/prefix//");
    assert_eq!(manager.prefix(), "nested/prefix/");
    assert_eq!(manager.provider_name(), "filesystem");

    let original = checkpoint("agent-1", 7);
    manager.backup_checkpoint(&original).await.unwrap();
    assert!(dir
        .path()
        .join("nested/prefix/agent-1/chk_agent-1_7.json")
        .is_file());

    assert!(manager.exists(&original.id, "agent-1").await.unwrap());
    let restored = manager.restore_checkpoint(&original.id, "agent-1").await.unwrap();
    assert_eq!(restored, original);

    manager.delete_checkpoint(&original.id, "agent-1").await.unwrap();
    assert!(!manager.exists(&original.id, "agent-1").await.unwrap());
    // Deleting twice is not an error
    manager.delete_checkpoint(&original.id, "agent-1").await.unwrap();
}

#[tokio::test]
async fn test_restore_missing_backup_is_not_found() {
    let manager = CloudBackupManager::new(Arc::new(InMemoryBackupProvider::new()), "backups");
    let err = manager.restore_checkpoint("chk_x_1", "agent-1").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("backups/agent-1/chk_x_1.json"));
}

#[tokio::test]
async fn test_list_checkpoints_is_scoped_to_agent() {
    let provider = Arc::new(InMemoryBackupProvider::new());
    let manager = CloudBackupManager::new(provider.clone(), "backups");

    for n in 0..3 {
        manager.backup_checkpoint(&checkpoint("agent-1", n)).await.unwrap();
    }
    manager.backup_checkpoint(&checkpoint("agent-10", 0)).await.unwrap();
    provider
        .upload("elsewhere/agent-1/chk_agent-1_9.json", Bytes::from_static(b"{}"))
        .await
        .unwrap();

    let listed = manager.list_checkpoints("agent-1").await.unwrap();
    assert_eq!(listed.len(), 3);
    assert!(listed.iter().all(|c| c.agent_id == "agent-1"));

    assert!(manager.list_checkpoints("nobody").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_requires_agent_id() {
    let manager = CloudBackupManager::new(Arc::new(InMemoryBackupProvider::new()), "backups");
    let err = manager.list_checkpoints("").await.unwrap_err();
    assert!(matches!(err, CheckpointError::InvalidInput(_)));

    let err = manager.cleanup_old_backups("", 3).await.unwrap_err();
    assert!(matches!(err, CheckpointError::InvalidInput(_)));
}

#[tokio::test]
async fn test_list_propagates_decode_errors() {
    let provider = Arc::new(InMemoryBackupProvider::new());
    let manager = CloudBackupManager::new(provider.clone(), "backups");
    manager.backup_checkpoint(&checkpoint("agent-1", 1)).await.unwrap();
    provider
        .upload("backups/agent-1/corrupt.json", Bytes::from_static(b"not json"))
        .await
        .unwrap();

    let err = manager.list_checkpoints("agent-1").await.unwrap_err();
    assert!(matches!(err, CheckpointError::Serialization(_)));
}

#[tokio::test]
async fn test_list_all_checkpoints_spans_agents() {
    let provider = Arc::new(InMemoryBackupProvider::new());
    let manager = CloudBackupManager::new(provider.clone(), "fleet");

    manager.backup_checkpoint(&checkpoint("a", 1)).await.unwrap();
    manager.backup_checkpoint(&checkpoint("a", 2)).await.unwrap();
    manager.backup_checkpoint(&checkpoint("b", 1)).await.unwrap();
    provider
        .upload("other/c/chk_c_1.json", Bytes::from_static(b"{}"))
        .await
        .unwrap();

    let all = manager.list_all_checkpoints().await.unwrap();
    let expected: HashSet<String> = ["chk_a_1", "chk_a_2", "chk_b_1"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(ids(&all), expected);
}

#[tokio::test]
async fn test_cleanup_keeps_newest() {
    let provider = Arc::new(InMemoryBackupProvider::new());
    let manager = CloudBackupManager::new(provider.clone(), "backups");

    // Uploaded out of order; retention goes by timestamp
    for n in [3, 0, 4, 1, 2] {
        manager.backup_checkpoint(&checkpoint("agent-1", n)).await.unwrap();
    }
    manager.backup_checkpoint(&checkpoint("agent-2", 0)).await.unwrap();

    let deleted = manager.cleanup_old_backups("agent-1", 2).await.unwrap();
    assert_eq!(deleted, 3);

    let remaining = manager.list_checkpoints("agent-1").await.unwrap();
    let expected: HashSet<String> = ["chk_agent-1_3", "chk_agent-1_4"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(ids(&remaining), expected);
    assert_eq!(manager.list_checkpoints("agent-2").await.unwrap().len(), 1);

    // At or under the limit nothing is deleted
    assert_eq!(manager.cleanup_old_backups("agent-1", 2).await.unwrap(), 0);
    assert_eq!(manager.cleanup_old_backups("agent-1", 10).await.unwrap(), 0);
    assert_eq!(provider.len(), 3);
}

#[tokio::test]
async fn test_cleanup_to_zero_removes_everything() {
    let manager = CloudBackupManager::new(Arc::new(InMemoryBackupProvider::new()), "");
    for n in 0..3 {
        manager.backup_checkpoint(&checkpoint("agent-1", n)).await.unwrap();
    }
    assert_eq!(manager.cleanup_old_backups("agent-1", 0).await.unwrap(), 3);
    assert!(manager.list_checkpoints("agent-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_backup_stats() {
    let manager = CloudBackupManager::new(Arc::new(InMemoryBackupProvider::new()), "stats/");
    for n in [2, 0, 4, 1, 3] {
        manager.backup_checkpoint(&checkpoint("agent-1", n)).await.unwrap();
    }

    let stats = manager.get_backup_stats("agent-1").await.unwrap();
    assert_eq!(stats.total_backups, 5);
    assert!(stats.total_size > 0);
    assert_eq!(stats.oldest_backup.as_deref(), Some("chk_agent-1_0"));
    assert_eq!(stats.newest_backup.as_deref(), Some("chk_agent-1_4"));

    let empty = manager.get_backup_stats("agent-2").await.unwrap();
    assert_eq!(empty, BackupStats::default());
}

#[tokio::test]
async fn test_sync_overwrite_uploads_everything() {
    let provider = Arc::new(InMemoryBackupProvider::new());
    let manager = CloudBackupManager::new(provider.clone(), "sync");
    assert_eq!(manager.sync_mode(), SyncMode::Overwrite);

    let batch: Vec<Checkpoint> = (0..3).map(|n| checkpoint("agent-1", n)).collect();
    assert_eq!(manager.sync_checkpoints("agent-1", &batch).await.unwrap(), 3);
    assert_eq!(manager.sync_checkpoints("agent-1", &batch).await.unwrap(), 3);
    assert_eq!(provider.len(), 3);
}

#[tokio::test]
async fn test_sync_skip_existing() {
    let provider = Arc::new(InMemoryBackupProvider::new());
    let manager =
        CloudBackupManager::new(provider.clone(), "sync").with_sync_mode(SyncMode::SkipExisting);

    let batch: Vec<Checkpoint> = (0..3).map(|n| checkpoint("agent-1", n)).collect();
    assert_eq!(manager.sync_checkpoints("agent-1", &batch[..2]).await.unwrap(), 2);
    assert_eq!(manager.sync_checkpoints("agent-1", &batch).await.unwrap(), 1);
    assert_eq!(manager.sync_checkpoints("agent-1", &batch).await.unwrap(), 0);
    assert_eq!(provider.len(), 3);
}

#[tokio::test]
async fn test_sync_rejects_foreign_checkpoint_before_uploading() {
    let provider = Arc::new(InMemoryBackupProvider::new());
    let manager = CloudBackupManager::new(provider.clone(), "sync");

    let batch = vec![checkpoint("agent-1", 0), checkpoint("agent-2", 1)];
    let err = manager.sync_checkpoints("agent-1", &batch).await.unwrap_err();
    assert!(matches!(err, CheckpointError::InvalidInput(_)));
    assert!(provider.is_empty());

    assert_eq!(manager.sync_checkpoints("agent-1", &[]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_upload_failure_carries_provider_context() {
    let provider = Arc::new(FlakyProvider {
        fail_uploads_after: Some(0),
        ..FlakyProvider::default()
    });
    let manager = CloudBackupManager::new(provider, "backups");

    let err = manager
        .backup_checkpoint(&checkpoint("agent-1", 1))
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("upload failed"), "{}", message);
    assert!(message.contains("flaky"));
    assert!(message.contains("quota exceeded"));
    match err {
        CheckpointError::Provider { operation, key, .. } => {
            assert_eq!(operation, "upload");
            assert_eq!(key, "backups/agent-1/chk_agent-1_1.json");
        }
        other => panic!("expected provider error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sync_stops_at_first_failure() {
    let provider = Arc::new(FlakyProvider {
        fail_uploads_after: Some(2),
        ..FlakyProvider::default()
    });
    let manager = CloudBackupManager::new(provider.clone(), "backups");

    let batch: Vec<Checkpoint> = (0..5).map(|n| checkpoint("agent-1", n)).collect();
    assert!(manager.sync_checkpoints("agent-1", &batch).await.is_err());
    assert_eq!(provider.uploads.load(Ordering::SeqCst), 3);
    assert_eq!(provider.inner.len(), 2);
}

#[tokio::test]
async fn test_cleanup_stops_at_first_failed_delete() {
    let provider = Arc::new(FlakyProvider::default());
    let manager = CloudBackupManager::new(provider.clone(), "backups");
    for n in 0..4 {
        manager.backup_checkpoint(&checkpoint("agent-1", n)).await.unwrap();
    }

    provider.fail_deletes.store(true, Ordering::SeqCst);
    let err = manager.cleanup_old_backups("agent-1", 1).await.unwrap_err();
    assert!(err.to_string().contains("delete failed"));
    assert_eq!(provider.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(provider.inner.len(), 4);
}

#[tokio::test]
async fn test_health_check_delegates_to_provider() {
    let healthy = CloudBackupManager::new(Arc::new(FlakyProvider::default()), "backups");
    healthy.health_check().await.unwrap();

    let unhealthy = CloudBackupManager::new(
        Arc::new(FlakyProvider {
            unhealthy: true,
            ..FlakyProvider::default()
        }),
        "backups",
    );
    let err = unhealthy.health_check().await.unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::Provider {
            source: ProviderError::Configuration(_),
            ..
        }
    ));

    let dir = TempDir::new().unwrap();
    let missing_root = CloudBackupManager::new(
        Arc::new(FileBackupProvider::new(dir.path().join("absent"))),
        "backups",
    );
    assert!(missing_root.health_check().await.is_err());
}

#[tokio::test]
async fn test_local_checkpoints_forwarded_to_cloud() {
    let local_dir = TempDir::new().unwrap();
    let cloud_dir = TempDir::new().unwrap();

    let local = CheckpointManager::open(CheckpointConfig::new(local_dir.path()).with_max_checkpoints(3))
        .await
        .unwrap();
    for _ in 0..5 {
        local
            .create_checkpoint("agent-1", AgentProgress::running(5), MemoryState::default(), Vec::new())
            .await
            .unwrap();
    }
    local.add_open_file("agent-1", "notes.md", "todo").await.unwrap();

    let cloud = CloudBackupManager::new(Arc::new(FileBackupProvider::new(cloud_dir.path())), "backups")
        .with_sync_mode(SyncMode::SkipExisting);

    let series = local.get_checkpoints_for_agent("agent-1").await;
    assert_eq!(cloud.sync_checkpoints("agent-1", &series).await.unwrap(), 3);
    assert_eq!(cloud.sync_checkpoints("agent-1", &series).await.unwrap(), 0);

    let latest = local.get_latest_checkpoint("agent-1").await.unwrap();
    let restored = cloud.restore_checkpoint(&latest.id, "agent-1").await.unwrap();
    assert_eq!(restored, latest);
    assert_eq!(restored.open_file("notes.md").map(|f| f.content.as_str()), Some("todo"));
}

#[tokio::test]
async fn test_keys_deleted_after_listing_are_skipped() {
    let provider = Arc::new(FlakyProvider {
        stale_keys: vec!["b/agent-1/chk_gone_1.json".to_string()],
        ..FlakyProvider::default()
    });
    let manager = CloudBackupManager::new(provider.clone(), "b");
    for n in 1..=3 {
        manager.backup_checkpoint(&checkpoint("agent-1", n)).await.unwrap();
    }

    let listed = manager.list_checkpoints("agent-1").await.unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(manager.list_all_checkpoints().await.unwrap().len(), 3);

    let stats = manager.get_backup_stats("agent-1").await.unwrap();
    assert_eq!(stats.total_backups, 3);
    assert_eq!(stats.oldest_backup.as_deref(), Some("chk_agent-1_1"));
    assert_eq!(stats.newest_backup.as_deref(), Some("chk_agent-1_3"));

    assert_eq!(manager.cleanup_old_backups("agent-1", 1).await.unwrap(), 2);
    assert_eq!(provider.inner.keys(), vec!["b/agent-1/chk_agent-1_3.json".to_string()]);
}
