//! Checkpoint an agent locally, then forward its series to a backup store.
//!
//! Run with: `cargo run --example backup_sync`
//! Set `BACKUP_DIR` to back up into a directory instead of memory.

use agent_checkpoint::backup::{
    CloudBackupManager, CloudBackupProvider, FileBackupProvider, InMemoryBackupProvider, SyncMode,
};
use agent_checkpoint::checkpoint::{AgentProgress, CheckpointConfig, CheckpointManager, MemoryState};
use agent_checkpoint::telemetry::init_tracing;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let local_dir = tempfile::tempdir()?;
    let manager = CheckpointManager::open(
        CheckpointConfig::new(local_dir.path()).with_max_checkpoints(3),
    )
    .await?;

    let agent_id = "verifier-1";
    let mut progress = AgentProgress::running(5).with_task("verify-42", "Verify model endpoints");

    manager
        .create_checkpoint(agent_id, progress.clone(), MemoryState::default(), Vec::new())
        .await?;

    for step in ["discover", "probe", "score", "report"] {
        progress.record_step(step);
        manager
            .create_checkpoint(agent_id, progress.clone(), MemoryState::default(), Vec::new())
            .await?;
        manager
            .add_open_file(agent_id, &format!("reports/{}.md", step), "pending")
            .await?;
    }
    progress.complete();
    manager.update_progress(agent_id, progress).await?;

    let stats = manager.get_checkpoint_stats().await;
    info!(total = stats.total_checkpoints, "Local checkpoints retained");

    let provider: Arc<dyn CloudBackupProvider> = match std::env::var("BACKUP_DIR") {
        Ok(dir) => {
            tokio::fs::create_dir_all(&dir).await?;
            Arc::new(FileBackupProvider::new(dir))
        }
        Err(_) => Arc::new(InMemoryBackupProvider::new()),
    };

    let cloud = CloudBackupManager::new(provider, "agents").with_sync_mode(SyncMode::SkipExisting);
    cloud.health_check().await?;

    let series = manager.get_checkpoints_for_agent(agent_id).await;
    let uploaded = cloud.sync_checkpoints(agent_id, &series).await?;
    info!(uploaded = uploaded, provider = %cloud.provider_name(), "Synced checkpoints");

    let deleted = cloud.cleanup_old_backups(agent_id, 2).await?;
    let backup_stats = cloud.get_backup_stats(agent_id).await?;
    info!(
        deleted = deleted,
        remaining = backup_stats.total_backups,
        bytes = backup_stats.total_size,
        newest = ?backup_stats.newest_backup,
        "Backup retention applied"
    );

    if let Some(newest) = backup_stats.newest_backup {
        let restored = cloud.restore_checkpoint(&newest, agent_id).await?;
        info!(
            checkpoint_id = %restored.id,
            status = ?restored.progress.status,
            open_files = restored.open_files.len(),
            "Restored newest backup"
        );
    }

    Ok(())
}
