//! Local checkpoint manager: authoritative index plus one JSON file per checkpoint

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::cache::CheckpointCache;
use super::{checkpoint_id, validate_agent_id, AgentProgress, Checkpoint, MemoryState, OpenFile};
use crate::{CheckpointError, Result};

/// Checkpoint manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding `<checkpoint id>.json` files
    pub storage_path: PathBuf,
    /// Checkpoints retained per agent; 0 is treated as 1
    pub max_checkpoints: usize,
    /// Cache capacity; 0 disables the cache
    pub cache_size: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./checkpoints"),
            max_checkpoints: 10,
            cache_size: 100,
        }
    }
}

impl CheckpointConfig {
    /// Default limits with a custom storage directory
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            ..Self::default()
        }
    }

    /// Set the per-agent retention limit
    pub fn with_max_checkpoints(mut self, max_checkpoints: usize) -> Self {
        self.max_checkpoints = max_checkpoints;
        self
    }

    /// Set the cache capacity
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }
}

/// Diagnostic snapshot of the manager
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointStats {
    /// Checkpoints in the index, across all agents
    pub total_checkpoints: usize,
    /// Directory holding the checkpoint files
    pub storage_path: PathBuf,
    /// Per-agent retention limit
    pub max_checkpoints: usize,
    /// Checkpoints currently cached
    pub cache_size: usize,
    /// Cache capacity
    pub cache_max_size: usize,
    /// Indexed checkpoint count per agent
    pub checkpoints_per_agent: HashMap<String, usize>,
}

type Index = HashMap<String, Checkpoint>;

/// Manages agent checkpoints on local disk.
///
/// A single mutex guards the index and all file I/O, so operations are
/// serialized across every agent. The cache has its own lock and is only
/// consulted ahead of the index by [`restore_from_checkpoint`].
///
/// [`restore_from_checkpoint`]: CheckpointManager::restore_from_checkpoint
#[derive(Clone)]
pub struct CheckpointManager {
    index: Arc<Mutex<Index>>,
    storage_path: Arc<PathBuf>,
    max_checkpoints: usize,
    cache: Arc<CheckpointCache>,
}

impl CheckpointManager {
    /// Create an empty manager. Nothing is read from or written to disk until
    /// the first checkpoint is created.
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            index: Arc::new(Mutex::new(HashMap::new())),
            storage_path: Arc::new(config.storage_path),
            max_checkpoints: config.max_checkpoints.max(1),
            cache: Arc::new(CheckpointCache::new(config.cache_size)),
        }
    }

    /// Create a manager and load every checkpoint already present in the
    /// storage directory
    pub async fn open(config: CheckpointConfig) -> Result<Self> {
        let manager = Self::new(config);
        fs::create_dir_all(manager.storage_path.as_path())
            .await
            .map_err(|e| {
                CheckpointError::persistence(
                    format!(
                        "failed to create storage directory {}",
                        manager.storage_path.display()
                    ),
                    e,
                )
            })?;
        manager.load_from_disk().await?;
        Ok(manager)
    }

    /// Directory holding the checkpoint files
    pub fn storage_path(&self) -> &Path {
        self.storage_path.as_path()
    }

    /// Effective per-agent retention limit
    pub fn max_checkpoints(&self) -> usize {
        self.max_checkpoints
    }

    /// Read `*.json` checkpoints from the storage directory into the index,
    /// then apply per-agent retention. Unreadable or malformed files, and
    /// files whose name does not match the checkpoint ID, are skipped.
    /// Returns the number loaded.
    #[instrument(skip(self))]
    pub async fn load_from_disk(&self) -> Result<usize> {
        let mut index = self.index.lock().await;

        let mut entries = match fs::read_dir(self.storage_path.as_path()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(CheckpointError::persistence(
                    "failed to read storage directory",
                    e,
                ))
            }
        };

        let mut loaded = 0;
        let mut agents = HashSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CheckpointError::persistence("failed to read directory entry", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            let data = match fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint file");
                    continue;
                }
            };

            let checkpoint = match Checkpoint::from_json(&data) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping malformed checkpoint file");
                    continue;
                }
            };

            // Later writes and deletes address the file by ID
            let stem = path.file_stem().and_then(|s| s.to_str());
            if stem != Some(checkpoint.id.as_str()) {
                warn!(
                    path = %path.display(),
                    checkpoint_id = %checkpoint.id,
                    "Skipping checkpoint file whose name does not match its ID"
                );
                continue;
            }
            if let Err(e) = validate_agent_id(&checkpoint.agent_id) {
                warn!(path = %path.display(), error = %e, "Skipping checkpoint with invalid agent ID");
                continue;
            }

            self.cache.refresh(&checkpoint);
            agents.insert(checkpoint.agent_id.clone());
            index.insert(checkpoint.id.clone(), checkpoint);
            loaded += 1;
        }

        let mut trimmed = 0;
        for agent_id in &agents {
            trimmed += self.trim_series(&mut index, agent_id).await;
        }

        info!(
            loaded = loaded,
            trimmed = trimmed,
            storage_path = %self.storage_path.display(),
            "Loaded checkpoints from disk"
        );
        Ok(loaded)
    }

    /// Create a new checkpoint for an agent, persist it and trim the agent's
    /// series to `max_checkpoints`
    #[instrument(skip(self, progress, memory_state, open_files))]
    pub async fn create_checkpoint(
        &self,
        agent_id: &str,
        mut progress: AgentProgress,
        memory_state: MemoryState,
        open_files: Vec<OpenFile>,
    ) -> Result<Checkpoint> {
        validate_agent_id(agent_id)?;
        progress.clamp_progress();

        let mut index = self.index.lock().await;

        let timestamp = next_timestamp(&index, agent_id);
        let checkpoint = Checkpoint {
            id: checkpoint_id(agent_id, timestamp),
            agent_id: agent_id.to_string(),
            timestamp,
            progress,
            memory_state,
            open_files: dedupe_open_files(open_files),
            metadata: HashMap::new(),
        };

        self.write_checkpoint_file(&checkpoint).await?;
        index.insert(checkpoint.id.clone(), checkpoint.clone());

        let trimmed = self.trim_series(&mut index, agent_id).await;

        info!(
            checkpoint_id = %checkpoint.id,
            agent_id = %agent_id,
            trimmed = trimmed,
            "Checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Most recent checkpoint for an agent
    pub async fn get_latest_checkpoint(&self, agent_id: &str) -> Result<Checkpoint> {
        let index = self.index.lock().await;
        let latest = latest_in(&index, agent_id)
            .cloned()
            .ok_or_else(|| no_checkpoint(agent_id))?;
        self.cache.put(latest.clone());
        Ok(latest)
    }

    /// Every checkpoint of an agent, oldest first
    pub async fn get_checkpoints_for_agent(&self, agent_id: &str) -> Vec<Checkpoint> {
        let index = self.index.lock().await;
        let mut checkpoints: Vec<Checkpoint> = index
            .values()
            .filter(|c| c.agent_id == agent_id)
            .cloned()
            .collect();
        checkpoints.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        checkpoints
    }

    /// Fetch a checkpoint by ID, cache first. The result is an owned copy;
    /// changing it does not affect the manager.
    pub async fn restore_from_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        if let Some(cached) = self.cache.get(checkpoint_id) {
            debug!(checkpoint_id = %checkpoint_id, "Checkpoint cache hit");
            return Ok(cached);
        }

        let index = self.index.lock().await;
        let checkpoint = index
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(format!("checkpoint not found: {}", checkpoint_id)))?;

        debug!(checkpoint_id = %checkpoint_id, "Checkpoint cache miss");
        self.cache.put(checkpoint.clone());
        Ok(checkpoint)
    }

    /// Replace the progress of the agent's latest checkpoint
    #[instrument(skip(self, progress))]
    pub async fn update_progress(&self, agent_id: &str, mut progress: AgentProgress) -> Result<()> {
        progress.clamp_progress();
        self.mutate_latest(agent_id, move |checkpoint| {
            checkpoint.progress = progress;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Add a file to the agent's latest checkpoint, or update it in place if
    /// the path is already open
    #[instrument(skip(self, content))]
    pub async fn add_open_file(&self, agent_id: &str, path: &str, content: &str) -> Result<()> {
        self.mutate_latest(agent_id, |checkpoint| {
            match checkpoint.open_files.iter_mut().find(|f| f.path == path) {
                Some(file) => {
                    file.content = content.to_string();
                    file.last_modified = Utc::now();
                    file.is_modified = true;
                }
                None => checkpoint.open_files.push(OpenFile::new(path, content)),
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Remove a file from the agent's latest checkpoint
    #[instrument(skip(self))]
    pub async fn remove_open_file(&self, agent_id: &str, path: &str) -> Result<()> {
        self.mutate_latest(agent_id, |checkpoint| {
            let position = checkpoint
                .open_files
                .iter()
                .position(|f| f.path == path)
                .ok_or_else(|| {
                    CheckpointError::NotFound(format!("file not found in checkpoint: {}", path))
                })?;
            checkpoint.open_files.remove(position);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Delete one checkpoint from the index, the cache and disk
    #[instrument(skip(self))]
    pub async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        let mut index = self.index.lock().await;
        if !index.contains_key(checkpoint_id) {
            return Err(CheckpointError::NotFound(format!(
                "checkpoint not found: {}",
                checkpoint_id
            )));
        }

        match fs::remove_file(self.file_path(checkpoint_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CheckpointError::persistence(
                    format!("failed to delete checkpoint file for {}", checkpoint_id),
                    e,
                ))
            }
        }

        index.remove(checkpoint_id);
        self.cache.remove(checkpoint_id);
        info!(checkpoint_id = %checkpoint_id, "Checkpoint deleted");
        Ok(())
    }

    /// Snapshot of index and cache sizes
    pub async fn get_checkpoint_stats(&self) -> CheckpointStats {
        let index = self.index.lock().await;

        let mut checkpoints_per_agent = HashMap::new();
        for checkpoint in index.values() {
            *checkpoints_per_agent
                .entry(checkpoint.agent_id.clone())
                .or_insert(0) += 1;
        }

        CheckpointStats {
            total_checkpoints: index.len(),
            storage_path: self.storage_path.to_path_buf(),
            max_checkpoints: self.max_checkpoints,
            cache_size: self.cache.len(),
            cache_max_size: self.cache.max_size(),
            checkpoints_per_agent,
        }
    }

    /// Drop every cached checkpoint. The index is untouched.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Resize the cache, evicting immediately if needed
    pub fn set_cache_size(&self, max_size: usize) {
        self.cache.set_max_size(max_size);
    }

    fn file_path(&self, checkpoint_id: &str) -> PathBuf {
        self.storage_path.join(format!("{}.json", checkpoint_id))
    }

    /// Apply `mutate` to a copy of the agent's latest checkpoint, bump its
    /// timestamp, persist it, then commit it to the index and cache.
    /// Nothing changes in memory if the closure or the write fails.
    async fn mutate_latest<F>(&self, agent_id: &str, mutate: F) -> Result<Checkpoint>
    where
        F: FnOnce(&mut Checkpoint) -> Result<()>,
    {
        let mut index = self.index.lock().await;

        let mut updated = latest_in(&index, agent_id)
            .cloned()
            .ok_or_else(|| no_checkpoint(agent_id))?;

        mutate(&mut updated)?;
        updated.timestamp = next_timestamp(&index, agent_id);

        self.write_checkpoint_file(&updated).await?;
        self.cache.refresh(&updated);
        index.insert(updated.id.clone(), updated.clone());

        debug!(checkpoint_id = %updated.id, agent_id = %agent_id, "Checkpoint updated");
        Ok(updated)
    }

    /// Write through a temporary file so a crash never leaves a truncated
    /// checkpoint behind
    async fn write_checkpoint_file(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(self.storage_path.as_path())
            .await
            .map_err(|e| CheckpointError::persistence("failed to create storage directory", e))?;

        let data = checkpoint.to_json_pretty()?;
        let path = self.file_path(&checkpoint.id);
        let tmp_path = path.with_extension("json.tmp");

        fs::write(&tmp_path, &data).await.map_err(|e| {
            CheckpointError::persistence(
                format!("failed to write checkpoint file {}", tmp_path.display()),
                e,
            )
        })?;
        fs::rename(&tmp_path, &path).await.map_err(|e| {
            CheckpointError::persistence(
                format!("failed to move checkpoint file into place {}", path.display()),
                e,
            )
        })?;
        Ok(())
    }

    /// Drop the oldest checkpoints of an agent beyond `max_checkpoints`.
    /// File removal is best effort; the index entry is dropped regardless.
    async fn trim_series(&self, index: &mut Index, agent_id: &str) -> usize {
        let mut series: Vec<(DateTime<Utc>, String)> = index
            .values()
            .filter(|c| c.agent_id == agent_id)
            .map(|c| (c.timestamp, c.id.clone()))
            .collect();

        if series.len() <= self.max_checkpoints {
            return 0;
        }

        series.sort();
        let excess = series.len() - self.max_checkpoints;

        for (_, id) in series.into_iter().take(excess) {
            index.remove(&id);
            self.cache.remove(&id);

            match fs::remove_file(self.file_path(&id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(checkpoint_id = %id, error = %e, "Failed to remove trimmed checkpoint file");
                }
            }
            debug!(checkpoint_id = %id, agent_id = %agent_id, "Trimmed old checkpoint");
        }

        excess
    }
}

fn no_checkpoint(agent_id: &str) -> CheckpointError {
    CheckpointError::NotFound(format!("no checkpoint found for agent {}", agent_id))
}

fn latest_in<'a>(index: &'a Index, agent_id: &str) -> Option<&'a Checkpoint> {
    index
        .values()
        .filter(|c| c.agent_id == agent_id)
        .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)))
}

/// Current time, pushed past the agent's newest timestamp so every create or
/// mutation strictly advances the series
fn next_timestamp(index: &Index, agent_id: &str) -> DateTime<Utc> {
    let now = Utc::now();
    match latest_in(index, agent_id) {
        Some(latest) if latest.timestamp >= now => latest.timestamp + Duration::nanoseconds(1),
        _ => now,
    }
}

/// Later entries for a repeated path replace earlier ones in place
fn dedupe_open_files(open_files: Vec<OpenFile>) -> Vec<OpenFile> {
    let mut unique: Vec<OpenFile> = Vec::with_capacity(open_files.len());
    for file in open_files {
        match unique.iter_mut().find(|f| f.path == file.path) {
            Some(existing) => *existing = file,
            None => unique.push(file),
        }
    }
    unique
}
