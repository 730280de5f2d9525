//! # Agent Checkpoint
//!
//! Durable checkpointing for long-running agent tasks, with a bounded in-memory
//! cache and a provider-agnostic cloud backup layer.
//!
//! ## Overview
//!
//! A [`checkpoint::CheckpointManager`] owns the authoritative index of every
//! checkpoint plus one pretty-printed JSON file per checkpoint on disk. Each
//! agent keeps at most `max_checkpoints` snapshots; the oldest are trimmed on
//! every create.
//!
//! A [`backup::CloudBackupManager`] pushes checkpoints into any object store
//! implementing [`backup::CloudBackupProvider`]. The two managers never call each
//! other: the caller decides when local state is forwarded to the cloud.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent_checkpoint::backup::{CloudBackupManager, InMemoryBackupProvider};
//! use agent_checkpoint::checkpoint::{
//!     AgentProgress, CheckpointConfig, CheckpointManager, MemoryState,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> agent_checkpoint::Result<()> {
//! let manager = CheckpointManager::open(CheckpointConfig::new("./checkpoints")).await?;
//!
//! let checkpoint = manager
//!     .create_checkpoint("agent-1", AgentProgress::running(10), MemoryState::default(), Vec::new())
//!     .await?;
//!
//! manager.add_open_file("agent-1", "src/main.rs", "fn main() {}").await?;
//!
//! let cloud = CloudBackupManager::new(Arc::new(InMemoryBackupProvider::new()), "backups");
//! cloud.backup_checkpoint(&manager.get_latest_checkpoint("agent-1").await?).await?;
//! cloud.cleanup_old_backups("agent-1", 5).await?;
//! # let _ = checkpoint;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`checkpoint`]: data model, cache and the local checkpoint manager
//! - [`backup`]: cloud provider contract, adapters and the backup manager
//! - [`telemetry`]: tracing subscriber bootstrap

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Main error type for checkpoint and backup operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Checkpoint, agent series, open file or backup object is absent
    #[error("{0}")]
    NotFound(String),

    /// Rejected input (empty agent ID, empty key or payload, mismatched batch)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Local disk I/O failure
    #[error("{context}: {source}")]
    Persistence {
        /// What the manager was doing when the I/O failed
        context: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure surfaced by a cloud backup provider
    #[error("{provider} {operation} failed for '{key}': {source}")]
    Provider {
        /// Provider display name
        provider: String,
        /// Provider operation (upload, download, list, ...)
        operation: &'static str,
        /// Object key or prefix the operation targeted
        key: String,
        /// Error reported by the provider
        #[source]
        source: backup::ProviderError,
    },
}

impl CheckpointError {
    /// Wrap an I/O error with operation context
    pub fn persistence(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Persistence {
            context: context.into(),
            source,
        }
    }

    /// True when the error reports an absent checkpoint, file or object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Checkpoint data model, cache and local persistence
pub mod checkpoint;

/// Cloud backup provider contract, adapters and manager
pub mod backup;

/// Tracing subscriber setup
pub mod telemetry;
