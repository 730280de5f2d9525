// Cloud backup for agent checkpoints
// A provider-agnostic manager on top of pluggable object-store adapters

mod file;
mod manager;
mod memory;
mod provider;
#[cfg(feature = "s3")]
mod s3;

pub use file::FileBackupProvider;
pub use manager::{BackupStats, CloudBackupManager, SyncMode};
pub use memory::InMemoryBackupProvider;
pub use provider::{CloudBackupProvider, ProviderError};
#[cfg(feature = "s3")]
pub use s3::{S3BackupProvider, S3ProviderConfig};
