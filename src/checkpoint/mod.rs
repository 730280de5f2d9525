//! Agent checkpoint data model and local persistence

mod cache;
mod manager;

pub use cache::CheckpointCache;
pub use manager::{CheckpointConfig, CheckpointManager, CheckpointStats};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CheckpointError, Result};

/// A snapshot of one agent task at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint ID, derived from the agent ID and creation time
    pub id: String,

    /// Agent this checkpoint belongs to
    pub agent_id: String,

    /// Time of creation or of the last mutation
    pub timestamp: DateTime<Utc>,

    /// Task progress
    #[serde(default)]
    pub progress: AgentProgress,

    /// Conversation and working memory
    #[serde(default)]
    pub memory_state: MemoryState,

    /// Files the agent is working on; `path` is unique
    #[serde(default)]
    pub open_files: Vec<OpenFile>,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Checkpoint {
    /// Create an empty checkpoint with an explicit ID and timestamp
    pub fn with_id(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            timestamp,
            progress: AgentProgress::default(),
            memory_state: MemoryState::default(),
            open_files: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata to the checkpoint
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Look up an open file by path
    pub fn open_file(&self, path: &str) -> Option<&OpenFile> {
        self.open_files.iter().find(|file| file.path == path)
    }

    /// Compact JSON, used for cloud objects
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Pretty-printed JSON, used for the on-disk files
    pub fn to_json_pretty(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode a checkpoint from JSON bytes
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Lifecycle state of an agent task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Task is executing
    #[default]
    Running,
    /// Task finished successfully
    Completed,
    /// Task stopped with an error
    Failed,
    /// Task is suspended and can be resumed
    Paused,
}

/// Progress of an agent task
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentProgress {
    /// Task identifier
    #[serde(default)]
    pub task_id: String,
    /// Human-readable task name
    #[serde(default)]
    pub task_name: String,
    /// Lifecycle state
    pub status: AgentStatus,
    /// Fraction complete, kept within `0.0..=1.0`
    pub progress: f64,
    /// Name of the step last recorded
    #[serde(rename = "current_step", default)]
    pub step: String,
    /// Steps in the task, 0 when unknown
    pub total_steps: u32,
    /// Steps recorded so far
    pub completed_steps: u32,
    /// When the task started
    pub start_time: DateTime<Utc>,
    /// When progress last changed
    pub last_update: DateTime<Utc>,
    /// Failure message, set by [`fail`](Self::fail)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentProgress {
    /// Progress for a task that has just started
    pub fn running(total_steps: u32) -> Self {
        let now = Utc::now();
        Self {
            status: AgentStatus::Running,
            total_steps,
            start_time: now,
            last_update: now,
            ..Self::default()
        }
    }

    /// Set the task identity
    pub fn with_task(mut self, task_id: impl Into<String>, task_name: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self.task_name = task_name.into();
        self
    }

    /// Mark one more step as completed and recompute the fraction
    pub fn record_step(&mut self, step: impl Into<String>) {
        self.step = step.into();
        self.completed_steps = self.completed_steps.saturating_add(1);
        if self.total_steps > 0 {
            self.progress = f64::from(self.completed_steps) / f64::from(self.total_steps);
        }
        self.last_update = Utc::now();
        self.clamp_progress();
    }

    /// Mark the task as completed
    pub fn complete(&mut self) {
        self.status = AgentStatus::Completed;
        self.progress = 1.0;
        self.completed_steps = self.total_steps.max(self.completed_steps);
        self.last_update = Utc::now();
    }

    /// Mark the task as failed
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = AgentStatus::Failed;
        self.error = Some(error.into());
        self.last_update = Utc::now();
    }

    /// Force `progress` into `0.0..=1.0`; NaN becomes 0
    pub fn clamp_progress(&mut self) {
        self.progress = if self.progress.is_nan() {
            0.0
        } else {
            self.progress.clamp(0.0, 1.0)
        };
    }
}

/// Agent memory captured with a checkpoint
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemoryState {
    /// Recent messages, keyed by conversation ID
    #[serde(default)]
    pub short_term_conversations: HashMap<String, Vec<ConversationMessage>>,

    /// Summaries of older conversations
    #[serde(default)]
    pub long_term_summaries: Vec<MemorySummary>,

    /// Scratch values the agent keeps between steps
    #[serde(default)]
    pub working_memory: HashMap<String, Value>,
}

/// One message of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Message identifier
    pub id: String,
    /// user, assistant or system
    pub role: String,
    /// Message text
    pub content: String,
    /// When the message was sent
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Condensed record of an older stretch of conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySummary {
    /// Summary identifier
    pub id: String,
    /// Summary text
    pub content: String,
    /// Topics covered
    #[serde(default)]
    pub topics: Vec<String>,
    /// Facts worth keeping
    #[serde(default)]
    pub key_points: Vec<String>,
    /// 0.0 to 1.0
    pub importance: f64,
    /// First message covered
    pub start_time: DateTime<Utc>,
    /// Last message covered
    pub end_time: DateTime<Utc>,
    /// Messages condensed into this summary
    pub message_count: u32,
    /// When the summary was written
    pub created_at: DateTime<Utc>,
}

/// A file an agent has open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenFile {
    /// File path as the agent refers to it
    pub path: String,
    /// Current buffer content
    pub content: String,
    /// Cursor offset into the content
    #[serde(rename = "cursor_position", default)]
    pub cursor_pos: usize,
    /// When the content last changed
    pub last_modified: DateTime<Utc>,
    /// Unsaved changes pending
    #[serde(default)]
    pub is_modified: bool,
}

impl OpenFile {
    /// A freshly opened, modified file with the cursor at the start
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            cursor_pos: 0,
            last_modified: Utc::now(),
            is_modified: true,
        }
    }
}

/// Agent IDs end up in file names and object keys, so they must be
/// non-empty single path segments.
pub(crate) fn validate_agent_id(agent_id: &str) -> Result<()> {
    if agent_id.is_empty() {
        return Err(CheckpointError::InvalidInput(
            "agent ID is required".to_string(),
        ));
    }
    if agent_id == "."
        || agent_id == ".."
        || agent_id.contains(['/', '\\', '\0'])
    {
        return Err(CheckpointError::InvalidInput(format!(
            "agent ID '{}' is not a valid path segment",
            agent_id
        )));
    }
    Ok(())
}

/// `chk_<agent>_<unix nanos>`
pub(crate) fn checkpoint_id(agent_id: &str, timestamp: DateTime<Utc>) -> String {
    let nanos = timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| timestamp.timestamp_micros().saturating_mul(1_000));
    format!("chk_{}_{}", agent_id, nanos)
}
