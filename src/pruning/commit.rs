//! Commit model and pruning collaborator interfaces

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coroutine::TaskHandle;
use crate::status::Result;

/// Unique identifier for a commit
pub type CommitId = String;

/// Immutable node in the local commit DAG.
///
/// Created by storage write paths; destroyed only by pruning, which is
/// irreversible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: CommitId,
    /// Parent commit IDs; more than one parent makes this a merge
    pub parents: Vec<CommitId>,
    /// Longest distance to a root. Orders two commits without walking
    /// their parent chains.
    pub generation: u64,
    /// Opaque serialized content
    pub payload: Vec<u8>,
}

impl Commit {
    pub fn new(
        id: impl Into<CommitId>,
        parents: Vec<CommitId>,
        generation: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            parents,
            generation,
            payload,
        }
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Per-device marker recording the pruning boundary after a successful
/// cycle, consumed by the synchronization layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEntry {
    pub commit_id: CommitId,
    pub generation: u64,
    pub recorded_at: DateTime<Utc>,
}

impl ClockEntry {
    /// Entry marking `commit` as the new pruning boundary
    pub fn at_boundary(commit: &Commit) -> Self {
        Self {
            commit_id: commit.id.clone(),
            generation: commit.generation,
            recorded_at: Utc::now(),
        }
    }
}

/// Storage operations the pruner needs from its owner
#[async_trait]
pub trait CommitPrunerDelegate: Send + Sync {
    /// Look up a commit; `NotFound` for one that does not exist locally
    /// (or was already pruned)
    async fn get_commit(&self, id: &CommitId) -> Result<Commit>;

    /// Delete a batch of commits as one logical operation
    async fn delete_commits(&self, handle: &TaskHandle, commits: Vec<Commit>) -> Result<()>;

    /// Record the new pruning boundary for this device
    async fn update_self_clock_entry(&self, handle: &TaskHandle, entry: ClockEntry) -> Result<()>;
}

/// Point-in-time accessor for the commits reachable from current
/// application state. One snapshot is taken per pruning cycle and never
/// refreshed mid-cycle.
pub trait LiveCommitTracker: Send + Sync {
    fn live_commits(&self) -> Vec<Commit>;
}
