//! Commit DAG pruning
//!
//! Decides which commits can be permanently deleted without losing
//! information any live state depends on, and deletes them.

pub mod commit;
pub mod pruner;

pub use commit::{ClockEntry, Commit, CommitId, CommitPrunerDelegate, LiveCommitTracker};
pub use pruner::{CommitPruner, PruningPolicy};
