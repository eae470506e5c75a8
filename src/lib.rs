//! Ledgerstore - local-storage lifecycle core for a synchronizing document
//! store
//!
//! Three components, in dependency order:
//!
//! - [`coroutine`] - bounded cooperative storage tasks with
//!   cancellation-safe shutdown. Everything asynchronous in the storage
//!   layer runs through a [`CoroutineManager`].
//! - [`db`] - embedded, directory-backed key-value instances
//!   ([`LedgerDb`]) provisioned with low latency by a [`DbFactory`] that
//!   pre-warms one spare instance and stages all creation behind an atomic
//!   rename.
//! - [`pruning`] - the [`CommitPruner`], which computes the obsolete
//!   prefix of the local commit DAG and deletes it without ever touching a
//!   commit live state still depends on.
//!
//! Failures surface as [`Status`] values; nothing here is user-visible
//! directly, and callers log and degrade gracefully.

pub mod config;
pub mod coroutine;
pub mod db;
pub mod pruning;
pub mod status;

pub use config::LedgerConfig;
pub use coroutine::{CoroutineManager, TaskHandle};
pub use db::{DbFactory, LedgerDb};
pub use pruning::{
    ClockEntry, Commit, CommitId, CommitPruner, CommitPrunerDelegate, LiveCommitTracker, PruningPolicy,
};
pub use status::{Result, Status};
