//! Embedded database instances and their provisioning
//!
//! [`LedgerDb`] is one directory-backed key-value instance; [`DbFactory`]
//! provisions instances with low latency by keeping a single pre-warmed
//! spare and creating everything else through a crash-safe staging rename.

pub mod factory;
pub mod instance;

pub use factory::{CACHED_DB_DIR, DbFactory, STAGING_DIR};
pub use instance::LedgerDb;
