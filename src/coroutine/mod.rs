//! Cooperative storage tasks: bounded admission and interruptible suspension
//!
//! Everything asynchronous in the storage layer runs as a task started
//! through [`CoroutineManager`]; inside a task, suspending calls go through
//! the [`TaskHandle`] so shutdown can interrupt them.

pub mod handle;
pub mod manager;

pub use handle::TaskHandle;
pub use manager::CoroutineManager;
