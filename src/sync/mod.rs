//! Sync orchestration: durable run queue + the worker drain loop.

pub mod enqueue;
pub mod runner;

pub use enqueue::{enqueue_incremental_run, enqueue_manual_run, EnqueueOutcome};
pub use runner::SyncRunner;
