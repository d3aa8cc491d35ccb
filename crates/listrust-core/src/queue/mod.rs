//! Queues and runners

pub mod runner;
pub mod switchboard;

pub use runner::{ItemProcessor, Runner};
pub use switchboard::{queues, QueueItem, QueueStats, RetryPolicy, Switchboard};
