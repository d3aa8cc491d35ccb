//! ListRust Storage - List store and file storage abstraction
//!
//! This crate provides the PostgreSQL-backed list store, an in-memory list
//! store for tests, and the filesystem storage used by queues and digest
//! mailboxes.

pub mod db;
pub mod file;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use file::{FileStorage, LocalStorage};
pub use models::*;
pub use repository::*;
