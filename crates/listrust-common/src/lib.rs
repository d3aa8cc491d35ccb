//! ListRust Common - Shared types and utilities
//!
//! This crate provides configuration, the error taxonomy and the small
//! value types shared by the storage, pipeline and server crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
