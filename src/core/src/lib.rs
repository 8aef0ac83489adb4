//! regmirror Core - Shared Types
//!
//! This module provides the error type and the typed configuration
//! snapshot shared by the sync engine and the CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{ImageSyncJob, RegistryEntry, S3Settings, SyncConfig};
pub use error::{Result, SyncError};

/// regmirror version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
