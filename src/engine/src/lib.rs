//! regmirror Engine - image synchronization.
//!
//! This module implements the mirroring pipeline: tag discovery on source
//! and destinations, transfer planning, the OCI-to-OCI and OCI-to-bucket
//! push pipelines over a shared staging step, the purge and orphan-blob
//! sweep, and the retry/cache/metrics substrate beneath them.

pub mod auth;
pub mod bucket;
pub mod cache;
pub mod ecr;
pub mod plan;
pub mod purge;
pub mod push;
pub mod reference;
pub mod registry;
pub mod retry;
pub mod stage;
pub mod sync;
pub mod tags;
pub mod telemetry;

// Re-export common types
pub use auth::{Credential, CredentialResolver};
pub use cache::{BucketInitSet, ObjectCache};
pub use plan::SyncPlan;
pub use reference::{BucketProvider, Reference};
pub use registry::RegistryClient;
pub use sync::SyncEngine;
pub use telemetry::Metrics;

/// regmirror Engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
