//! Common types and utilities for certpilot.
//!
//! Shared by the configuration crate and the orchestrator:
//!
//! - [`ConfigVariant`] / [`ActiveState`] - which reverse-proxy configuration is live
//! - [`RunId`] - correlation identifier for one orchestrator run
//! - [`BackoffPolicy`] - bounded exponential backoff used by every polling loop
//! - [`observability`] - tracing subscriber setup for the binary

pub mod backoff;
pub mod ids;
pub mod types;

#[cfg(feature = "runtime")]
pub mod observability;

pub use backoff::{Backoff, BackoffPolicy};
pub use ids::RunId;
pub use types::{
    ActiveState, ConfigVariant, UnknownVariant, ACME_CHALLENGE_DIR, ACME_CHALLENGE_PREFIX,
    ACTIVE_FILE, BACKUP_FILE, LOCK_FILE,
};
