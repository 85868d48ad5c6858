//! Beacon Common - Shared types and utilities
//!
//! This crate provides the foundational pieces used across all Beacon
//! components:
//! - Error types covering the discovery error taxonomy
//! - Path manipulation helpers for the coordination namespace
//! - Utility functions

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::{DiscoveryError, Result};
pub use utils::{join_path, local_ip, node_name, normalize_path, parent_path, sequence_of};
