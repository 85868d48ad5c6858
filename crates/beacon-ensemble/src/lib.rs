//! Beacon Ensemble - Coordination-service client capability
//!
//! This crate defines the interface boundary to a strongly-consistent,
//! ZooKeeper-like coordination ensemble:
//! - ACL model and preset lists
//! - Session, node and watch types
//! - The `Ensemble` client trait and the `EnsembleConnector` seam through
//!   which a concrete client library is plugged in
//! - A chroot wrapper isolating one application's namespace
//! - An embedded in-process single-node ensemble used for `in_process`
//!   deployments and tests

pub mod acl;
pub mod chroot;
pub mod client;
pub mod embedded;

// Re-export commonly used types
pub use acl::{Acl, AuthId, perms};
pub use chroot::ChrootedEnsemble;
pub use client::{
    ConnectSpec, CreateMode, Ensemble, EnsembleConnector, EventKind, SessionId, SessionState,
    Watch, WatchedEvent,
};
pub use embedded::{EmbeddedConnector, EmbeddedEnsemble, EmbeddedSession};
