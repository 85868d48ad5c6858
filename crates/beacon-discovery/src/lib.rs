//! Beacon Discovery - Leader election and service-group discovery
//!
//! This crate provides the leadership/discovery substrate for a scheduler
//! cluster backed by a ZooKeeper-like coordination ensemble:
//! - `ClusterConfig`: immutable description of the ensemble
//! - `SingleAclPolicy`: uniform access control for the discovery subtree
//! - `ClientFactory` / `ClientHandle`: one shared, lazily-connected client
//!   per factory, torn down exactly once at shutdown
//! - `LeaderElector`: at-most-one-leader over a discovery path
//! - `GroupMembershipMonitor`: live member set with change notifications
//! - `DiscoveryModule`: the composition root wiring it all together

pub mod acl;
pub mod config;
pub mod elector;
pub mod factory;
pub mod member;
pub mod module;
pub mod monitor;
pub mod shutdown;

// Re-export commonly used types
pub use acl::{AclPolicy, SingleAclPolicy};
pub use config::{ClusterConfig, ClusterConfigBuilder, Credentials, Endpoint};
pub use elector::{ElectorState, LeaderElector, Leadership};
pub use factory::{ClientFactory, ClientHandle};
pub use member::MemberMetadata;
pub use module::{DiscoveryModule, DiscoveryModuleBuilder};
pub use monitor::{
    GroupMembershipMonitor, MembershipEvent, MembershipEventKind, MembershipHandle,
    MembershipListener,
};
pub use shutdown::ShutdownRegistry;

// Re-export error types
pub use beacon_common::{DiscoveryError, Result};
