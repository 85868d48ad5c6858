//! Discovery module assembly
//!
//! The composition root: wires configuration, ACL policy, connector, and
//! shutdown registry into a client factory, then hands out elector/monitor
//! pairs over one shared client handle. Missing inputs fail assembly with
//! `Config`; invalid inputs (an empty ACL list) fail with
//! `IllegalArgument`, so a forgotten binding and a bad binding are
//! distinguishable at startup.

use std::sync::Arc;

use tracing::info;

use beacon_common::{DiscoveryError, Result, normalize_path};
use beacon_ensemble::{Acl, EnsembleConnector};

use crate::acl::SingleAclPolicy;
use crate::config::ClusterConfig;
use crate::elector::LeaderElector;
use crate::factory::{ClientFactory, ClientHandle};
use crate::monitor::GroupMembershipMonitor;
use crate::shutdown::ShutdownRegistry;

/// Entry point for leader election and group discovery.
pub struct DiscoveryModule {
    factory: ClientFactory,
    shutdown: ShutdownRegistry,
}

impl std::fmt::Debug for DiscoveryModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryModule")
            .field("factory", &self.factory)
            .finish_non_exhaustive()
    }
}

impl DiscoveryModule {
    pub fn builder() -> DiscoveryModuleBuilder {
        DiscoveryModuleBuilder::default()
    }

    /// An elector and a membership monitor sharing this module's client,
    /// both rooted at `discovery_path`.
    pub fn services(
        &self,
        discovery_path: &str,
    ) -> Result<(LeaderElector, GroupMembershipMonitor)> {
        let path = normalize_path(discovery_path)?;
        if path == "/" {
            return Err(DiscoveryError::IllegalArgument(
                "discovery path must not be the root".to_string(),
            ));
        }
        let handle = self.factory.handle()?;
        info!("assembled discovery services for {}", path);
        Ok((
            LeaderElector::new(handle.clone(), path.clone()),
            GroupMembershipMonitor::new(handle, path),
        ))
    }

    /// The shared client handle, for callers needing raw ensemble access.
    pub fn handle(&self) -> Result<Arc<ClientHandle>> {
        self.factory.handle()
    }

    pub fn config(&self) -> &ClusterConfig {
        self.factory.config()
    }

    /// The registry whose `execute` tears this module down.
    pub fn shutdown_registry(&self) -> &ShutdownRegistry {
        &self.shutdown
    }
}

/// Builder for [`DiscoveryModule`].
#[derive(Default)]
pub struct DiscoveryModuleBuilder {
    config: Option<ClusterConfig>,
    acl: Option<Vec<Acl>>,
    connector: Option<Arc<dyn EnsembleConnector>>,
    shutdown: Option<ShutdownRegistry>,
}

impl DiscoveryModuleBuilder {
    pub fn config(mut self, config: ClusterConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// ACL applied to every node the module creates. Required.
    pub fn acl(mut self, acl: Vec<Acl>) -> Self {
        self.acl = Some(acl);
        self
    }

    /// Connector used to reach the ensemble. Required for remote
    /// configurations; `in_process` configurations default to the embedded
    /// ensemble.
    pub fn connector(mut self, connector: Arc<dyn EnsembleConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownRegistry) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn build(self) -> Result<DiscoveryModule> {
        let config = self.config.ok_or_else(|| {
            DiscoveryError::Config("missing cluster configuration".to_string())
        })?;
        let acl = self
            .acl
            .ok_or_else(|| DiscoveryError::Config("missing ACL list".to_string()))?;
        let policy = Arc::new(SingleAclPolicy::new(acl)?);
        let shutdown = self.shutdown.unwrap_or_default();

        let factory = match self.connector {
            Some(connector) => {
                ClientFactory::with_connector(config, policy, connector, shutdown.clone())?
            }
            None => ClientFactory::new(config, policy, shutdown.clone())?,
        };
        Ok(DiscoveryModule { factory, shutdown })
    }
}
