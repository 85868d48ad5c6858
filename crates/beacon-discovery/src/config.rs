//! Cluster configuration
//!
//! Immutable description of the coordination ensemble, constructed once at
//! startup. Only the invariants this subsystem owns are enforced here
//! (non-empty member list, well-formed chroot); everything else is treated
//! as already-validated input from the configuration loader.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use beacon_common::{DiscoveryError, Result, normalize_path};
use beacon_ensemble::AuthId;

/// Default session timeout when none is configured.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// A host/port endpoint of an ensemble member.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            DiscoveryError::Config(format!("endpoint must be host:port, got '{s}'"))
        })?;
        if host.is_empty() {
            return Err(DiscoveryError::Config(format!(
                "endpoint has an empty host: '{s}'"
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| DiscoveryError::Config(format!("invalid port in endpoint '{s}'")))?;
        Ok(Endpoint::new(host, port))
    }
}

/// Authentication identity presented on every connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub scheme: String,
    pub identity: String,
}

impl Credentials {
    /// Digest credentials from a username and password.
    pub fn digest(user: &str, password: &str) -> Self {
        Credentials {
            scheme: "digest".to_string(),
            identity: format!("{user}:{password}"),
        }
    }

    pub(crate) fn auth_id(&self) -> AuthId {
        AuthId {
            scheme: self.scheme.clone(),
            id: self.identity.clone(),
        }
    }
}

/// Immutable description of the coordination ensemble.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Ensemble member endpoints. Never empty.
    pub members: Vec<Endpoint>,
    /// Path prefix under which all nodes are rooted. `None` shares the
    /// root namespace cluster-wide; callers then own path uniqueness.
    pub chroot: Option<String>,
    /// Connect to a locally-embedded single-node ensemble instead of
    /// `members`. Test-only deployment mode.
    pub in_process: bool,
    /// Session is presumed dead when no heartbeat succeeds in this window.
    pub session_timeout: Duration,
    /// Identity presented on every connection, when configured.
    pub credentials: Option<Credentials>,
}

impl ClusterConfig {
    pub fn new(
        members: Vec<Endpoint>,
        chroot: Option<String>,
        in_process: bool,
        session_timeout: Duration,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        if members.is_empty() {
            return Err(DiscoveryError::Config(
                "at least one ensemble member is required".to_string(),
            ));
        }
        let chroot = match chroot {
            Some(raw) => {
                let normalized = normalize_path(&raw)
                    .map_err(|e| DiscoveryError::Config(format!("invalid chroot: {e}")))?;
                // "/" is the shared root namespace, same as no chroot
                (normalized != "/").then_some(normalized)
            }
            None => None,
        };
        Ok(ClusterConfig {
            members,
            chroot,
            in_process,
            session_timeout,
            credentials,
        })
    }

    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Load from a `config` source. Recognized keys:
    /// `discovery.members` (comma-separated `host:port` list),
    /// `discovery.chroot`, `discovery.in_process`,
    /// `discovery.session.timeout.secs`,
    /// `discovery.digest.user` / `discovery.digest.password`.
    pub fn from_config(config: &config::Config) -> Result<Self> {
        let members = config
            .get_string("discovery.members")
            .map_err(|_| DiscoveryError::Config("missing discovery.members".to_string()))?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Endpoint::from_str)
            .collect::<Result<Vec<_>>>()?;

        let chroot = config.get_string("discovery.chroot").ok();
        let in_process = config.get_bool("discovery.in_process").unwrap_or(false);
        let session_timeout = config
            .get_int("discovery.session.timeout.secs")
            .map(|secs| Duration::from_secs(secs.max(0) as u64))
            .unwrap_or(DEFAULT_SESSION_TIMEOUT);

        let credentials = match (
            config.get_string("discovery.digest.user"),
            config.get_string("discovery.digest.password"),
        ) {
            (Ok(user), Ok(password)) => Some(Credentials::digest(&user, &password)),
            _ => None,
        };

        ClusterConfig::new(members, chroot, in_process, session_timeout, credentials)
    }
}

/// Builder for [`ClusterConfig`].
#[derive(Default)]
pub struct ClusterConfigBuilder {
    members: Vec<Endpoint>,
    chroot: Option<String>,
    in_process: bool,
    session_timeout: Option<Duration>,
    credentials: Option<Credentials>,
}

impl ClusterConfigBuilder {
    pub fn member(mut self, endpoint: Endpoint) -> Self {
        self.members.push(endpoint);
        self
    }

    pub fn members(mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        self.members.extend(endpoints);
        self
    }

    pub fn chroot(mut self, chroot: impl Into<String>) -> Self {
        self.chroot = Some(chroot.into());
        self
    }

    pub fn in_process(mut self, in_process: bool) -> Self {
        self.in_process = in_process;
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn build(self) -> Result<ClusterConfig> {
        ClusterConfig::new(
            self.members,
            self.chroot,
            self.in_process,
            self.session_timeout.unwrap_or(DEFAULT_SESSION_TIMEOUT),
            self.credentials,
        )
    }
}
