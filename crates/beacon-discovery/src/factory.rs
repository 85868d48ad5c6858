//! Client factory and shared client handle
//!
//! `ClientFactory` produces exactly one `ClientHandle` per factory and
//! registers its teardown with the shutdown registry, so the session is
//! closed exactly once no matter how many elector/monitor pairs share it.
//!
//! Session establishment is lazy: constructing the handle never dials, the
//! first ensemble round-trip does. Once a session expires, the next
//! operation establishes a fresh one through the connector and re-presents
//! the configured credentials; transport-level reconnects within a live
//! session belong to the connector's client library.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use beacon_common::{DiscoveryError, Result};
use beacon_ensemble::{
    Acl, ChrootedEnsemble, ConnectSpec, CreateMode, EmbeddedConnector, Ensemble,
    EnsembleConnector, SessionId, SessionState, Watch,
};

use crate::acl::AclPolicy;
use crate::config::ClusterConfig;
use crate::shutdown::ShutdownRegistry;

const SESSION_EVENT_CAPACITY: usize = 64;

/// Builds the one shared [`ClientHandle`] for a cluster configuration.
pub struct ClientFactory {
    config: ClusterConfig,
    acl: Arc<dyn AclPolicy>,
    connector: Arc<dyn EnsembleConnector>,
    shutdown: ShutdownRegistry,
    handle: parking_lot::Mutex<Option<Arc<ClientHandle>>>,
}

impl std::fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ClientFactory {
    /// Factory with the default connector: embedded for `in_process`
    /// configurations. Remote configurations must supply the client
    /// library adapter via [`ClientFactory::with_connector`].
    pub fn new(
        config: ClusterConfig,
        acl: Arc<dyn AclPolicy>,
        shutdown: ShutdownRegistry,
    ) -> Result<Self> {
        if !config.in_process {
            return Err(DiscoveryError::Config(
                "remote cluster requires an ensemble connector".to_string(),
            ));
        }
        let connector = Arc::new(EmbeddedConnector::new());
        Self::with_connector(config, acl, connector, shutdown)
    }

    pub fn with_connector(
        config: ClusterConfig,
        acl: Arc<dyn AclPolicy>,
        connector: Arc<dyn EnsembleConnector>,
        shutdown: ShutdownRegistry,
    ) -> Result<Self> {
        Ok(ClientFactory {
            config,
            acl,
            connector,
            shutdown,
            handle: parking_lot::Mutex::new(None),
        })
    }

    /// The shared handle, created on first call. Exactly one teardown
    /// action is registered per factory.
    pub fn handle(&self) -> Result<Arc<ClientHandle>> {
        let mut guard = self.handle.lock();
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }
        let handle = Arc::new(ClientHandle::new(
            self.config.clone(),
            self.acl.clone(),
            self.connector.clone(),
        ));
        let teardown = handle.clone();
        self.shutdown.register(move || async move {
            teardown.close().await;
        });
        info!(
            members = %self.config.members.len(),
            chroot = self.config.chroot.as_deref().unwrap_or("/"),
            in_process = self.config.in_process,
            "created coordination client handle"
        );
        *guard = Some(handle.clone());
        Ok(handle)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }
}

/// One shared, lazily-connected client to the coordination ensemble.
///
/// All operations are safe to call concurrently; the handle owns session
/// re-establishment and credential re-presentation. Only the factory's
/// shutdown action closes it.
pub struct ClientHandle {
    config: ClusterConfig,
    acl: Arc<dyn AclPolicy>,
    connector: Arc<dyn EnsembleConnector>,
    session: tokio::sync::Mutex<Option<Arc<dyn Ensemble>>>,
    session_events: broadcast::Sender<SessionState>,
    closed: AtomicBool,
}

impl ClientHandle {
    fn new(
        config: ClusterConfig,
        acl: Arc<dyn AclPolicy>,
        connector: Arc<dyn EnsembleConnector>,
    ) -> Self {
        let (session_events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        ClientHandle {
            config,
            acl,
            connector,
            session: tokio::sync::Mutex::new(None),
            session_events,
            closed: AtomicBool::new(false),
        }
    }

    fn connect_spec(&self) -> ConnectSpec {
        ConnectSpec {
            endpoints: self.config.members.iter().map(|m| m.to_string()).collect(),
            session_timeout: self.config.session_timeout,
            auth: self.config.credentials.as_ref().map(|c| c.auth_id()),
        }
    }

    /// The current live session, establishing one if none exists or the
    /// previous one ended.
    async fn session(&self) -> Result<Arc<dyn Ensemble>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Connection(
                "client handle is closed".to_string(),
            ));
        }
        let mut guard = self.session.lock().await;
        if let Some(current) = guard.as_ref() {
            if !current.session_state().is_terminal() {
                return Ok(current.clone());
            }
            warn!(
                "session {} ended, establishing a fresh one",
                current.session_id()
            );
            metrics::counter!("beacon_session_reestablished_total").increment(1);
        }

        let raw = self.connector.connect(&self.connect_spec()).await?;
        if let Some(credentials) = &self.config.credentials {
            raw.add_auth(credentials.auth_id()).await?;
        }
        let ensemble: Arc<dyn Ensemble> = match &self.config.chroot {
            Some(chroot) => {
                ensure_segments(raw.as_ref(), chroot, self.acl.default_acl()).await?;
                Arc::new(ChrootedEnsemble::new(raw, chroot.clone()))
            }
            None => raw,
        };
        debug!("established ensemble session {}", ensemble.session_id());

        // Forward this session's lifecycle into the handle-level stream so
        // electors and monitors observe expiry across re-establishment.
        let mut source = ensemble.session_events();
        let sink = self.session_events.clone();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(state) => {
                        let terminal = state.is_terminal();
                        let _ = sink.send(state);
                        if terminal {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *guard = Some(ensemble.clone());
        Ok(ensemble)
    }

    /// Drop the cached session if it is still `stale`, so the next
    /// operation establishes a fresh one.
    async fn invalidate(&self, stale: &Arc<dyn Ensemble>) {
        let mut guard = self.session.lock().await;
        if let Some(current) = guard.as_ref()
            && Arc::ptr_eq(current, stale)
        {
            *guard = None;
        }
    }

    /// Run `op` against the current session. A session can expire between
    /// the liveness check and the operation; that single race is absorbed
    /// here by retrying once through a fresh session, so expiry never
    /// surfaces to callers as long as a new session can be established.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn Ensemble>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.session().await?;
        match op(session.clone()).await {
            Err(DiscoveryError::SessionExpired) => {
                warn!(
                    "session {} expired mid-operation, retrying on a fresh session",
                    session.session_id()
                );
                self.invalidate(&session).await;
                let session = self.session().await?;
                op(session).await
            }
            other => other,
        }
    }

    /// Subscribe to session lifecycle transitions across all sessions this
    /// handle establishes.
    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionState> {
        self.session_events.subscribe()
    }

    /// Identifier of the current session, establishing one if needed.
    pub async fn session_id(&self) -> Result<SessionId> {
        Ok(self.session().await?.session_id())
    }

    /// Create every missing segment of `path` as a persistent node.
    pub async fn ensure_path(&self, path: &str) -> Result<()> {
        self.run(|session| async move {
            ensure_segments_with(session.as_ref(), path, |segment| {
                self.acl.acl_for_path(segment).to_vec()
            })
            .await
        })
        .await
    }

    pub async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.run(|session| async move {
            session
                .create(path, data, mode, self.acl.acl_for_path(path))
                .await
        })
        .await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.run(|session| async move { session.delete(path).await })
            .await
    }

    pub async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.run(|session| async move { session.get_data(path).await })
            .await
    }

    pub async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.run(|session| async move { session.children(path).await })
            .await
    }

    pub async fn watch_children(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        self.run(|session| async move { session.watch_children(path).await })
            .await
    }

    pub async fn watch_exists(&self, path: &str) -> Result<(bool, Watch)> {
        self.run(|session| async move { session.watch_exists(path).await })
            .await
    }

    /// Close the handle and its live session. Idempotent; called by the
    /// shutdown registry.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            if let Err(e) = session.close().await {
                warn!("error closing ensemble session: {}", e);
            }
            info!("coordination client handle closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn ensure_segments(session: &dyn Ensemble, path: &str, acl: &[Acl]) -> Result<()> {
    ensure_segments_with(session, path, |_| acl.to_vec()).await
}

async fn ensure_segments_with(
    session: &dyn Ensemble,
    path: &str,
    acl_for: impl Fn(&str) -> Vec<Acl>,
) -> Result<()> {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        let acl = acl_for(&current);
        match session
            .create(&current, &[], CreateMode::Persistent, &acl)
            .await
        {
            Ok(_) => {}
            Err(DiscoveryError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
