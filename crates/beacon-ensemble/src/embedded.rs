//! Embedded in-process single-node ensemble
//!
//! Backs `in_process` deployments and tests with the same node, ACL and
//! session semantics a remote ensemble provides: per-parent sequence
//! counters, ephemeral ownership, one-shot watches, and session
//! expiry/close deleting all ephemeral nodes the session created.
//! `expire_session` is the fault-injection hook tests use to simulate
//! session loss.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

use beacon_common::{DiscoveryError, Result, parent_path};

use crate::acl::{Acl, AuthId, perms};
use crate::client::{
    ConnectSpec, CreateMode, Ensemble, EnsembleConnector, EventKind, SessionId, SessionState,
    Watch, WatchedEvent,
};

const SESSION_EVENT_CAPACITY: usize = 16;

struct ZNode {
    data: Vec<u8>,
    acl: Vec<Acl>,
    owner: Option<SessionId>,
    next_seq: u64,
}

struct SessionRec {
    state: SessionState,
    timeout: Duration,
    auths: Vec<AuthId>,
    ephemerals: BTreeSet<String>,
    events: broadcast::Sender<SessionState>,
}

struct Inner {
    nodes: BTreeMap<String, ZNode>,
    sessions: HashMap<u64, SessionRec>,
    child_watches: HashMap<String, Vec<oneshot::Sender<WatchedEvent>>>,
    exists_watches: HashMap<String, Vec<oneshot::Sender<WatchedEvent>>>,
}

impl Inner {
    fn fire_exists(&mut self, path: &str, kind: EventKind) {
        if let Some(senders) = self.exists_watches.remove(path) {
            for tx in senders {
                let _ = tx.send(WatchedEvent {
                    kind,
                    path: path.to_string(),
                });
            }
        }
    }

    fn fire_children(&mut self, parent: &str) {
        if let Some(senders) = self.child_watches.remove(parent) {
            for tx in senders {
                let _ = tx.send(WatchedEvent {
                    kind: EventKind::ChildrenChanged,
                    path: parent.to_string(),
                });
            }
        }
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect()
    }

    fn live_session(&self, id: SessionId) -> Result<&SessionRec> {
        match self.sessions.get(&id.0) {
            Some(rec) if rec.state == SessionState::Connected => Ok(rec),
            Some(_) | None => Err(DiscoveryError::SessionExpired),
        }
    }
}

/// Checks an ACL against the identities a session has presented.
fn check_acl(acl: &[Acl], auths: &[AuthId], needed: u32, path: &str) -> Result<()> {
    for entry in acl {
        if !entry.grants(needed) {
            continue;
        }
        let matched = match entry.scheme.as_str() {
            "world" => entry.id == "anyone",
            "auth" => !auths.is_empty(),
            "digest" => auths
                .iter()
                .any(|a| a.scheme == "digest" && a.id == entry.id),
            _ => false,
        };
        if matched {
            return Ok(());
        }
    }
    Err(DiscoveryError::AccessDenied(path.to_string()))
}

fn validate_node_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.len() < 2 {
        return Err(DiscoveryError::IllegalArgument(format!(
            "invalid node path: {path}"
        )));
    }
    if path.ends_with('/') || path[1..].split('/').any(str::is_empty) {
        return Err(DiscoveryError::IllegalArgument(format!(
            "invalid node path: {path}"
        )));
    }
    Ok(())
}

/// An embedded single-node coordination ensemble.
///
/// One instance is the whole "cluster"; sessions are handed out by
/// [`EmbeddedEnsemble::connect`] and share the node tree.
pub struct EmbeddedEnsemble {
    inner: Mutex<Inner>,
    next_session: AtomicU64,
}

impl EmbeddedEnsemble {
    pub fn new() -> Arc<Self> {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            ZNode {
                data: Vec::new(),
                acl: crate::acl::open_unsafe(),
                owner: None,
                next_seq: 0,
            },
        );
        Arc::new(EmbeddedEnsemble {
            inner: Mutex::new(Inner {
                nodes,
                sessions: HashMap::new(),
                child_watches: HashMap::new(),
                exists_watches: HashMap::new(),
            }),
            next_session: AtomicU64::new(1),
        })
    }

    /// Establish a new session.
    pub fn connect(self: &Arc<Self>, timeout: Duration) -> Arc<EmbeddedSession> {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::SeqCst));
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        self.inner.lock().sessions.insert(
            id.0,
            SessionRec {
                state: SessionState::Connected,
                timeout,
                auths: Vec::new(),
                ephemerals: BTreeSet::new(),
                events: events.clone(),
            },
        );
        debug!("embedded ensemble session {} established", id);
        Arc::new(EmbeddedSession {
            server: self.clone(),
            id,
            events,
        })
    }

    /// Force-expire a session, deleting its ephemeral nodes and notifying
    /// its watchers. The fault-injection hook for session-loss tests.
    pub fn expire_session(&self, id: SessionId) {
        info!("expiring embedded ensemble session {}", id);
        self.end_session(id, SessionState::Expired);
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|rec| rec.state == SessionState::Connected)
            .count()
    }

    fn end_session(&self, id: SessionId, terminal: SessionState) {
        let mut g = self.inner.lock();
        let Some(rec) = g.sessions.get_mut(&id.0) else {
            return;
        };
        if rec.state.is_terminal() {
            return;
        }
        rec.state = terminal;
        let ephemerals = std::mem::take(&mut rec.ephemerals);
        // the owner learns of its loss no later than sibling watchers:
        // terminal notification first, ephemeral deletions after
        let _ = rec.events.send(terminal);
        for path in ephemerals {
            if g.nodes.remove(&path).is_some() {
                g.fire_exists(&path, EventKind::NodeDeleted);
                if let Some(parent) = parent_path(&path) {
                    g.fire_children(&parent);
                }
            }
        }
    }

    fn session_state(&self, id: SessionId) -> SessionState {
        self.inner
            .lock()
            .sessions
            .get(&id.0)
            .map(|rec| rec.state)
            .unwrap_or(SessionState::Closed)
    }

    fn session_timeout(&self, id: SessionId) -> Option<Duration> {
        self.inner.lock().sessions.get(&id.0).map(|rec| rec.timeout)
    }

    fn create(
        &self,
        sid: SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: &[Acl],
    ) -> Result<String> {
        validate_node_path(path)?;
        if acl.is_empty() {
            return Err(DiscoveryError::IllegalArgument(
                "ACL list must not be empty".to_string(),
            ));
        }
        let mut g = self.inner.lock();
        let auths = g.live_session(sid)?.auths.clone();
        let parent = parent_path(path).ok_or_else(|| {
            DiscoveryError::IllegalArgument("cannot create the root node".to_string())
        })?;
        let Some(parent_node) = g.nodes.get_mut(&parent) else {
            return Err(DiscoveryError::NoNode(parent));
        };
        check_acl(&parent_node.acl, &auths, perms::CREATE, path)?;
        let final_path = if mode.is_sequential() {
            let seq = parent_node.next_seq;
            parent_node.next_seq += 1;
            format!("{path}{seq:010}")
        } else {
            path.to_string()
        };
        if g.nodes.contains_key(&final_path) {
            return Err(DiscoveryError::NodeExists(final_path));
        }
        let owner = mode.is_ephemeral().then_some(sid);
        g.nodes.insert(
            final_path.clone(),
            ZNode {
                data: data.to_vec(),
                acl: acl.to_vec(),
                owner,
                next_seq: 0,
            },
        );
        if owner.is_some()
            && let Some(rec) = g.sessions.get_mut(&sid.0)
        {
            rec.ephemerals.insert(final_path.clone());
        }
        g.fire_exists(&final_path, EventKind::NodeCreated);
        g.fire_children(&parent);
        Ok(final_path)
    }

    fn delete(&self, sid: SessionId, path: &str) -> Result<()> {
        validate_node_path(path)?;
        let mut g = self.inner.lock();
        let auths = g.live_session(sid)?.auths.clone();
        if !g.nodes.contains_key(path) {
            return Err(DiscoveryError::NoNode(path.to_string()));
        }
        if !g.child_names(path).is_empty() {
            return Err(DiscoveryError::NotEmpty(path.to_string()));
        }
        // Delete permission lives on the parent, as in ZooKeeper.
        let parent = parent_path(path)
            .ok_or_else(|| DiscoveryError::IllegalArgument("cannot delete the root".to_string()))?;
        if let Some(parent_node) = g.nodes.get(&parent) {
            check_acl(&parent_node.acl, &auths, perms::DELETE, path)?;
        }
        let removed = g.nodes.remove(path);
        if let Some(node) = removed
            && let Some(owner) = node.owner
            && let Some(rec) = g.sessions.get_mut(&owner.0)
        {
            rec.ephemerals.remove(path);
        }
        g.fire_exists(path, EventKind::NodeDeleted);
        g.fire_children(&parent);
        Ok(())
    }

    fn exists(&self, sid: SessionId, path: &str) -> Result<bool> {
        let g = self.inner.lock();
        g.live_session(sid)?;
        Ok(g.nodes.contains_key(path))
    }

    fn watch_exists(&self, sid: SessionId, path: &str) -> Result<(bool, Watch)> {
        let mut g = self.inner.lock();
        g.live_session(sid)?;
        let exists = g.nodes.contains_key(path);
        let (tx, rx) = oneshot::channel();
        g.exists_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok((exists, Watch::new(rx, path)))
    }

    fn get_data(&self, sid: SessionId, path: &str) -> Result<Vec<u8>> {
        let g = self.inner.lock();
        let auths = g.live_session(sid)?.auths.clone();
        let Some(node) = g.nodes.get(path) else {
            return Err(DiscoveryError::NoNode(path.to_string()));
        };
        check_acl(&node.acl, &auths, perms::READ, path)?;
        Ok(node.data.clone())
    }

    fn children(&self, sid: SessionId, path: &str) -> Result<Vec<String>> {
        let g = self.inner.lock();
        let auths = g.live_session(sid)?.auths.clone();
        let Some(node) = g.nodes.get(path) else {
            return Err(DiscoveryError::NoNode(path.to_string()));
        };
        check_acl(&node.acl, &auths, perms::READ, path)?;
        Ok(g.child_names(path))
    }

    fn watch_children(&self, sid: SessionId, path: &str) -> Result<(Vec<String>, Watch)> {
        let mut g = self.inner.lock();
        let auths = g.live_session(sid)?.auths.clone();
        let Some(node) = g.nodes.get(path) else {
            return Err(DiscoveryError::NoNode(path.to_string()));
        };
        check_acl(&node.acl, &auths, perms::READ, path)?;
        let children = g.child_names(path);
        let (tx, rx) = oneshot::channel();
        g.child_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok((children, Watch::new(rx, path)))
    }

    fn add_auth(&self, sid: SessionId, auth: AuthId) -> Result<()> {
        let mut g = self.inner.lock();
        let Some(rec) = g.sessions.get_mut(&sid.0) else {
            return Err(DiscoveryError::SessionExpired);
        };
        if rec.state != SessionState::Connected {
            return Err(DiscoveryError::SessionExpired);
        }
        if !rec.auths.contains(&auth) {
            rec.auths.push(auth);
        }
        Ok(())
    }
}

/// One session against an [`EmbeddedEnsemble`].
pub struct EmbeddedSession {
    server: Arc<EmbeddedEnsemble>,
    id: SessionId,
    events: broadcast::Sender<SessionState>,
}

impl EmbeddedSession {
    pub fn server(&self) -> &Arc<EmbeddedEnsemble> {
        &self.server
    }

    /// The negotiated session timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.server.session_timeout(self.id)
    }
}

#[async_trait]
impl Ensemble for EmbeddedSession {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: &[Acl],
    ) -> Result<String> {
        self.server.create(self.id, path, data, mode, acl)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.server.delete(self.id, path)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.server.exists(self.id, path)
    }

    async fn watch_exists(&self, path: &str) -> Result<(bool, Watch)> {
        self.server.watch_exists(self.id, path)
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.server.get_data(self.id, path)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.server.children(self.id, path)
    }

    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        self.server.watch_children(self.id, path)
    }

    async fn add_auth(&self, auth: AuthId) -> Result<()> {
        self.server.add_auth(self.id, auth)
    }

    fn session_id(&self) -> SessionId {
        self.id
    }

    fn session_state(&self) -> SessionState {
        self.server.session_state(self.id)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionState> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.server.end_session(self.id, SessionState::Closed);
        Ok(())
    }
}

/// Connector handing out sessions on an embedded ensemble.
pub struct EmbeddedConnector {
    server: Arc<EmbeddedEnsemble>,
}

impl EmbeddedConnector {
    /// Connector backed by a fresh, private ensemble.
    pub fn new() -> Self {
        EmbeddedConnector {
            server: EmbeddedEnsemble::new(),
        }
    }

    /// Connector sharing an existing ensemble, so several client handles
    /// (distinct sessions) observe the same namespace.
    pub fn shared(server: Arc<EmbeddedEnsemble>) -> Self {
        EmbeddedConnector { server }
    }

    pub fn server(&self) -> &Arc<EmbeddedEnsemble> {
        &self.server
    }
}

impl Default for EmbeddedConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnsembleConnector for EmbeddedConnector {
    async fn connect(&self, spec: &ConnectSpec) -> Result<Arc<dyn Ensemble>> {
        let session = self.server.connect(spec.session_timeout);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{everyone_read_creator_all, open_unsafe};

    fn timeout() -> Duration {
        Duration::from_secs(10)
    }

    #[tokio::test]
    async fn test_create_and_children() {
        let server = EmbeddedEnsemble::new();
        let session = server.connect(timeout());

        session
            .create("/group", b"", CreateMode::Persistent, &open_unsafe())
            .await
            .unwrap();
        let first = session
            .create(
                "/group/member-",
                b"a",
                CreateMode::EphemeralSequential,
                &open_unsafe(),
            )
            .await
            .unwrap();
        let second = session
            .create(
                "/group/member-",
                b"b",
                CreateMode::EphemeralSequential,
                &open_unsafe(),
            )
            .await
            .unwrap();

        assert_eq!(first, "/group/member-0000000000");
        assert_eq!(second, "/group/member-0000000001");
        assert_eq!(
            session.children("/group").await.unwrap(),
            vec!["member-0000000000", "member-0000000001"]
        );
        assert_eq!(session.get_data(&first).await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_create_under_missing_parent() {
        let server = EmbeddedEnsemble::new();
        let session = server.connect(timeout());

        let err = session
            .create("/missing/node", b"", CreateMode::Ephemeral, &open_unsafe())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::NoNode(_)));
    }

    #[tokio::test]
    async fn test_empty_acl_rejected() {
        let server = EmbeddedEnsemble::new();
        let session = server.connect(timeout());

        let err = session
            .create("/node", b"", CreateMode::Persistent, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::IllegalArgument(_)));
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let server = EmbeddedEnsemble::new();
        let session = server.connect(timeout());

        session
            .create("/a", b"", CreateMode::Persistent, &open_unsafe())
            .await
            .unwrap();
        session
            .create("/a/b", b"", CreateMode::Persistent, &open_unsafe())
            .await
            .unwrap();

        let err = session.delete("/a").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NotEmpty(_)));

        session.delete("/a/b").await.unwrap();
        session.delete("/a").await.unwrap();

        let err = session.delete("/a").await.unwrap_err();
        assert!(err.is_no_node());
    }

    #[tokio::test]
    async fn test_expiry_deletes_ephemerals_and_fires_watches() {
        let server = EmbeddedEnsemble::new();
        let owner = server.connect(timeout());
        let observer = server.connect(timeout());

        owner
            .create("/group", b"", CreateMode::Persistent, &open_unsafe())
            .await
            .unwrap();
        let node = owner
            .create(
                "/group/member-",
                b"",
                CreateMode::EphemeralSequential,
                &open_unsafe(),
            )
            .await
            .unwrap();

        let (children, watch) = observer.watch_children("/group").await.unwrap();
        assert_eq!(children.len(), 1);

        let mut owner_events = owner.session_events();
        server.expire_session(owner.session_id());

        // the terminal notification is already delivered when expiry
        // returns, not deferred behind the watch events
        assert_eq!(owner_events.try_recv().unwrap(), SessionState::Expired);

        let event = watch.changed().await;
        assert_eq!(event.kind, EventKind::ChildrenChanged);
        assert!(!observer.exists(&node).await.unwrap());
        assert_eq!(owner.session_state(), SessionState::Expired);

        // operations on the expired session fail
        let err = owner.children("/group").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::SessionExpired));
    }

    #[tokio::test]
    async fn test_close_deletes_ephemerals() {
        let server = EmbeddedEnsemble::new();
        let owner = server.connect(timeout());
        let observer = server.connect(timeout());

        owner
            .create("/group", b"", CreateMode::Persistent, &open_unsafe())
            .await
            .unwrap();
        let node = owner
            .create("/group/me", b"", CreateMode::Ephemeral, &open_unsafe())
            .await
            .unwrap();
        owner.close().await.unwrap();

        assert!(!observer.exists(&node).await.unwrap());
        assert_eq!(server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_acl_enforcement() {
        let server = EmbeddedEnsemble::new();
        let creator = server.connect(timeout());
        let stranger = server.connect(timeout());

        creator
            .add_auth(AuthId::digest("test", "user"))
            .await
            .unwrap();
        creator
            .create("/locked", b"", CreateMode::Persistent, &everyone_read_creator_all())
            .await
            .unwrap();

        // anyone may read
        assert_eq!(stranger.children("/locked").await.unwrap().len(), 0);

        // unauthenticated sessions may not create below it
        let err = stranger
            .create("/locked/x", b"", CreateMode::Ephemeral, &open_unsafe())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::AccessDenied(_)));

        // authenticated sessions may
        stranger
            .add_auth(AuthId::digest("other", "identity"))
            .await
            .unwrap();
        stranger
            .create("/locked/x", b"", CreateMode::Ephemeral, &open_unsafe())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sequence_not_reused_after_delete() {
        let server = EmbeddedEnsemble::new();
        let session = server.connect(timeout());

        session
            .create("/g", b"", CreateMode::Persistent, &open_unsafe())
            .await
            .unwrap();
        let first = session
            .create("/g/n-", b"", CreateMode::EphemeralSequential, &open_unsafe())
            .await
            .unwrap();
        session.delete(&first).await.unwrap();
        let second = session
            .create("/g/n-", b"", CreateMode::EphemeralSequential, &open_unsafe())
            .await
            .unwrap();

        assert_eq!(second, "/g/n-0000000001");
    }
}
