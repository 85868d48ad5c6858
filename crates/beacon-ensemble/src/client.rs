//! Client-facing types and traits for the coordination ensemble
//!
//! `Ensemble` is the capability this subsystem consumes: session-scoped
//! node creation, child listing and one-shot watches. `EnsembleConnector`
//! is the seam through which a concrete client library (or the embedded
//! ensemble) is plugged in; the connector's client owns transport-level
//! reconnection, this layer only re-authenticates per established session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

use beacon_common::Result;

use crate::acl::{Acl, AuthId};

/// Ensemble-assigned session identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Lifecycle state of a client session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Session is live; ephemeral nodes are retained.
    Connected,
    /// Transport lost but the session may still be renewed.
    Suspended,
    /// Session timed out; all its ephemeral nodes are deleted.
    Expired,
    /// Session closed gracefully; ephemeral nodes are deleted.
    Closed,
}

impl SessionState {
    /// Whether the session is gone for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Expired | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connected => "CONNECTED",
            SessionState::Suspended => "SUSPENDED",
            SessionState::Expired => "EXPIRED",
            SessionState::Closed => "CLOSED",
        };
        write!(f, "{s}")
    }
}

/// Node creation mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Kind of change a watch fired for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    ChildrenChanged,
}

/// A fired watch notification.
#[derive(Clone, Debug)]
pub struct WatchedEvent {
    pub kind: EventKind,
    pub path: String,
}

/// A one-shot watch registered against a node or its children.
///
/// If the delivery channel is torn down (session loss) before the watch
/// fires, `changed` resolves to a synthetic `ChildrenChanged` event so the
/// consumer re-reads instead of going stale.
pub struct Watch {
    rx: oneshot::Receiver<WatchedEvent>,
    path: String,
    strip: Option<String>,
}

impl Watch {
    pub fn new(rx: oneshot::Receiver<WatchedEvent>, path: impl Into<String>) -> Self {
        Watch {
            rx,
            path: path.into(),
            strip: None,
        }
    }

    /// Strip a chroot prefix from the delivered event path.
    pub fn with_strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip = Some(prefix.into());
        self
    }

    /// Wait for the watch to fire.
    pub async fn changed(self) -> WatchedEvent {
        let mut event = match self.rx.await {
            Ok(event) => event,
            Err(_) => WatchedEvent {
                kind: EventKind::ChildrenChanged,
                path: self.path,
            },
        };
        if let Some(prefix) = &self.strip {
            event.path = strip_chroot(&event.path, prefix);
        }
        event
    }
}

pub(crate) fn strip_chroot(path: &str, chroot: &str) -> String {
    if path == chroot {
        "/".to_string()
    } else if let Some(rest) = path.strip_prefix(chroot)
        && rest.starts_with('/')
    {
        rest.to_string()
    } else {
        path.to_string()
    }
}

/// What a connector needs to establish one session.
#[derive(Clone, Debug)]
pub struct ConnectSpec {
    /// `host:port` endpoints of the ensemble members.
    pub endpoints: Vec<String>,
    /// Session is presumed dead when no heartbeat succeeds in this window.
    pub session_timeout: Duration,
    /// Identity to present on the session, when configured.
    pub auth: Option<AuthId>,
}

/// A live, session-scoped client to the coordination ensemble.
///
/// Within one session, creates and deletes are observed in the order
/// issued; sequence suffixes are ensemble-assigned and unique per parent.
#[async_trait]
pub trait Ensemble: Send + Sync {
    /// Create a node. For sequential modes the given path is a prefix and
    /// the returned path carries the assigned sequence suffix.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode, acl: &[Acl])
    -> Result<String>;

    /// Delete a node. Fails with `NoNode` if absent, `NotEmpty` if it has
    /// children.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Whether a node exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Existence check plus a one-shot watch fired on the node's next
    /// creation or deletion.
    async fn watch_exists(&self, path: &str) -> Result<(bool, Watch)>;

    /// Read a node's data.
    async fn get_data(&self, path: &str) -> Result<Vec<u8>>;

    /// List child names of a node.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Child listing plus a one-shot watch fired on the next child change.
    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    /// Present an authentication identity on this session.
    async fn add_auth(&self, auth: AuthId) -> Result<()>;

    fn session_id(&self) -> SessionId;

    fn session_state(&self) -> SessionState;

    /// Subscribe to session lifecycle transitions.
    fn session_events(&self) -> broadcast::Receiver<SessionState>;

    /// Close the session, deleting its ephemeral nodes.
    async fn close(&self) -> Result<()>;
}

/// Connector seam through which a concrete ensemble client is plugged in.
///
/// Each call establishes a fresh session; callers re-present credentials
/// per session via [`Ensemble::add_auth`].
#[async_trait]
pub trait EnsembleConnector: Send + Sync {
    async fn connect(&self, spec: &ConnectSpec) -> Result<Arc<dyn Ensemble>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mode() {
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(CreateMode::Ephemeral.is_ephemeral());
        assert!(!CreateMode::Ephemeral.is_sequential());
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(CreateMode::PersistentSequential.is_sequential());
    }

    #[test]
    fn test_strip_chroot() {
        assert_eq!(strip_chroot("/chroot/a/b", "/chroot"), "/a/b");
        assert_eq!(strip_chroot("/chroot", "/chroot"), "/");
        assert_eq!(strip_chroot("/other/a", "/chroot"), "/other/a");
        assert_eq!(strip_chroot("/chrooted/a", "/chroot"), "/chrooted/a");
    }

    #[tokio::test]
    async fn test_watch_dropped_sender_forces_reread() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        drop(tx);
        let watch = Watch::new(rx, "/group");
        let event = watch.changed().await;
        assert_eq!(event.kind, EventKind::ChildrenChanged);
        assert_eq!(event.path, "/group");
    }

    #[test]
    fn test_session_state_terminal() {
        assert!(SessionState::Expired.is_terminal());
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Connected.is_terminal());
        assert!(!SessionState::Suspended.is_terminal());
    }
}
