//! Chroot wrapper
//!
//! Transparently prepends a path prefix to every operation, isolating one
//! application's namespace from others sharing the ensemble. Returned
//! paths and watch events are translated back into the caller's view.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use beacon_common::Result;

use crate::acl::{Acl, AuthId};
use crate::client::{
    CreateMode, Ensemble, SessionId, SessionState, Watch, strip_chroot,
};

/// An [`Ensemble`] view rooted at a chroot prefix.
pub struct ChrootedEnsemble {
    inner: Arc<dyn Ensemble>,
    chroot: String,
}

impl ChrootedEnsemble {
    /// Wrap `inner` under `chroot`. The prefix must be a normalized
    /// absolute path other than `/`; the node itself must already exist.
    pub fn new(inner: Arc<dyn Ensemble>, chroot: impl Into<String>) -> Self {
        ChrootedEnsemble {
            inner,
            chroot: chroot.into(),
        }
    }

    fn full(&self, path: &str) -> String {
        if path == "/" {
            self.chroot.clone()
        } else {
            format!("{}{}", self.chroot, path)
        }
    }

    fn strip(&self, path: &str) -> String {
        strip_chroot(path, &self.chroot)
    }
}

#[async_trait]
impl Ensemble for ChrootedEnsemble {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: &[Acl],
    ) -> Result<String> {
        let created = self.inner.create(&self.full(path), data, mode, acl).await?;
        Ok(self.strip(&created))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(&self.full(path)).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(&self.full(path)).await
    }

    async fn watch_exists(&self, path: &str) -> Result<(bool, Watch)> {
        let (exists, watch) = self.inner.watch_exists(&self.full(path)).await?;
        Ok((exists, watch.with_strip_prefix(self.chroot.clone())))
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.get_data(&self.full(path)).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.inner.children(&self.full(path)).await
    }

    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let (children, watch) = self.inner.watch_children(&self.full(path)).await?;
        Ok((children, watch.with_strip_prefix(self.chroot.clone())))
    }

    async fn add_auth(&self, auth: AuthId) -> Result<()> {
        self.inner.add_auth(auth).await
    }

    fn session_id(&self) -> SessionId {
        self.inner.session_id()
    }

    fn session_state(&self) -> SessionState {
        self.inner.session_state()
    }

    fn session_events(&self) -> broadcast::Receiver<SessionState> {
        self.inner.session_events()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::acl::open_unsafe;
    use crate::client::EventKind;
    use crate::embedded::EmbeddedEnsemble;

    #[tokio::test]
    async fn test_chrooted_view() {
        let server = EmbeddedEnsemble::new();
        let raw = server.connect(Duration::from_secs(10));
        raw.create("/chroot", b"", CreateMode::Persistent, &open_unsafe())
            .await
            .unwrap();

        let session: Arc<dyn Ensemble> = server.connect(Duration::from_secs(10));
        let chrooted = ChrootedEnsemble::new(session, "/chroot");

        chrooted
            .create("/group", b"", CreateMode::Persistent, &open_unsafe())
            .await
            .unwrap();
        let created = chrooted
            .create(
                "/group/member-",
                b"m",
                CreateMode::EphemeralSequential,
                &open_unsafe(),
            )
            .await
            .unwrap();
        assert_eq!(created, "/group/member-0000000000");

        // visible at the raw path outside the chroot
        assert!(raw.exists("/chroot/group/member-0000000000").await.unwrap());
        assert_eq!(chrooted.children("/group").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_chrooted_watch_paths() {
        let server = EmbeddedEnsemble::new();
        let raw = server.connect(Duration::from_secs(10));
        raw.create("/chroot", b"", CreateMode::Persistent, &open_unsafe())
            .await
            .unwrap();

        let session: Arc<dyn Ensemble> = server.connect(Duration::from_secs(10));
        let chrooted = ChrootedEnsemble::new(session, "/chroot");
        chrooted
            .create("/group", b"", CreateMode::Persistent, &open_unsafe())
            .await
            .unwrap();

        let (children, watch) = chrooted.watch_children("/group").await.unwrap();
        assert!(children.is_empty());

        raw.create(
            "/chroot/group/member-",
            b"",
            CreateMode::EphemeralSequential,
            &open_unsafe(),
        )
        .await
        .unwrap();

        let event = watch.changed().await;
        assert_eq!(event.kind, EventKind::ChildrenChanged);
        assert_eq!(event.path, "/group");
    }
}
