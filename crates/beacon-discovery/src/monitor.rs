//! Group membership
//!
//! Presence within a service group is an ephemeral sequential record under
//! the group path; liveness tracking is delegated to the ensemble session.
//! The monitor watches the group's children and publishes coalesced
//! snapshots: consumers always receive the latest membership, never a
//! per-record delta stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use beacon_common::{DiscoveryError, Result, join_path};
use beacon_ensemble::{CreateMode, SessionState};

use crate::factory::ClientHandle;
use crate::member::MemberMetadata;

/// Name prefix of membership records under the group path.
pub const MEMBER_PREFIX: &str = "member-";

const EVENT_CAPACITY: usize = 64;
const WATCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// What a membership event conveys about the snapshot it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipEventKind {
    /// The group's membership changed.
    Changed,
    /// The session was re-established; the snapshot is a full re-read and
    /// may equal the previous one. Consumers holding derived state should
    /// rebuild it.
    Resync,
}

/// A point-in-time view of the group, ordered by (host, port).
#[derive(Clone, Debug)]
pub struct MembershipEvent {
    pub kind: MembershipEventKind,
    pub members: Vec<MemberMetadata>,
    /// Milliseconds since the epoch at which the snapshot was taken.
    pub timestamp: i64,
}

impl MembershipEvent {
    fn now(kind: MembershipEventKind, members: Vec<MemberMetadata>) -> Self {
        MembershipEvent {
            kind,
            members,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Callback-style consumer of membership events.
#[async_trait]
pub trait MembershipListener: Send + Sync {
    async fn on_membership(&self, event: &MembershipEvent);
}

struct MonitorShared {
    handle: Arc<ClientHandle>,
    path: String,
    events: broadcast::Sender<MembershipEvent>,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
    running: AtomicBool,
    stop: tokio::sync::Notify,
    last: parking_lot::Mutex<Vec<MemberMetadata>>,
}

impl MonitorShared {
    async fn snapshot(&self) -> Result<Vec<MemberMetadata>> {
        let children = match self.handle.children(&self.path).await {
            Ok(children) => children,
            // nobody has joined yet, the group path is absent
            Err(e) if e.is_no_node() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut members = Vec::with_capacity(children.len());
        for name in children {
            if !name.starts_with(MEMBER_PREFIX) {
                continue;
            }
            match self.handle.get_data(&join_path(&self.path, &name)).await {
                Ok(data) => match MemberMetadata::from_bytes(&data) {
                    Ok(member) => members.push(member),
                    // a record we cannot decode must not hide the rest of
                    // the group
                    Err(e) => warn!("skipping malformed member record {}: {}", name, e),
                },
                // the member left between the listing and the read
                Err(e) if e.is_no_node() => continue,
                Err(e) => return Err(e),
            }
        }
        members.sort_by(|a, b| {
            (a.endpoint.host.as_str(), a.endpoint.port)
                .cmp(&(b.endpoint.host.as_str(), b.endpoint.port))
        });
        Ok(members)
    }

    async fn publish(&self, kind: MembershipEventKind, members: Vec<MemberMetadata>) {
        *self.last.lock() = members.clone();
        let event = MembershipEvent::now(kind, members);
        metrics::counter!("beacon_membership_events_total").increment(1);
        for listener in self.listeners.read().await.iter() {
            listener.on_membership(&event).await;
        }
        let _ = self.events.send(event);
    }
}

/// Watches one group path and publishes membership snapshots.
pub struct GroupMembershipMonitor {
    shared: Arc<MonitorShared>,
}

impl std::fmt::Debug for GroupMembershipMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupMembershipMonitor")
            .field("path", &self.shared.path)
            .finish_non_exhaustive()
    }
}

impl GroupMembershipMonitor {
    pub(crate) fn new(handle: Arc<ClientHandle>, path: String) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        GroupMembershipMonitor {
            shared: Arc::new(MonitorShared {
                handle,
                path,
                events,
                listeners: RwLock::new(Vec::new()),
                running: AtomicBool::new(false),
                stop: tokio::sync::Notify::new(),
                last: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    /// The group path this monitor observes.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Join the group, advertising `metadata`. The record is ephemeral:
    /// it disappears with the session, without any action by the member.
    pub async fn join(&self, metadata: &MemberMetadata) -> Result<MembershipHandle> {
        let shared = &self.shared;
        shared.handle.ensure_path(&shared.path).await?;
        let prefix = format!("{}/{}", shared.path, MEMBER_PREFIX);
        let record = shared
            .handle
            .create(&prefix, &metadata.to_bytes()?, CreateMode::EphemeralSequential)
            .await?;
        info!("joined group {} as {}", shared.path, record);
        Ok(MembershipHandle {
            handle: shared.handle.clone(),
            record,
            left: AtomicBool::new(false),
        })
    }

    /// Join the group advertising the local non-loopback address on
    /// `port`.
    pub async fn join_local(&self, port: u16) -> Result<MembershipHandle> {
        self.join(&MemberMetadata::for_local(port)).await
    }

    /// A point-in-time snapshot of the group, read directly from the
    /// ensemble. Does not require the monitor to be started.
    pub async fn snapshot(&self) -> Result<Vec<MemberMetadata>> {
        self.shared.snapshot().await
    }

    /// Register a callback listener. Listeners receive events in
    /// registration order, after the monitor is started.
    pub async fn on_change(&self, listener: Arc<dyn MembershipListener>) {
        self.shared.listeners.write().await.push(listener);
    }

    /// Subscribe to the event stream. A slow subscriber may observe a
    /// lagged receive; the next event still carries the full latest
    /// snapshot, so nothing needs replaying.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.shared.events.subscribe()
    }

    /// Start the watch loop. Idempotent; a second start is a no-op.
    pub async fn start(&self) -> Result<()> {
        let shared = self.shared.clone();
        if shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        shared.handle.ensure_path(&shared.path).await?;

        let initial = shared.snapshot().await?;
        shared
            .publish(MembershipEventKind::Resync, initial)
            .await;

        tokio::spawn(async move {
            let mut session_rx = shared.handle.subscribe_session();
            while shared.running.load(Ordering::SeqCst) {
                let watch = match shared.handle.watch_children(&shared.path).await {
                    Ok((_, watch)) => watch,
                    Err(e) => {
                        // a closed handle never yields a session again
                        if shared.handle.is_closed() {
                            break;
                        }
                        warn!("membership watch on {} failed: {}", shared.path, e);
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                        if let Ok(members) = shared.snapshot().await {
                            shared.publish(MembershipEventKind::Resync, members).await;
                        }
                        continue;
                    }
                };

                // re-read after registering the watch: a change between the
                // previous read and the registration must not be lost
                match shared.snapshot().await {
                    Ok(members) => {
                        if members != *shared.last.lock() {
                            shared.publish(MembershipEventKind::Changed, members).await;
                        }
                    }
                    Err(e) => {
                        if shared.handle.is_closed() {
                            break;
                        }
                        warn!("membership snapshot of {} failed: {}", shared.path, e);
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                        continue;
                    }
                }

                tokio::select! {
                    _ = watch.changed() => {
                        debug!("membership of {} changed", shared.path);
                    }
                    _ = shared.stop.notified() => {}
                    event = session_rx.recv() => match event {
                        Ok(SessionState::Expired) => {
                            warn!(
                                "session expired, resyncing membership of {}",
                                shared.path
                            );
                            if let Ok(members) = shared.snapshot().await {
                                shared.publish(MembershipEventKind::Resync, members).await;
                            }
                        }
                        Ok(SessionState::Closed) => break,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            shared.running.store(false, Ordering::SeqCst);
            debug!("membership monitor for {} stopped", shared.path);
        });
        Ok(())
    }

    /// Stop the watch loop. The last published snapshot stays available to
    /// subscribers that already received it.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            self.shared.stop.notify_waiters();
            info!("stopping membership monitor for {}", self.shared.path);
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

/// A member's own presence in the group.
pub struct MembershipHandle {
    handle: Arc<ClientHandle>,
    record: String,
    left: AtomicBool,
}

impl MembershipHandle {
    /// Full path of the membership record.
    pub fn record(&self) -> &str {
        &self.record
    }

    /// Leave the group. Idempotent, and tolerates the record already being
    /// gone after session expiry.
    pub async fn leave(&self) -> Result<()> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.handle.delete(&self.record).await {
            Ok(()) => {
                info!("left group, removed {}", self.record);
                Ok(())
            }
            Err(e) if e.is_no_node() => Ok(()),
            Err(DiscoveryError::SessionExpired) => Ok(()),
            Err(e) => {
                // the record may still exist, allow a retry
                self.left.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }
}
