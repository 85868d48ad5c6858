//! Leader election
//!
//! The classic ephemeral-sequential recipe: every candidate creates an
//! ephemeral sequential record under the discovery path; the lowest live
//! sequence leads. Non-leaders watch their immediate predecessor rather
//! than the head, so a resignation wakes one candidate instead of the
//! whole field. After registering a predecessor watch the sibling list is
//! always re-checked: a record deleted between the read and the watch
//! registration must not leave a candidate waiting on a ghost.
//!
//! Leadership ends through exactly two doors that lead to the same
//! terminal transition: an explicit `resign` or session expiry. A process
//! never resumes a lost claim; it re-campaigns with a freshly-sequenced
//! record.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, broadcast, watch};
use tracing::{debug, info, warn};

use beacon_common::{DiscoveryError, Result, join_path, node_name, sequence_of};
use beacon_ensemble::{CreateMode, SessionState};

use crate::factory::ClientHandle;
use crate::member::MemberMetadata;

/// Name prefix of leadership records under the discovery path.
pub const CANDIDATE_PREFIX: &str = "candidate-";

/// Where an elector stands in the election lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectorState {
    /// No campaign has been started.
    Idle,
    /// Campaigning, not (yet) leading.
    Candidate,
    /// Holding leadership.
    Leader,
    /// Leadership given up explicitly.
    Resigned,
    /// Leadership lost to session expiry.
    Expired,
}

impl std::fmt::Display for ElectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ElectorState::Idle => "IDLE",
            ElectorState::Candidate => "CANDIDATE",
            ElectorState::Leader => "LEADER",
            ElectorState::Resigned => "RESIGNED",
            ElectorState::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

struct ElectorShared {
    handle: Arc<ClientHandle>,
    path: String,
    state: parking_lot::Mutex<ElectorState>,
    /// Full path of the current candidate record, while one is claimed.
    record: parking_lot::Mutex<Option<String>>,
    leading: AtomicBool,
    leading_tx: watch::Sender<bool>,
    cancel: Notify,
}

impl ElectorShared {
    /// Drop the claim on `record` if it is still ours, moving to
    /// `terminal`. Returns whether this call performed the transition.
    fn relinquish(&self, record: &str, terminal: ElectorState) -> bool {
        let mut claimed = self.record.lock();
        if claimed.as_deref() != Some(record) {
            return false;
        }
        *claimed = None;
        self.leading.store(false, Ordering::SeqCst);
        *self.state.lock() = terminal;
        let _ = self.leading_tx.send(false);
        self.cancel.notify_waiters();
        true
    }

    async fn resign_record(&self, record: &str) -> Result<()> {
        let transitioned = self.relinquish(record, ElectorState::Resigned);
        match self.handle.delete(record).await {
            Ok(()) => {}
            // session expiry raced the explicit resign: the record is
            // already gone, which is the outcome we wanted
            Err(e) if e.is_no_node() => {}
            Err(DiscoveryError::SessionExpired) => {}
            Err(e) => return Err(e),
        }
        if transitioned {
            info!("resigned leadership claim {} on {}", record, self.path);
            metrics::counter!("beacon_leadership_resigned_total").increment(1);
        }
        Ok(())
    }
}

/// Single-leader guarantee over one discovery path.
///
/// All operations are safe to call concurrently, but an elector runs at
/// most one campaign at a time.
pub struct LeaderElector {
    shared: Arc<ElectorShared>,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("path", &self.shared.path)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    pub(crate) fn new(handle: Arc<ClientHandle>, path: String) -> Self {
        let (leading_tx, _) = watch::channel(false);
        LeaderElector {
            shared: Arc::new(ElectorShared {
                handle,
                path,
                state: parking_lot::Mutex::new(ElectorState::Idle),
                record: parking_lot::Mutex::new(None),
                leading: AtomicBool::new(false),
                leading_tx,
                cancel: Notify::new(),
            }),
        }
    }

    /// The discovery path this elector campaigns under.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn state(&self) -> ElectorState {
        *self.shared.state.lock()
    }

    /// Whether this process currently holds leadership.
    pub fn is_leader(&self) -> bool {
        self.shared.leading.load(Ordering::SeqCst)
    }

    /// Observe leadership transitions of this elector (`true` on
    /// acquisition, `false` on resign or expiry).
    pub fn watch_leadership(&self) -> watch::Receiver<bool> {
        self.shared.leading_tx.subscribe()
    }

    /// Campaign for leadership, blocking until it is won.
    ///
    /// `metadata` is written into the leadership record so followers can
    /// discover the advertised endpoint via [`LeaderElector::leader_info`].
    /// Session expiry while waiting is recovered by creating a fresh
    /// record; expiry after winning surfaces through `is_leader` flipping
    /// false and the leadership watch, never as an error here.
    pub async fn campaign(&self, metadata: &MemberMetadata) -> Result<Leadership> {
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, ElectorState::Candidate | ElectorState::Leader) {
                return Err(DiscoveryError::IllegalArgument(
                    "campaign already in progress".to_string(),
                ));
            }
            *state = ElectorState::Candidate;
        }
        match self.run_campaign(metadata).await {
            Ok(leadership) => Ok(leadership),
            Err(e) => {
                let mut state = self.shared.state.lock();
                if *state == ElectorState::Candidate {
                    *state = ElectorState::Idle;
                }
                Err(e)
            }
        }
    }

    async fn run_campaign(&self, metadata: &MemberMetadata) -> Result<Leadership> {
        let shared = &self.shared;
        let data = metadata.to_bytes()?;
        shared.handle.ensure_path(&shared.path).await?;

        // subscribe before creating the record so no expiry is missed
        let mut session_rx = shared.handle.subscribe_session();
        let mut record = self.create_record(&data).await?;

        loop {
            if shared.record.lock().is_none() {
                // resign() raced the campaign and dropped the claim
                return Err(DiscoveryError::Internal(
                    "campaign cancelled by resign".to_string(),
                ));
            }
            let candidates = self.sorted_candidates().await?;
            let my_name = node_name(&record).to_string();
            let Some(my_seq) = sequence_of(&my_name) else {
                return Err(DiscoveryError::Internal(format!(
                    "candidate record without sequence suffix: {record}"
                )));
            };

            if !candidates.iter().any(|(_, name)| *name == my_name) {
                // our record is gone without an observed expiry event
                // (e.g. expiry during the sibling read): claim a fresh one
                warn!(
                    "candidate record {} vanished, creating a fresh record",
                    record
                );
                record = self.create_record(&data).await?;
                continue;
            }

            if candidates
                .first()
                .is_some_and(|(_, name)| *name == my_name)
            {
                return Ok(self.assume_leadership(record, session_rx));
            }

            let Some((_, predecessor)) = candidates.iter().rev().find(|(seq, _)| *seq < my_seq)
            else {
                // nothing sorts below us yet we are not first: the sibling
                // list moved under us, read it again
                continue;
            };
            let predecessor_path = join_path(&shared.path, predecessor);
            let (exists, watch_fired) = shared.handle.watch_exists(&predecessor_path).await?;
            if !exists {
                // the predecessor vanished between the sibling read and the
                // watch registration; never wait on a ghost
                debug!(
                    "predecessor {} gone before watch registration, re-reading",
                    predecessor_path
                );
                continue;
            }
            debug!(
                "candidate {} waiting on predecessor {}",
                my_name, predecessor_path
            );

            tokio::select! {
                _ = watch_fired.changed() => {
                    // predecessor changed, re-evaluate the field
                }
                _ = shared.cancel.notified() => {
                    // resign() cancels a pending campaign
                }
                event = session_rx.recv() => match event {
                    Ok(SessionState::Expired) => {
                        warn!(
                            "session expired while campaigning on {}, re-campaigning",
                            shared.path
                        );
                        record = self.create_record(&data).await?;
                    }
                    Ok(SessionState::Closed) => {
                        return Err(DiscoveryError::Connection(
                            "client closed during campaign".to_string(),
                        ));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(DiscoveryError::Connection(
                            "session event stream closed".to_string(),
                        ));
                    }
                },
            }
        }
    }

    async fn create_record(&self, data: &[u8]) -> Result<String> {
        let prefix = format!("{}/{}", self.shared.path, CANDIDATE_PREFIX);
        let created = self
            .shared
            .handle
            .create(&prefix, data, CreateMode::EphemeralSequential)
            .await?;
        debug!("created candidate record {}", created);
        *self.shared.record.lock() = Some(created.clone());
        Ok(created)
    }

    fn assume_leadership(
        &self,
        record: String,
        mut session_rx: broadcast::Receiver<SessionState>,
    ) -> Leadership {
        let shared = &self.shared;
        shared.leading.store(true, Ordering::SeqCst);
        *shared.state.lock() = ElectorState::Leader;
        let _ = shared.leading_tx.send(true);
        info!("assumed leadership of {} with {}", shared.path, record);
        metrics::counter!("beacon_elections_won_total").increment(1);

        // sentinel: session expiry is the implicit resignation path
        let sentinel = shared.clone();
        let sentinel_record = record.clone();
        tokio::spawn(async move {
            loop {
                match session_rx.recv().await {
                    Ok(state) if state.is_terminal() => {
                        if sentinel.relinquish(&sentinel_record, ElectorState::Expired) {
                            warn!(
                                "session {} leadership of {} lost",
                                state, sentinel.path
                            );
                            metrics::counter!("beacon_leadership_lost_total").increment(1);
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Leadership {
            shared: shared.clone(),
            record,
        }
    }

    /// Relinquish the current claim, if any. Safe to call whether leading
    /// or still campaigning; tolerates a record already deleted by session
    /// expiry.
    pub async fn resign(&self) -> Result<()> {
        let record = self.shared.record.lock().clone();
        match record {
            Some(record) => self.shared.resign_record(&record).await,
            None => Ok(()),
        }
    }

    /// Metadata advertised by the current leader, or `None` when no
    /// candidate is present. Follower-facing: does not require campaigning.
    pub async fn leader_info(&self) -> Result<Option<MemberMetadata>> {
        loop {
            let candidates = match self.sorted_candidates().await {
                Ok(candidates) => candidates,
                // nobody has campaigned yet, the discovery path is absent
                Err(e) if e.is_no_node() => return Ok(None),
                Err(e) => return Err(e),
            };
            let Some((_, name)) = candidates.first() else {
                return Ok(None);
            };
            match self
                .shared
                .handle
                .get_data(&join_path(&self.shared.path, name))
                .await
            {
                Ok(data) => return Ok(Some(MemberMetadata::from_bytes(&data)?)),
                // leader vanished between the listing and the read
                Err(e) if e.is_no_node() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn sorted_candidates(&self) -> Result<Vec<(u64, String)>> {
        let children = self.shared.handle.children(&self.shared.path).await?;
        let mut candidates: Vec<(u64, String)> = children
            .into_iter()
            .filter(|name| name.starts_with(CANDIDATE_PREFIX))
            .filter_map(|name| sequence_of(&name).map(|seq| (seq, name)))
            .collect();
        candidates.sort();
        Ok(candidates)
    }
}

/// Exclusive ownership of a won election.
///
/// Dropping the handle does not resign; leadership persists until an
/// explicit [`Leadership::resign`] or session expiry.
pub struct Leadership {
    shared: Arc<ElectorShared>,
    record: String,
}

impl std::fmt::Debug for Leadership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leadership")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl Leadership {
    /// Full path of the leadership record.
    pub fn record(&self) -> &str {
        &self.record
    }

    /// Whether this claim still holds.
    pub fn is_leader(&self) -> bool {
        self.shared.leading.load(Ordering::SeqCst)
            && self.shared.record.lock().as_deref() == Some(self.record.as_str())
    }

    /// Relinquish leadership. Idempotent; tolerates the record already
    /// being gone after session expiry.
    pub async fn resign(&self) -> Result<()> {
        self.shared.resign_record(&self.record).await
    }
}
