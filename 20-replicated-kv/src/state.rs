//! Replica state: term, role, vote, the log and per-peer progress.
//!
//! Term, role and the role epoch are atomics so hot paths can read them
//! without the guard. They only change while the guard is held; every
//! mutating method takes `&mut Guarded` as proof.
//!
//! The epoch increments whenever the role changes. Role drivers remember the
//! epoch they were started under and stop as soon as it moves.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tracing::debug;

use crate::config::QuorumRule;
use crate::timer::{jittered, ResettableTimer};
use crate::wal::WriteAheadLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Role {
    Follower = 0,
    Candidate = 1,
    Leader = 2,
}

impl Role {
    fn from_u8(raw: u8) -> Self {
        match raw {
            2 => Role::Leader,
            1 => Role::Candidate,
            _ => Role::Follower,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        })
    }
}

/// Leader-side bookkeeping of how far each peer has got.
///
/// # Why two lengths per peer?
///
/// `sent_len` is what the peer holds, staged or committed, and is what the
/// quorum check counts. `commit_len` is what the peer has made durable and
/// drives which message it gets next. A peer only learns about a commit after
/// the leader has made it, so quorum cannot be measured in `commit_len`.
///
/// Both only count entries the leader can vouch for: committed lengths up to
/// the leader's own committed length, and staged lengths only for the exact
/// entry the leader sent and still holds. The caller checks the latter.
#[derive(Debug, Clone, Default)]
pub struct PeerProgress {
    sent_len: HashMap<String, u64>,
    commit_len: HashMap<String, u64>,
}

impl PeerProgress {
    pub fn new(peers: &[String]) -> Self {
        Self {
            sent_len: peers.iter().map(|p| (p.clone(), 0)).collect(),
            commit_len: peers.iter().map(|p| (p.clone(), 0)).collect(),
        }
    }

    /// Length the peer has acknowledged holding.
    pub fn sent_len(&self, peer: &str) -> u64 {
        self.sent_len.get(peer).copied().unwrap_or(0)
    }

    /// Committed length the peer has acknowledged.
    pub fn commit_len(&self, peer: &str) -> u64 {
        self.commit_len.get(peer).copied().unwrap_or(0)
    }

    /// Records that `peer` has committed `len` entries. Ignored if `len`
    /// runs past `len_committed`. Returns whether anything moved.
    pub fn record_committed(&mut self, peer: &str, len: u64, len_committed: u64) -> bool {
        let (Some(sent), Some(commit)) =
            (self.sent_len.get_mut(peer), self.commit_len.get_mut(peer))
        else {
            return false;
        };
        if len > len_committed {
            return false;
        }

        let mut moved = false;
        if len > *commit {
            *commit = len;
            moved = true;
        }
        if len > *sent {
            *sent = len;
            moved = true;
        }
        moved
    }

    /// Records that `peer` holds the leader's entries up to `len`. Progress
    /// never moves backwards. Returns whether anything moved.
    pub fn record_staged(&mut self, peer: &str, len: u64) -> bool {
        match self.sent_len.get_mut(peer) {
            Some(sent) if len > *sent => {
                *sent = len;
                true
            }
            _ => false,
        }
    }

    /// Pulls every peer's sent length back to at most `len`.
    pub fn clamp_sent(&mut self, len: u64) {
        for sent in self.sent_len.values_mut() {
            *sent = (*sent).min(len);
        }
    }

    pub fn reset(&mut self) {
        self.sent_len.values_mut().for_each(|v| *v = 0);
        self.commit_len.values_mut().for_each(|v| *v = 0);
    }

    /// Whether an entry ending at `required` has reached a quorum.
    pub fn replicated(&self, rule: QuorumRule, required: u64) -> bool {
        match rule {
            QuorumRule::Majority => {
                let cluster = self.sent_len.len() + 1;
                let holders = 1 + self.sent_len.values().filter(|&&len| len >= required).count();
                holders * 2 > cluster
            }
            QuorumRule::Median => {
                if self.sent_len.is_empty() {
                    return true;
                }
                let mut lens: Vec<u64> = self.sent_len.values().copied().collect();
                lens.sort_unstable();
                lens[lens.len() / 2] >= required
            }
        }
    }
}

/// State only touched with the replica guard held.
#[derive(Debug)]
pub struct Guarded {
    pub wal: WriteAheadLog,
    pub progress: PeerProgress,
    /// Candidate voted for in the current term.
    pub voted_for: Option<String>,
    /// Last known leader address.
    pub leader: Option<String>,
}

/// Term, role and guarded state of one replica.
///
/// # Why atomics next to a mutex?
///
/// Routing and logging read the term and role all the time and must not
/// queue behind a writer that holds the guard while it waits for quorum.
/// Every change still happens with the guard held, so a reader holding the
/// guard sees values consistent with the log and progress it protects.
///
/// # Why an epoch?
///
/// Role drivers are plain tasks. Instead of cancelling them from outside,
/// each remembers the epoch it started under and re-checks it before acting.
/// A driver from a previous role finds the epoch moved and stops on its own.
#[derive(Debug)]
pub struct ReplicaState {
    term: AtomicU64,
    role: AtomicU8,
    epoch: AtomicU64,
    epoch_moved: Notify,
    guarded: Mutex<Guarded>,
    /// Signalled whenever an acknowledgement advances peer progress.
    pub(crate) progress: Notify,
    pub(crate) timer: ResettableTimer,
}

impl ReplicaState {
    /// Starts as a follower. The term resumes from the last committed entry.
    pub fn new(wal: WriteAheadLog, peers: &[String], election_timeout: Duration) -> Self {
        let term = wal.last_op().term;
        Self {
            term: AtomicU64::new(term),
            role: AtomicU8::new(Role::Follower as u8),
            epoch: AtomicU64::new(0),
            epoch_moved: Notify::new(),
            guarded: Mutex::new(Guarded {
                wal,
                progress: PeerProgress::new(peers),
                voted_for: None,
                leader: None,
            }),
            progress: Notify::new(),
            timer: ResettableTimer::new(jittered(election_timeout)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, Guarded> {
        self.guarded.lock().await
    }

    pub fn term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Moves to a newer term, forgetting the vote cast in the old one and
    /// any entries staged by an older leader. Older or equal terms are
    /// ignored.
    pub fn adopt_term(&self, g: &mut Guarded, term: u64) -> bool {
        let from = self.term();
        if term <= from {
            return false;
        }
        self.term.store(term, Ordering::Release);
        g.voted_for = None;
        let dropped = g.wal.discard_uncommitted();
        if dropped > 0 {
            debug!(dropped, from, to = term, "discarded entries staged in an older term");
        }
        true
    }

    /// Changes role. Staged entries are dropped when entering candidacy or
    /// leadership and when leaving leadership; progress restarts from zero on
    /// becoming leader. Returns the epoch in force afterwards.
    pub fn transition(&self, g: &mut Guarded, role: Role) -> u64 {
        let from = self.role();
        if from == role {
            return self.epoch();
        }

        if matches!(role, Role::Candidate | Role::Leader) || from == Role::Leader {
            let dropped = g.wal.discard_uncommitted();
            if dropped > 0 {
                debug!(dropped, from = %from, to = %role, "discarded uncommitted entries");
            }
        }
        if role == Role::Leader {
            g.progress.reset();
        }

        self.role.store(role as u8, Ordering::Release);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.epoch_moved.notify_waiters();
        epoch
    }

    /// Resolves once the epoch differs from `epoch`.
    pub async fn epoch_changed(&self, epoch: u64) {
        loop {
            let moved = self.epoch_moved.notified();
            tokio::pin!(moved);
            moved.as_mut().enable();
            if self.epoch() != epoch {
                return;
            }
            moved.await;
        }
    }
}
