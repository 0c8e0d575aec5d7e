//! Log replication: the leader's periodic rounds and the follower handler.
//!
//! Every heartbeat period the leader sends each peer exactly one message,
//! picked from that peer's progress in this order:
//!
//! 1. the next committed entry the peer has not acknowledged committing,
//! 2. the next committed entry the peer has not acknowledged holding,
//! 3. the next uncommitted entry the peer has not acknowledged holding,
//! 4. a heartbeat carrying the last committed entry.
//!
//! The first round after winning an election only sends heartbeats.
//!
//! An acknowledgement moves a peer's staged progress only when it answers an
//! append of an entry the leader still holds: the peer must report exactly
//! that entry's index, and the leader's staging generation must not have
//! moved since the round was planned. Commit acknowledgements carry the
//! peer's committed length, which the leader can always trust up to its own.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::ReplicaError;
use crate::message::{ReplicateAck, ReplicateKind, ReplicateRequest};
use crate::replica::Replica;
use crate::state::{Guarded, Role};
use crate::timer::jittered;
use crate::wal::LogEntry;

/// One message of a replication round.
#[derive(Debug)]
struct Outbound {
    peer: String,
    kind: ReplicateKind,
    request: ReplicateRequest,
    /// Leader's staging generation when the message was planned.
    generation: u64,
}

impl Replica {
    /// Leader driver: one replication round per timer tick.
    pub(crate) async fn run_leader(self: Arc<Self>, epoch: u64) -> Result<(), ReplicaError> {
        let mut round = 0u64;
        loop {
            tokio::select! {
                _ = self.state.timer.expired() => {}
                _ = self.state.epoch_changed(epoch) => return Ok(()),
            }
            self.state.timer.reset(self.config.heartbeat_interval);
            if self.state.epoch() != epoch || self.state.role() != Role::Leader {
                return Ok(());
            }

            let outbound = {
                let g = self.state.lock().await;
                self.plan_round(&g, round)?
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.run_round(epoch, round, outbound).await });
            round += 1;
        }
    }

    fn plan_round(&self, g: &Guarded, round: u64) -> Result<Vec<Outbound>, ReplicaError> {
        let term = self.state.term();
        let len_committed = g.wal.len_committed();
        let len_uncommitted = g.wal.len_uncommitted();
        let generation = g.wal.generation();
        let peers = &self.config.peers;

        let lagging = round > 0
            && peers.iter().any(|peer| {
                g.progress.commit_len(peer) < len_committed || g.progress.sent_len(peer) < len_committed
            });
        let committed = if lagging {
            let mut history = g.wal.suffix(0)?;
            history.reverse();
            if history.len() as u64 != len_committed {
                return Err(self.raise_fault(format!(
                    "durable log holds {} entries but {} are committed",
                    history.len(),
                    len_committed
                )));
            }
            history
        } else {
            Vec::new()
        };
        let staged = if round > 0 && len_uncommitted > len_committed {
            g.wal.uncommitted_snapshot()
        } else {
            Vec::new()
        };

        let outbound = peers
            .iter()
            .map(|peer| {
                let sent = g.progress.sent_len(peer);
                let commit = g.progress.commit_len(peer);
                let (kind, entry): (ReplicateKind, LogEntry) = if round == 0 {
                    (ReplicateKind::Heartbeat, g.wal.last_op())
                } else if commit < len_committed {
                    (ReplicateKind::Commit, committed[commit as usize].clone())
                } else if sent < len_committed {
                    (ReplicateKind::Commit, committed[sent as usize].clone())
                } else if sent < len_uncommitted {
                    (ReplicateKind::Append, staged[(sent - len_committed) as usize].clone())
                } else {
                    (ReplicateKind::Heartbeat, g.wal.last_op())
                };
                Outbound {
                    peer: peer.clone(),
                    kind,
                    request: ReplicateRequest {
                        term,
                        leader: self.config.addr.clone(),
                        entry,
                    },
                    generation,
                }
            })
            .collect();
        Ok(outbound)
    }

    /// Sends one round and folds acknowledgements into peer progress as they
    /// arrive. Without acknowledgements from a quorum by the election
    /// timeout, the leader steps down.
    async fn run_round(self: Arc<Self>, epoch: u64, round: u64, outbound: Vec<Outbound>) {
        let needed = self.config.majority() - 1;
        let mut pending: FuturesUnordered<_> = outbound
            .into_iter()
            .map(|out| {
                let Outbound {
                    peer,
                    kind,
                    request,
                    generation,
                } = out;
                let index = request.entry.index;
                let reply = self.transport.replicate(&peer, kind, request);
                async move { (peer, kind, index, generation, reply.await) }
            })
            .collect();

        let deadline = sleep(self.config.election_timeout);
        tokio::pin!(deadline);
        let mut acks = 0;

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                next = pending.next() => match next {
                    None => break,
                    Some((peer, kind, index, generation, Ok(ack))) => {
                        acks += 1;
                        let mut g = self.state.lock().await;
                        if self.state.epoch() != epoch {
                            return;
                        }
                        let moved = if ack.committed {
                            let len_committed = g.wal.len_committed();
                            g.progress.record_committed(&peer, ack.len, len_committed)
                        } else if kind == ReplicateKind::Append
                            && ack.len == index
                            && generation == g.wal.generation()
                            && index <= g.wal.len_uncommitted()
                        {
                            g.progress.record_staged(&peer, ack.len)
                        } else {
                            debug!(round, peer = %peer, kind = %kind, len = ack.len, index, "acknowledgement does not vouch for a held entry");
                            false
                        };
                        if moved {
                            self.state.progress.notify_waiters();
                        }
                        debug!(round, peer = %peer, kind = %kind, len = ack.len, committed = ack.committed, "replicate acknowledged");
                    }
                    Some((peer, kind, _, _, Err(err))) => {
                        debug!(round, peer = %peer, kind = %kind, error = %err, "replicate failed");
                    }
                },
            }
        }

        if acks < needed {
            let mut g = self.state.lock().await;
            if self.state.epoch() != epoch || self.state.role() != Role::Leader {
                return;
            }
            warn!(round, acks, needed, term = self.state.term(), "lost contact with quorum, stepping down");
            self.state.transition(&mut g, Role::Follower);
            g.leader = None;
            self.state.timer.reset(jittered(self.config.election_timeout));
        }
    }

    /// Handles a replicate message from a leader.
    ///
    /// Returns the follower's log lengths after the message took effect. A
    /// commit is answered with the committed length alone, so staged entries
    /// never ride along on it.
    pub async fn handle_replicate(
        &self,
        kind: ReplicateKind,
        request: ReplicateRequest,
    ) -> Result<ReplicateAck, ReplicaError> {
        let mut g = self.state.lock().await;
        let local = self.state.term();

        if request.term < local {
            debug!(kind = %kind, local, remote = request.term, leader = %request.leader, "stale replicate message");
            return Err(ReplicaError::StaleTerm {
                local,
                remote: request.term,
            });
        }
        let role = self.state.role();
        if role == Role::Leader && request.term == local {
            warn!(term = local, from = %request.leader, "another leader claims this term");
            return Err(ReplicaError::Rejected { term: local });
        }

        if self.state.adopt_term(&mut g, request.term) || role != Role::Follower {
            self.state.transition(&mut g, Role::Follower);
            info!(term = request.term, leader = %request.leader, "following leader");
        }

        if g.leader.as_deref() != Some(request.leader.as_str()) {
            let dropped = g.wal.discard_uncommitted();
            if dropped > 0 {
                debug!(dropped, leader = %request.leader, "discarded entries staged for another leader");
            }
            g.leader = Some(request.leader.clone());
        }

        let ack = match kind {
            ReplicateKind::Heartbeat => staged_ack(&g),
            ReplicateKind::Append => {
                self.stage(&mut g, &request.entry);
                staged_ack(&g)
            }
            ReplicateKind::Commit => {
                self.commit_replicated(&mut g, &request.entry).await?;
                ReplicateAck {
                    len: g.wal.len_committed(),
                    committed: true,
                }
            }
        };
        self.state.timer.reset(jittered(self.config.election_timeout));
        Ok(ack)
    }

    /// Stages `entry` if it directly follows the committed tail, replacing
    /// whatever was staged before.
    fn stage(&self, g: &mut Guarded, entry: &LogEntry) {
        if entry.index <= g.wal.len_committed() || !g.wal.extends_committed(entry) {
            debug!(index = entry.index, committed = g.wal.len_committed(), "entry does not follow committed tail");
            return;
        }
        let dropped = g.wal.discard_uncommitted();
        if dropped > 0 {
            debug!(dropped, index = entry.index, "restaging over stale entries");
        }
        g.wal.append(entry.clone());
    }

    async fn commit_replicated(&self, g: &mut Guarded, entry: &LogEntry) -> Result<(), ReplicaError> {
        let committed = g.wal.len_committed();
        if entry.index <= committed {
            debug!(index = entry.index, committed, "entry already committed");
            return Ok(());
        }

        self.stage(g, entry);
        if entry.index != committed + 1 || g.wal.len_uncommitted() != entry.index {
            return Err(self.raise_fault(format!(
                "leader asked to commit entry {} but {} entries are committed and {} staged",
                entry.index,
                committed,
                g.wal.len_uncommitted() - committed
            )));
        }

        let last = g.wal.commit()?.clone();
        self.apply_committed(&last).await?;
        debug!(index = last.index, "replicated entry committed");
        Ok(())
    }
}

/// Lengths reported in answer to a heartbeat or an append.
fn staged_ack(g: &Guarded) -> ReplicateAck {
    let len = g.wal.len_uncommitted();
    ReplicateAck {
        len,
        committed: len == g.wal.len_committed(),
    }
}
