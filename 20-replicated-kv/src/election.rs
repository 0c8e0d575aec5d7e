//! Leader election: the candidate driver and the vote handler.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::ReplicaError;
use crate::message::{VoteRequest, VoteResponse};
use crate::replica::Replica;
use crate::state::Role;
use crate::timer::jittered;

impl Replica {
    /// Runs one election round for a new term.
    ///
    /// Ends when the replica wins, when a peer reports a newer term, when the
    /// randomized election timeout passes without a verdict (the replica
    /// stays a candidate and the next round starts), or when the role epoch
    /// moves underneath it.
    pub(crate) async fn run_election(self: Arc<Self>, epoch: u64) -> Result<(), ReplicaError> {
        let (term, request) = {
            let mut g = self.state.lock().await;
            if self.state.epoch() != epoch || self.state.role() != Role::Candidate {
                return Ok(());
            }
            let term = self.state.term() + 1;
            self.state.adopt_term(&mut g, term);
            g.voted_for = Some(self.config.addr.clone());
            g.leader = None;
            let request = VoteRequest {
                candidate: self.config.addr.clone(),
                log_len: g.wal.len_committed(),
                log_term: g.wal.last_op().term,
                term,
            };
            (term, request)
        };

        let needed = self.config.majority();
        let mut votes = 1;
        info!(term, needed, "election started");

        let mut ballots: FuturesUnordered<_> = self
            .config
            .peers
            .iter()
            .map(|peer| {
                let pending = self.transport.request_vote(peer, request.clone());
                let peer = peer.clone();
                async move { (peer, pending.await) }
            })
            .collect();

        let deadline = sleep(jittered(self.config.election_timeout));
        tokio::pin!(deadline);

        while votes < needed {
            tokio::select! {
                _ = self.state.epoch_changed(epoch) => return Ok(()),
                _ = &mut deadline => {
                    info!(term, votes, needed, "election timed out without a verdict");
                    return Ok(());
                }
                Some((peer, outcome)) = ballots.next() => match outcome {
                    Ok(VoteResponse { term: their_term, .. }) if their_term > term => {
                        self.step_down_to(epoch, their_term).await;
                        return Ok(());
                    }
                    Ok(VoteResponse { term: their_term, granted: true }) if their_term == term => {
                        votes += 1;
                        debug!(term, peer = %peer, votes, "vote granted");
                    }
                    Ok(_) => debug!(term, peer = %peer, "vote refused"),
                    Err(err) => debug!(term, peer = %peer, error = %err, "vote request failed"),
                },
            }
        }

        let mut g = self.state.lock().await;
        if self.state.epoch() != epoch || self.state.term() != term {
            return Ok(());
        }
        self.state.transition(&mut g, Role::Leader);
        g.leader = Some(self.config.addr.clone());
        self.state.timer.reset(Duration::ZERO);
        info!(term, votes, "won election, now leader");
        Ok(())
    }

    /// Gives up candidacy after seeing a newer term.
    async fn step_down_to(&self, epoch: u64, term: u64) {
        let mut g = self.state.lock().await;
        if self.state.epoch() != epoch {
            return;
        }
        self.state.adopt_term(&mut g, term);
        self.state.transition(&mut g, Role::Follower);
        self.state.timer.reset(jittered(self.config.election_timeout));
        info!(term, "newer term seen during election, stepping down");
    }

    /// Decides a vote request.
    ///
    /// A newer term is adopted (and any leadership or candidacy given up)
    /// before deciding, whether or not the vote is granted. The vote is
    /// granted when the candidate's committed log is at least as up to date
    /// as ours and we have not voted for someone else in this term.
    pub async fn handle_vote_request(&self, request: VoteRequest) -> VoteResponse {
        let mut g = self.state.lock().await;

        if self.state.adopt_term(&mut g, request.term) {
            self.state.transition(&mut g, Role::Follower);
            g.leader = None;
            info!(term = request.term, candidate = %request.candidate, "newer term in vote request");
        }

        let term = self.state.term();
        let last = g.wal.last_op();
        let log_ok = request.log_term > last.term
            || (request.log_term == last.term && request.log_len >= g.wal.len_committed());
        let free = g
            .voted_for
            .as_deref()
            .map_or(true, |voted| voted == request.candidate);
        let granted = request.term == term && log_ok && free;

        if granted {
            g.voted_for = Some(request.candidate.clone());
            g.leader = Some(request.candidate.clone());
            self.state.timer.reset(jittered(self.config.election_timeout));
            info!(term, candidate = %request.candidate, "vote granted");
        } else {
            info!(
                term,
                candidate = %request.candidate,
                candidate_term = request.term,
                log_ok,
                voted_for = ?g.voted_for,
                "vote refused"
            );
        }

        VoteResponse { term, granted }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicaConfig;
    use crate::kv::MemoryStore;
    use crate::log_store::MemoryLogStore;
    use crate::transport::LocalNetwork;
    use crate::wal::{LogEntry, Op, WriteAheadLog};

    fn committed_log(terms: &[u64]) -> WriteAheadLog {
        let mut wal = WriteAheadLog::open(Box::new(MemoryLogStore::new())).unwrap();
        for &term in terms {
            wal.append(LogEntry::new(Op::Create, "k", "v", "", term));
            wal.commit().unwrap();
        }
        wal
    }

    fn voter(wal: WriteAheadLog) -> Arc<Replica> {
        let network = LocalNetwork::new();
        let config = ReplicaConfig::new("a:1", vec!["b:1".into(), "c:1".into()]);
        Replica::new(
            config,
            wal,
            Arc::new(MemoryStore::new()),
            Arc::new(network.transport_for("a:1")),
        )
        .unwrap()
    }

    fn ballot(candidate: &str, term: u64, log_len: u64, log_term: u64) -> VoteRequest {
        VoteRequest {
            candidate: candidate.into(),
            log_len,
            log_term,
            term,
        }
    }

    #[tokio::test]
    async fn restarted_replica_resumes_term_from_log() {
        let replica = voter(committed_log(&[1, 3]));
        assert_eq!(replica.current_term(), 3);
    }

    #[tokio::test]
    async fn grants_one_vote_per_term() {
        let replica = voter(committed_log(&[]));

        let first = replica.handle_vote_request(ballot("b:1", 1, 0, 0)).await;
        assert!(first.granted);
        assert_eq!(first.term, 1);

        let repeat = replica.handle_vote_request(ballot("b:1", 1, 0, 0)).await;
        assert!(repeat.granted);

        let rival = replica.handle_vote_request(ballot("c:1", 1, 0, 0)).await;
        assert!(!rival.granted);

        let next_term = replica.handle_vote_request(ballot("c:1", 2, 0, 0)).await;
        assert!(next_term.granted);
        assert_eq!(replica.leader_address().await.as_deref(), Some("c:1"));
    }

    #[tokio::test]
    async fn refuses_candidates_with_older_logs() {
        let replica = voter(committed_log(&[1, 2, 2]));

        let shorter = replica.handle_vote_request(ballot("b:1", 5, 2, 2)).await;
        assert!(!shorter.granted);
        // The newer term is adopted even though the vote is refused.
        assert_eq!(shorter.term, 5);
        assert_eq!(replica.current_term(), 5);

        let older_term = replica.handle_vote_request(ballot("b:1", 5, 9, 1)).await;
        assert!(!older_term.granted);

        let newer_term = replica.handle_vote_request(ballot("b:1", 5, 1, 3)).await;
        assert!(newer_term.granted);
    }

    #[tokio::test]
    async fn refuses_stale_terms() {
        let replica = voter(committed_log(&[4]));
        let stale = replica.handle_vote_request(ballot("b:1", 3, 10, 4)).await;
        assert!(!stale.granted);
        assert_eq!(stale.term, 4);
    }

    #[tokio::test]
    async fn leader_steps_down_on_newer_vote_request() {
        let replica = voter(committed_log(&[1]));
        {
            let mut g = replica.state.lock().await;
            replica.state.adopt_term(&mut g, 2);
            replica.state.transition(&mut g, Role::Candidate);
            replica.state.transition(&mut g, Role::Leader);
            g.voted_for = Some("a:1".into());
        }

        let same_term = replica.handle_vote_request(ballot("b:1", 2, 1, 1)).await;
        assert!(!same_term.granted);
        assert_eq!(replica.current_role(), Role::Leader);

        let newer = replica.handle_vote_request(ballot("b:1", 3, 1, 1)).await;
        assert!(newer.granted);
        assert_eq!(replica.current_role(), Role::Follower);
    }

    #[tokio::test]
    async fn lone_replica_elects_itself() {
        let network = LocalNetwork::new();
        let config = ReplicaConfig::new("solo:1", vec![])
            .with_timeouts(Duration::from_millis(10), Duration::from_millis(50));
        let replica = Replica::new(
            config,
            WriteAheadLog::in_memory(),
            Arc::new(MemoryStore::new()),
            Arc::new(network.transport_for("solo:1")),
        )
        .unwrap();

        let epoch = {
            let mut g = replica.state.lock().await;
            replica.state.transition(&mut g, Role::Candidate)
        };
        replica.clone().run_election(epoch).await.unwrap();

        assert_eq!(replica.current_role(), Role::Leader);
        assert_eq!(replica.current_term(), 1);
        assert_eq!(replica.leader_address().await.as_deref(), Some("solo:1"));
    }
}
