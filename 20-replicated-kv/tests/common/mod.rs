//! In-process cluster harness shared by the integration tests.
//!
//! Replicas talk through a [`LocalNetwork`], so partitions are just a call
//! to `isolate`. Timers are shortened so elections settle in well under a
//! second.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use replicated_kv::kv::{KeyValueStore, MemoryStore};
use replicated_kv::log_store::MemoryLogStore;
use replicated_kv::transport::LocalNetwork;
use replicated_kv::wal::{LogEntry, Op, WriteAheadLog};
use replicated_kv::{Replica, ReplicaConfig, ReplicaError, Role};

pub const HEARTBEAT: Duration = Duration::from_millis(30);
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(150);
pub const POLL: Duration = Duration::from_millis(20);

pub fn addr(id: usize) -> String {
    format!("10.0.0.{id}:40404")
}

/// A log holding `count` committed entries written in `term`.
pub fn seeded_log(count: usize, term: u64) -> Result<WriteAheadLog> {
    let mut wal = WriteAheadLog::open(Box::new(MemoryLogStore::new()))?;
    for i in 0..count {
        wal.append(LogEntry::new(Op::Create, format!("seed-{i}"), "x", "", term));
        wal.commit()?;
    }
    Ok(wal)
}

pub struct TestCluster {
    pub network: LocalNetwork,
    replicas: Vec<Arc<Replica>>,
    stores: Vec<Arc<MemoryStore>>,
    tasks: Vec<JoinHandle<Result<(), ReplicaError>>>,
}

impl TestCluster {
    /// Spawns `n` replicas with empty logs.
    pub fn spawn(n: usize) -> Result<Self> {
        Self::spawn_with(n, |config| config)
    }

    pub fn spawn_with(n: usize, tweak: impl Fn(ReplicaConfig) -> ReplicaConfig) -> Result<Self> {
        let logs = (0..n).map(|_| WriteAheadLog::in_memory()).collect();
        Self::spawn_with_logs(logs, tweak)
    }

    /// Spawns one replica per log, in order.
    pub fn spawn_with_logs(
        logs: Vec<WriteAheadLog>,
        tweak: impl Fn(ReplicaConfig) -> ReplicaConfig,
    ) -> Result<Self> {
        let n = logs.len();
        let network = LocalNetwork::new();
        let mut replicas = Vec::with_capacity(n);
        let mut stores = Vec::with_capacity(n);

        for (i, wal) in logs.into_iter().enumerate() {
            let id = i + 1;
            let peers = (1..=n).filter(|&p| p != id).map(addr).collect();
            let config = tweak(
                ReplicaConfig::new(addr(id), peers).with_timeouts(HEARTBEAT, ELECTION_TIMEOUT),
            );
            let store = Arc::new(MemoryStore::new());
            let replica = Replica::new(
                config,
                wal,
                store.clone(),
                Arc::new(network.transport_for(&addr(id))),
            )?;
            network.register(&replica);
            replicas.push(replica);
            stores.push(store);
        }

        let tasks = replicas
            .iter()
            .map(|replica| tokio::spawn(replica.clone().run()))
            .collect();

        Ok(Self {
            network,
            replicas,
            stores,
            tasks,
        })
    }

    /// Replica by 1-indexed id.
    pub fn node(&self, id: usize) -> &Arc<Replica> {
        &self.replicas[id - 1]
    }

    pub fn store(&self, id: usize) -> &MemoryStore {
        &self.stores[id - 1]
    }

    pub fn ids(&self) -> impl Iterator<Item = usize> {
        1..=self.replicas.len()
    }

    pub fn isolate(&self, id: usize) {
        self.network.isolate(&addr(id));
    }

    pub fn heal(&self, id: usize) {
        self.network.heal(&addr(id));
    }

    /// Ids of replicas that currently believe they lead.
    pub fn leaders(&self) -> Vec<usize> {
        self.ids()
            .filter(|&id| self.node(id).current_role() == Role::Leader)
            .collect()
    }

    /// Waits until exactly one replica among `among` is leader.
    pub async fn wait_for_leader_among(&self, among: &[usize], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let leaders: Vec<usize> = self
                .leaders()
                .into_iter()
                .filter(|id| among.contains(id))
                .collect();
            if leaders.len() == 1 {
                return Ok(leaders[0]);
            }
            if Instant::now() > deadline {
                bail!("timeout waiting for a single leader, saw {leaders:?}");
            }
            sleep(POLL).await;
        }
    }

    pub async fn wait_for_single_leader(&self, timeout: Duration) -> Result<usize> {
        let all: Vec<usize> = self.ids().collect();
        self.wait_for_leader_among(&all, timeout).await
    }

    /// Waits until one replica leads and every replica names it as leader.
    pub async fn wait_for_stable_leader(&self, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let expected_len = self.replicas.len();
        loop {
            let leaders = self.leaders();
            if let [leader] = leaders[..] {
                let expected = addr(leader);
                let mut followers = 0;
                for id in self.ids() {
                    if self.node(id).leader_address().await.as_deref() == Some(expected.as_str()) {
                        followers += 1;
                    }
                }
                if followers == expected_len && self.node(leader).current_role() == Role::Leader {
                    return Ok(leader);
                }
            }
            if Instant::now() > deadline {
                bail!("timeout waiting for a stable leader, saw {leaders:?}");
            }
            sleep(POLL).await;
        }
    }

    /// Waits until every replica in `among` names `leader` as its leader.
    pub async fn wait_for_leader_consensus(
        &self,
        leader: usize,
        among: &[usize],
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let expected = addr(leader);
        loop {
            let mut agree = true;
            for &id in among {
                if self.node(id).leader_address().await.as_deref() != Some(expected.as_str()) {
                    agree = false;
                }
            }
            if agree {
                return Ok(());
            }
            if Instant::now() > deadline {
                bail!("timeout waiting for replicas {among:?} to follow {expected}");
            }
            sleep(POLL).await;
        }
    }

    /// Waits until replica `id`'s store holds `expected` under `key` (`None`
    /// meaning absent).
    pub async fn wait_for_value(
        &self,
        id: usize,
        key: &str,
        expected: Option<&str>,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let value = self.store(id).read(key).ok();
            if value.as_deref() == expected {
                return Ok(());
            }
            if Instant::now() > deadline {
                bail!("replica {id}: {key} is {value:?}, expected {expected:?}");
            }
            sleep(POLL).await;
        }
    }

    /// Waits until replica `id` has committed at least `len` entries.
    pub async fn wait_for_commit(&self, id: usize, len: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let committed = self.node(id).status().await.committed;
            if committed >= len {
                return Ok(());
            }
            if Instant::now() > deadline {
                bail!("replica {id} committed {committed} entries, expected {len}");
            }
            sleep(POLL).await;
        }
    }

    /// Waits until replica `id` holds staged entries beyond its committed
    /// tail.
    pub async fn wait_for_staged(&self, id: usize, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.node(id).status().await;
            if status.uncommitted > status.committed {
                return Ok(());
            }
            if Instant::now() > deadline {
                bail!("replica {id} never staged an entry");
            }
            sleep(Duration::from_millis(2)).await;
        }
    }

    /// Submits through whichever of `among` currently leads, retrying while
    /// leadership is still settling.
    pub async fn submit_via_leader(
        &self,
        among: &[usize],
        op: Op,
        key: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(leader) = self.wait_for_leader_among(among, timeout).await {
                match self.node(leader).submit(op, key, value).await {
                    Ok(applied) => return Ok(applied),
                    Err(ReplicaError::NotLeader { .. } | ReplicaError::Timeout(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            if Instant::now() > deadline {
                bail!("no leader among {among:?} accepted the write");
            }
            sleep(POLL).await;
        }
    }

    /// Stops every replica.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Consistency faults raised so far, by replica id.
    pub fn faults(&self) -> Vec<(usize, String)> {
        self.ids()
            .filter_map(|id| self.node(id).fault_reason().map(|reason| (id, reason)))
            .collect()
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
