//! Single-leader replicated key-value store.
//!
//! Replicas elect a leader per term, the leader stages client writes in its
//! write-ahead log and ships them to followers one heartbeat at a time, and a
//! write returns only after a quorum holds it and it has been committed and
//! applied locally. Reads are served from whichever replica is asked.
//!
//! Each module focuses on one part of that:
//!
//! - [`wal`] and [`log_store`]: log entries, the committed/staged split and
//!   the durable JSON-lines file behind it.
//! - [`kv`]: the stores committed entries are applied to.
//! - [`state`] and [`timer`]: role, term, peer progress and the
//!   resettable timer every driver waits on.
//! - [`election`], [`replication`] and [`coordinator`]: the candidate
//!   driver and vote handler, the leader rounds and follower handler, and
//!   the client write path.
//! - [`replica`]: ties it together and runs the driver for the current role.
//! - [`message`], [`transport`] and [`api`]: peer RPC payloads, how they are
//!   sent, and the HTTP routes that receive them alongside the REST API.
//! - [`config`] and [`cli`]: replica settings and the binary's flags.

pub mod api;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod kv;
pub mod log_store;
pub mod message;
pub mod replica;
pub mod replication;
pub mod state;
pub mod timer;
pub mod transport;
pub mod wal;

pub use config::{QuorumRule, ReplicaConfig};
pub use error::ReplicaError;
pub use replica::{Replica, ReplicaStatus};
pub use state::Role;
pub use wal::{LogEntry, Op};
