//! Write-ahead log with a committed tail and an uncommitted staging buffer.
//!
//! Entries enter the staging buffer through [`WriteAheadLog::append`] (or
//! [`WriteAheadLog::append_batch`] for replicated batches) and leave it only
//! through [`WriteAheadLog::commit`], which hands the whole buffer to the
//! durable [`LogStore`] in append order. The committed tail is immutable once
//! written; the buffer is owned exclusively by the log.
//!
//! Indices are contiguous and start at 1. The zero entry (index 0, no
//! operation) stands for "nothing committed yet".

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::log_store::{LogStore, MemoryLogStore};

/// Operation carried by a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "create")]
    Create,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "read")]
    Read,
    #[serde(rename = "CAS")]
    Cas,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Update => "update",
            Op::Delete => "delete",
            Op::Read => "read",
            Op::Cas => "CAS",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single replicated operation plus its position in the log.
///
/// `index`, `prev_index` and `prev_term` are assigned by the log on append;
/// callers only fill in the operation, its operands and the term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "operation", default)]
    pub op: Option<Op>,
    #[serde(default)]
    pub operand: String,
    #[serde(default)]
    pub value1: String,
    /// Second operand, used by compare-and-swap for the new value.
    #[serde(default)]
    pub value2: String,
    pub term: u64,
    pub index: u64,
    pub prev_index: u64,
    pub prev_term: u64,
}

impl LogEntry {
    pub fn new(
        op: Op,
        operand: impl Into<String>,
        value1: impl Into<String>,
        value2: impl Into<String>,
        term: u64,
    ) -> Self {
        Self {
            op: Some(op),
            operand: operand.into(),
            value1: value1.into(),
            value2: value2.into(),
            term,
            ..Default::default()
        }
    }

    /// True for the placeholder that precedes the first real entry.
    pub fn is_zero(&self) -> bool {
        self.index == 0 && self.op.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("log i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt log record: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("commit requested with an empty uncommitted buffer")]
    EmptyCommit,
}

/// Committed tail plus staging buffer over a [`LogStore`].
///
/// # Why a staging generation?
///
/// Appends only ever extend the buffer and commits only move entries out of
/// it, so an entry at a given index stays the same entry until the buffer is
/// discarded. Discarding bumps [`WriteAheadLog::generation`]. Anything that
/// refers to a staged entry by position (an acknowledgement in flight, for
/// instance) can compare generations to tell whether the entry it meant is
/// still the one staged there.
pub struct WriteAheadLog {
    store: Box<dyn LogStore>,
    last_committed: LogEntry,
    uncommitted: Vec<LogEntry>,
    generation: u64,
}

impl WriteAheadLog {
    /// Opens the log on top of `store`, recovering the most recently
    /// committed entry from it.
    pub fn open(store: Box<dyn LogStore>) -> Result<Self, WalError> {
        let last_committed = store.newest()?.unwrap_or_default();
        Ok(Self {
            store,
            last_committed,
            uncommitted: Vec::with_capacity(16),
            generation: 0,
        })
    }

    /// A log with no durable backing, used by tests and throwaway replicas.
    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemoryLogStore::new()),
            last_committed: LogEntry::default(),
            uncommitted: Vec::with_capacity(16),
            generation: 0,
        }
    }

    fn tail(&self) -> &LogEntry {
        self.uncommitted.last().unwrap_or(&self.last_committed)
    }

    fn link(&self, entry: &mut LogEntry) {
        let tail = self.tail();
        entry.index = tail.index + 1;
        entry.prev_index = tail.index;
        entry.prev_term = tail.term;
    }

    /// Stages `entry` after the current tail and returns its index.
    pub fn append(&mut self, mut entry: LogEntry) -> u64 {
        self.link(&mut entry);
        let index = entry.index;
        self.uncommitted.push(entry);
        index
    }

    /// Stages a batch in the order given. Linkage is recomputed relative to
    /// the current tail; the order is the producer's and is not validated.
    pub fn append_batch(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        for entry in entries {
            self.append(entry);
        }
    }

    /// Flushes the whole staging buffer to durable storage.
    ///
    /// On an I/O failure the buffer is left untouched.
    pub fn commit(&mut self) -> Result<&LogEntry, WalError> {
        let Some(last) = self.uncommitted.last().cloned() else {
            return Err(WalError::EmptyCommit);
        };
        self.store.append(&self.uncommitted)?;
        self.last_committed = last;
        self.uncommitted.clear();
        Ok(&self.last_committed)
    }

    /// Drops every staged entry, returning how many were dropped.
    pub fn discard_uncommitted(&mut self) -> usize {
        let dropped = self.uncommitted.len();
        if dropped > 0 {
            self.uncommitted.clear();
            self.generation += 1;
        }
        dropped
    }

    /// Changes whenever staged entries are thrown away.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The most recently committed entry, or the zero entry.
    pub fn last_op(&self) -> LogEntry {
        self.last_committed.clone()
    }

    pub fn len_committed(&self) -> u64 {
        self.last_committed.index
    }

    pub fn len_uncommitted(&self) -> u64 {
        self.len_committed() + self.uncommitted.len() as u64
    }

    /// Whether `entry` sits directly after the committed tail.
    pub fn extends_committed(&self, entry: &LogEntry) -> bool {
        entry.prev_index == self.last_committed.index && entry.prev_term == self.last_committed.term
    }

    /// Committed entries with an index above `from_index`, newest first.
    ///
    /// Scans the whole durable log; meant for bulk catch-up only.
    pub fn suffix(&self, from_index: u64) -> Result<Vec<LogEntry>, WalError> {
        let mut entries: Vec<LogEntry> = self
            .store
            .entries()?
            .into_iter()
            .filter(|entry| entry.index > from_index)
            .collect();
        entries.reverse();
        Ok(entries)
    }

    /// Copy of the staging buffer, safe to use after releasing the guard.
    pub fn uncommitted_snapshot(&self) -> Vec<LogEntry> {
        self.uncommitted.clone()
    }
}

impl fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("last_committed", &self.last_committed)
            .field("uncommitted", &self.uncommitted.len())
            .field("generation", &self.generation)
            .finish()
    }
}
