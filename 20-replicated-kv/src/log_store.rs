//! Durable backing for the write-ahead log.
//!
//! [`FileLogStore`] keeps one JSON record per line and fsyncs after every
//! append. Reading the newest record seeks backward from the end of the file
//! instead of scanning it, so restart cost does not grow with the log.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::wal::{LogEntry, WalError};

/// Storage the write-ahead log commits into.
pub trait LogStore: Send + Sync {
    /// Appends `entries` in order; they must be durable when this returns.
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), WalError>;

    /// The newest entry, if any.
    fn newest(&self) -> Result<Option<LogEntry>, WalError>;

    /// Every entry in append order.
    fn entries(&self) -> Result<Vec<LogEntry>, WalError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryLogStore {
    entries: Vec<LogEntry>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated store, handy for replicas that should start with history.
    pub fn with_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }
}

impl LogStore for MemoryLogStore {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), WalError> {
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn newest(&self) -> Result<Option<LogEntry>, WalError> {
        Ok(self.entries.last().cloned())
    }

    fn entries(&self) -> Result<Vec<LogEntry>, WalError> {
        Ok(self.entries.clone())
    }
}

const TAIL_CHUNK: usize = 4096;

/// JSON-lines log file.
#[derive(Debug)]
pub struct FileLogStore {
    path: PathBuf,
}

impl FileLogStore {
    /// Opens (or creates) the log at `path`.
    ///
    /// A trailing record without its newline is the remains of a write that
    /// was interrupted before fsync returned; it is cut off here so later
    /// appends start on a clean line.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WalError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let dropped = truncate_torn_tail(&mut file)?;
        if dropped > 0 {
            warn!(path = %path.display(), bytes = dropped, "discarded torn record at end of log");
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogStore for FileLogStore {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), WalError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(entries.len() * 128);
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    fn newest(&self) -> Result<Option<LogEntry>, WalError> {
        let mut file = File::open(&self.path)?;
        match read_last_line(&mut file)? {
            Some(line) => Ok(Some(serde_json::from_slice(&line)?)),
            None => Ok(None),
        }
    }

    fn entries(&self) -> Result<Vec<LogEntry>, WalError> {
        let content = fs::read(&self.path)?;
        let complete = match content.iter().rposition(|&b| b == b'\n') {
            Some(end) => &content[..=end],
            None => &[][..],
        };

        complete
            .split(|&b| b == b'\n')
            .filter(|line| !is_blank(line))
            .map(|line| serde_json::from_slice(line).map_err(WalError::from))
            .collect()
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Offset of the last `\n` strictly before `before`.
fn rfind_newline(file: &mut File, before: u64) -> io::Result<Option<u64>> {
    let mut chunk = vec![0u8; TAIL_CHUNK];
    let mut pos = before;
    while pos > 0 {
        let step = TAIL_CHUNK.min(pos as usize);
        pos -= step as u64;
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut chunk[..step])?;
        if let Some(i) = chunk[..step].iter().rposition(|&b| b == b'\n') {
            return Ok(Some(pos + i as u64));
        }
    }
    Ok(None)
}

/// Last non-blank, newline-terminated line of the file.
fn read_last_line(file: &mut File) -> io::Result<Option<Vec<u8>>> {
    let len = file.seek(SeekFrom::End(0))?;
    let Some(mut end) = rfind_newline(file, len)? else {
        return Ok(None);
    };

    loop {
        let start = rfind_newline(file, end)?.map_or(0, |i| i + 1);
        let mut line = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut line)?;
        if !is_blank(&line) {
            return Ok(Some(line));
        }
        if start == 0 {
            return Ok(None);
        }
        end = start - 1;
    }
}

/// Cuts everything after the last newline. Returns the number of bytes cut.
fn truncate_torn_tail(file: &mut File) -> io::Result<u64> {
    let len = file.seek(SeekFrom::End(0))?;
    if len == 0 {
        return Ok(0);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(0);
    }

    let keep = rfind_newline(file, len)?.map_or(0, |i| i + 1);
    file.set_len(keep)?;
    file.sync_all()?;
    Ok(len - keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::Op;

    fn entry(index: u64, value: &str) -> LogEntry {
        LogEntry {
            op: Some(Op::Update),
            operand: "key".into(),
            value1: value.into(),
            term: 1,
            index,
            prev_index: index - 1,
            prev_term: if index > 1 { 1 } else { 0 },
            ..Default::default()
        }
    }

    #[test]
    fn newest_of_empty_file_is_none() -> Result<(), WalError> {
        let dir = tempfile::tempdir()?;
        let store = FileLogStore::open(dir.path().join("empty.log"))?;
        assert!(store.newest()?.is_none());
        assert!(store.entries()?.is_empty());
        Ok(())
    }

    #[test]
    fn newest_reads_across_chunk_boundaries() -> Result<(), WalError> {
        let dir = tempfile::tempdir()?;
        let mut store = FileLogStore::open(dir.path().join("big.log"))?;

        // Values longer than a chunk force the backward scan to stitch reads.
        let long = "x".repeat(TAIL_CHUNK + 17);
        let batch: Vec<LogEntry> = (1..=5).map(|i| entry(i, &long)).collect();
        store.append(&batch)?;
        store.append(&[entry(6, "last")])?;

        let newest = store.newest()?.expect("log has entries");
        assert_eq!(newest.index, 6);
        assert_eq!(newest.value1, "last");
        assert_eq!(store.entries()?.len(), 6);
        Ok(())
    }

    #[test]
    fn torn_tail_is_dropped_on_open() -> Result<(), WalError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("torn.log");
        {
            let mut store = FileLogStore::open(&path)?;
            store.append(&[entry(1, "a"), entry(2, "b")])?;
        }
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(br#"{"operation":"update","operand":"key","val"#)?;
        drop(file);

        let mut store = FileLogStore::open(&path)?;
        assert_eq!(store.newest()?.map(|e| e.index), Some(2));

        store.append(&[entry(3, "c")])?;
        let indices: Vec<u64> = store.entries()?.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn blank_lines_are_skipped() -> Result<(), WalError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blank.log");
        let mut store = FileLogStore::open(&path)?;
        store.append(&[entry(1, "a")])?;
        OpenOptions::new().append(true).open(&path)?.write_all(b"\n\n")?;

        assert_eq!(store.newest()?.map(|e| e.index), Some(1));
        assert_eq!(store.entries()?.len(), 1);
        Ok(())
    }

    #[test]
    fn records_use_wire_field_names() -> Result<(), WalError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fields.log");
        let mut store = FileLogStore::open(&path)?;
        store.append(&[entry(1, "a")])?;

        let text = fs::read_to_string(&path)?;
        assert!(text.contains(r#""operation":"update""#));
        assert!(text.contains(r#""prev_index":0"#));
        Ok(())
    }
}
