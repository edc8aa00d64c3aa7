// SPDX-License-Identifier: Apache-2.0

//! Durable file-offset store.
//!
//! Maps `(path, inode)` to the byte offset following the last acknowledged
//! record. The on-disk form is textual, one `inode offset path` line per
//! watched path, replaced atomically via write-to-temp-then-rename. A missing
//! or corrupt store is not an error: the process starts with no prior
//! knowledge and aligns from the end of each file.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// How long dirty entries may sit in memory before a flush.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    inode: u64,
    offset: u64,
}

struct Inner {
    entries: HashMap<PathBuf, Entry>,
    dirty: bool,
    last_flush: Instant,
}

/// Offset store shared between the tail thread and the sink tasks. The store
/// serialises its own access; callers never coordinate around it.
pub struct OffsetStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl OffsetStore {
    /// Open the store, loading any prior state. Unreadable or malformed
    /// content is discarded with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => parse(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "offset store unreadable, starting empty");
                HashMap::new()
            }
        };

        debug!(path = %path.display(), entries = entries.len(), "offset store opened");

        Self {
            path,
            inner: Mutex::new(Inner {
                entries,
                dirty: false,
                last_flush: Instant::now(),
            }),
        }
    }

    /// Stored offset for `(path, inode)`, or None when unknown or the path
    /// has rotated to a different inode since the entry was written.
    pub fn get(&self, path: &Path, inode: u64) -> Option<u64> {
        let inner = self.inner.lock().expect("offset store poisoned");
        inner
            .entries
            .get(path)
            .filter(|e| e.inode == inode)
            .map(|e| e.offset)
    }

    /// Offset to resume from at startup: the stored offset when the inode
    /// still matches and the file has not shrunk below it.
    pub fn resume_offset(&self, path: &Path, inode: u64, size: u64) -> Option<u64> {
        self.get(path, inode).filter(|off| *off <= size)
    }

    /// Record a new offset. A rotation replaces the entry for the path, so
    /// the store never accumulates dead inodes.
    pub fn put(&self, path: &Path, inode: u64, offset: u64) {
        let mut inner = self.inner.lock().expect("offset store poisoned");
        inner
            .entries
            .insert(path.to_path_buf(), Entry { inode, offset });
        inner.dirty = true;
    }

    /// Flush if dirty and the flush interval has elapsed. Called from the
    /// watcher tick.
    pub fn maybe_flush(&self) {
        let due = {
            let inner = self.inner.lock().expect("offset store poisoned");
            inner.dirty && inner.last_flush.elapsed() >= FLUSH_INTERVAL
        };
        if due {
            if let Err(e) = self.flush() {
                warn!(path = %self.path.display(), error = %e, "offset flush failed");
            }
        }
    }

    /// Write the store to disk atomically.
    pub fn flush(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().expect("offset store poisoned");
        if !inner.dirty {
            return Ok(());
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            for (path, entry) in &inner.entries {
                writeln!(
                    w,
                    "{} {} {}",
                    entry.inode,
                    entry.offset,
                    path.display()
                )?;
            }
            w.flush()?;
        }
        fs::rename(&tmp, &self.path)?;

        inner.dirty = false;
        inner.last_flush = Instant::now();
        Ok(())
    }
}

fn parse(text: &str) -> HashMap<PathBuf, Entry> {
    let mut entries = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        let parsed = match (parts.next(), parts.next(), parts.next()) {
            (Some(inode), Some(offset), Some(path)) => {
                match (inode.parse::<u64>(), offset.parse::<u64>()) {
                    (Ok(inode), Ok(offset)) => Some((PathBuf::from(path), Entry { inode, offset })),
                    _ => None,
                }
            }
            _ => None,
        };
        match parsed {
            Some((path, entry)) => {
                entries.insert(path, entry);
            }
            None => {
                warn!(line, "skipping malformed offset entry");
            }
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("offsets");

        let store = OffsetStore::open(&store_path);
        store.put(Path::new("/var/log/a.log"), 42, 1000);
        store.put(Path::new("/var/log/b.log"), 7, 55);
        store.flush().unwrap();

        let reloaded = OffsetStore::open(&store_path);
        assert_eq!(reloaded.get(Path::new("/var/log/a.log"), 42), Some(1000));
        assert_eq!(reloaded.get(Path::new("/var/log/b.log"), 7), Some(55));
        // Inode mismatch means rotation happened: no prior knowledge.
        assert_eq!(reloaded.get(Path::new("/var/log/a.log"), 43), None);
    }

    #[test]
    fn rotation_replaces_entry() {
        let dir = tempdir().unwrap();
        let store = OffsetStore::open(dir.path().join("offsets"));

        store.put(Path::new("/l/x.log"), 1, 500);
        store.put(Path::new("/l/x.log"), 2, 10);
        assert_eq!(store.get(Path::new("/l/x.log"), 1), None);
        assert_eq!(store.get(Path::new("/l/x.log"), 2), Some(10));
    }

    #[test]
    fn resume_offset_respects_truncation() {
        let dir = tempdir().unwrap();
        let store = OffsetStore::open(dir.path().join("offsets"));
        store.put(Path::new("/l/y.log"), 9, 300);

        assert_eq!(store.resume_offset(Path::new("/l/y.log"), 9, 400), Some(300));
        assert_eq!(store.resume_offset(Path::new("/l/y.log"), 9, 300), Some(300));
        // File shrank below the stored offset: treat as unknown.
        assert_eq!(store.resume_offset(Path::new("/l/y.log"), 9, 100), None);
    }

    #[test]
    fn corrupt_store_is_non_fatal() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("offsets");
        fs::write(&store_path, "not a number 12 /x\n77\n12 34 /ok/path\n").unwrap();

        let store = OffsetStore::open(&store_path);
        assert_eq!(store.get(Path::new("/ok/path"), 12), Some(34));
        assert_eq!(store.get(Path::new("/x"), 12), None);
    }

    #[test]
    fn paths_with_spaces_survive() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("offsets");

        let store = OffsetStore::open(&store_path);
        store.put(Path::new("/var/log/my app/out.log"), 5, 99);
        store.flush().unwrap();

        let reloaded = OffsetStore::open(&store_path);
        assert_eq!(
            reloaded.get(Path::new("/var/log/my app/out.log"), 5),
            Some(99)
        );
    }
}
