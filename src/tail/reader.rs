// SPDX-License-Identifier: Apache-2.0

//! Per-file buffered line extraction with rotation handling.
//!
//! The reader owns the open descriptor for one watched path. While the
//! descriptor is open the inode stays alive, so a rotated-away file can be
//! drained before it is released. The partial-line buffer never grows past
//! `max_line_len`; an over-length line is cut at the bound, with the bound
//! acting as an implicit terminator.

use std::fs::File;
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};

use memchr::{memchr, memrchr};
use tracing::{debug, info, warn};

use crate::offsets::OffsetStore;

/// A complete line handed to the pipeline.
pub struct Line<'a> {
    /// Line bytes, including the trailing newline when the source had one.
    pub bytes: &'a [u8],
    /// Byte position in the file immediately after this line.
    pub end_offset: u64,
    /// Inode the bytes came from.
    pub inode: u64,
}

pub struct LineReader {
    path: PathBuf,
    file: Option<File>,
    inode: u64,
    /// Last observed file size.
    size: u64,
    /// File offset of the next byte to read.
    pos: u64,
    /// File offset corresponding to `buffer[0]`.
    emit_base: u64,
    /// Partial-line residue; `emit_base + buffer.len() == pos`.
    buffer: Vec<u8>,
    max_line_len: usize,
}

impl LineReader {
    /// Open a watched path. When the offset store knows this `(path, inode)`
    /// and the file has not shrunk below the stored offset, reading resumes
    /// there; otherwise the cursor aligns to the last newline near the end
    /// of the file and a fresh entry is persisted.
    pub fn attach(
        path: impl AsRef<Path>,
        max_line_len: usize,
        store: &OffsetStore,
    ) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let md = file.metadata()?;

        let mut reader = Self {
            path,
            file: Some(file),
            inode: md.ino(),
            size: md.len(),
            pos: 0,
            emit_base: 0,
            buffer: Vec::with_capacity(max_line_len),
            max_line_len,
        };

        match store.resume_offset(&reader.path, reader.inode, reader.size) {
            Some(offset) => {
                debug!(path = %reader.path.display(), offset, "resuming from stored offset");
                reader.pos = offset;
                reader.emit_base = offset;
            }
            None => {
                reader.align_end()?;
                store.put(&reader.path, reader.inode, reader.pos);
            }
        }

        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Bytes of residue currently buffered.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Seek back at most `max_line_len` bytes from end-of-file, position the
    /// cursor after the last newline, and seed the buffer with what follows.
    /// A window with no newline at all becomes residue in its entirety.
    fn align_end(&mut self) -> io::Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        if self.size == 0 {
            return Ok(());
        }

        let window = (self.size as usize).min(self.max_line_len);
        let start = self.size - window as u64;
        let mut tail = vec![0u8; window];
        let n = read_full(file, &mut tail, start)?;
        tail.truncate(n);

        self.pos = start + n as u64;
        match memrchr(b'\n', &tail) {
            Some(k) => {
                self.buffer.clear();
                self.buffer.extend_from_slice(&tail[k + 1..]);
                self.emit_base = start + k as u64 + 1;
            }
            None => {
                self.buffer = tail;
                self.emit_base = start;
            }
        }
        Ok(())
    }

    /// Read newly appended bytes and feed every complete line to `emit`.
    /// Detects in-place truncation (size regression) and re-opens the path.
    pub fn advance(&mut self, mut emit: impl FnMut(Line<'_>)) -> io::Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };

        let md = file.metadata()?;
        if md.len() < self.size {
            info!(path = %self.path.display(), "file truncated, reopening");
            self.reopen(&mut emit)?;
        } else {
            self.size = md.len();
        }

        self.drain(&mut emit)
    }

    fn drain(&mut self, emit: &mut impl FnMut(Line<'_>)) -> io::Result<()> {
        loop {
            if self.buffer.len() >= self.max_line_len {
                // Over-length line: the bound is an implicit terminator.
                let end = self.emit_base + self.buffer.len() as u64;
                warn!(path = %self.path.display(), "line exceeds buffer, truncating");
                emit(Line {
                    bytes: &self.buffer,
                    end_offset: end,
                    inode: self.inode,
                });
                self.emit_base = end;
                self.buffer.clear();
                continue;
            }

            let Some(file) = &self.file else {
                return Ok(());
            };
            if self.pos >= self.size {
                return Ok(());
            }

            let want = (self.max_line_len - self.buffer.len()).min((self.size - self.pos) as usize);
            let mut chunk = vec![0u8; want];
            let n = read_full(file, &mut chunk, self.pos)?;
            if n == 0 {
                // Size said there was more but the read came up empty;
                // refresh on the next notification.
                self.size = self.pos;
                return Ok(());
            }
            chunk.truncate(n);
            self.pos += n as u64;
            self.buffer.extend_from_slice(&chunk);

            self.extract_lines(emit);
        }
    }

    fn extract_lines(&mut self, emit: &mut impl FnMut(Line<'_>)) {
        let mut start = 0usize;
        while let Some(k) = memchr(b'\n', &self.buffer[start..]) {
            let end = start + k + 1;
            emit(Line {
                bytes: &self.buffer[start..end],
                end_offset: self.emit_base + end as u64,
                inode: self.inode,
            });
            start = end;
        }
        if start > 0 {
            self.buffer.drain(..start);
            self.emit_base += start as u64;
        }
    }

    /// Emit any buffered residue as a final line. Used when the inode is
    /// about to change underneath the context.
    fn flush_residue(&mut self, emit: &mut impl FnMut(Line<'_>)) {
        if self.buffer.is_empty() {
            return;
        }
        let end = self.emit_base + self.buffer.len() as u64;
        emit(Line {
            bytes: &self.buffer,
            end_offset: end,
            inode: self.inode,
        });
        self.emit_base = end;
        self.buffer.clear();
    }

    /// Close the old descriptor and open the path fresh from offset zero.
    /// A freshly rotated file starts empty, so no alignment is performed.
    fn reopen(&mut self, emit: &mut impl FnMut(Line<'_>)) -> io::Result<()> {
        self.flush_residue(emit);

        match File::open(&self.path) {
            Ok(file) => {
                let md = file.metadata()?;
                self.file = Some(file);
                self.inode = md.ino();
                self.size = md.len();
                self.pos = 0;
                self.emit_base = 0;
            }
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "reopen failed, waiting for path");
                self.file = None;
            }
        }
        Ok(())
    }

    /// True when the open descriptor points at an unlinked inode with no
    /// bytes left to drain. Only then may the descriptor be released.
    pub fn drained_unlinked(&self) -> bool {
        match &self.file {
            Some(file) => match file.metadata() {
                Ok(md) => md.nlink() == 0 && self.pos >= md.len(),
                Err(_) => true,
            },
            None => false,
        }
    }

    /// Drop the descriptor; the context waits for the path to reappear.
    pub fn release(&mut self) {
        if self.file.take().is_some() {
            info!(path = %self.path.display(), inode = self.inode, "released unlinked file");
        }
    }

    /// Attempt to adopt a re-created path. Returns true when a new inode (or
    /// a truncated same-inode file) was adopted; reading then starts from
    /// offset zero.
    pub fn try_reopen(&mut self, mut emit: impl FnMut(Line<'_>)) -> io::Result<bool> {
        if self.file.is_some() {
            return Ok(false);
        }

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Ok(false),
        };
        let md = file.metadata()?;

        if md.ino() == self.inode && md.len() >= self.size {
            // Same file came back with nothing new underneath; keep waiting
            // rather than re-reading bytes we already emitted.
            return Ok(false);
        }

        info!(path = %self.path.display(), old_inode = self.inode, new_inode = md.ino(), "watching rotated file");
        self.flush_residue(&mut emit);

        self.file = Some(file);
        self.inode = md.ino();
        self.size = md.len();
        self.pos = 0;
        self.emit_base = 0;
        Ok(true)
    }
}

fn read_full(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut read = 0usize;
    while read < buf.len() {
        match file.read_at(&mut buf[read..], offset + read as u64) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn collect(reader: &mut LineReader) -> Vec<(Vec<u8>, u64)> {
        let mut out = Vec::new();
        reader
            .advance(|line| out.push((line.bytes.to_vec(), line.end_offset)))
            .unwrap();
        out
    }

    fn store_in(dir: &tempfile::TempDir) -> OffsetStore {
        OffsetStore::open(dir.path().join("offsets"))
    }

    #[test]
    fn aligns_to_last_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("basic.log");
        std::fs::write(&path, b"12\n456").unwrap();

        let store = store_in(&dir);
        let mut reader = LineReader::attach(&path, 10240, &store).unwrap();
        assert_eq!(reader.pending(), 3);

        // nothing new yet
        assert!(collect(&mut reader).is_empty());

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"\n789\n").unwrap();

        let lines = collect(&mut reader);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, b"456\n");
        assert_eq!(lines[0].1, 7);
        assert_eq!(lines[1].0, b"789\n");
        assert_eq!(lines[1].1, 11);
    }

    #[test]
    fn resumes_from_stored_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"one\ntwo\nthree\n").unwrap();

        let store = store_in(&dir);
        let md = std::fs::metadata(&path).unwrap();
        store.put(&path, md.ino(), 4); // after "one\n"

        let mut reader = LineReader::attach(&path, 10240, &store).unwrap();
        let lines = collect(&mut reader);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, b"two\n");
        assert_eq!(lines[0].1, 8);
        assert_eq!(lines[1].0, b"three\n");
        assert_eq!(lines[1].1, 14);
    }

    #[test]
    fn stale_offset_falls_back_to_alignment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"one\ntwo\n").unwrap();

        let store = store_in(&dir);
        let md = std::fs::metadata(&path).unwrap();
        store.put(&path, md.ino(), 500); // beyond EOF

        let mut reader = LineReader::attach(&path, 10240, &store).unwrap();
        // aligned to end, fresh entry persisted
        assert!(collect(&mut reader).is_empty());
        assert_eq!(store.get(&path, md.ino()), Some(8));
    }

    #[test]
    fn truncation_reopens_and_reads_from_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rot.log");
        std::fs::write(&path, b"old line\n").unwrap();

        let store = store_in(&dir);
        let mut reader = LineReader::attach(&path, 10240, &store).unwrap();
        assert!(collect(&mut reader).is_empty());

        // log rotation by copy-truncate
        std::fs::write(&path, b"").unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"abcd\n").unwrap();

        let lines = collect(&mut reader);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, b"abcd\n");
        assert_eq!(lines[0].1, 5);
    }

    #[test]
    fn rename_rotation_drains_then_adopts_new_inode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rot.log");
        std::fs::write(&path, b"first\n").unwrap();

        let store = store_in(&dir);
        let mut reader = LineReader::attach(&path, 10240, &store).unwrap();
        let old_inode = reader.inode();

        // writer appends, then the rotator renames the file away
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"last\n").unwrap();
        drop(f);
        std::fs::rename(&path, dir.path().join("rot.log.1")).unwrap();

        // the open descriptor still drains appended bytes
        let lines = collect(&mut reader);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, b"last\n");

        // not unlinked (renamed target still exists), so not defunct
        assert!(!reader.drained_unlinked());

        // new file appears at the path
        std::fs::write(&path, b"fresh\n").unwrap();
        let mut emitted = Vec::new();
        let adopted = reader
            .try_reopen(|line| emitted.push(line.bytes.to_vec()))
            .unwrap();
        assert!(!adopted, "descriptor still open, no reopen yet");

        // after release (or unlink detection) the new inode is adopted
        reader.release();
        let adopted = reader
            .try_reopen(|line| emitted.push(line.bytes.to_vec()))
            .unwrap();
        assert!(adopted);
        assert_ne!(reader.inode(), old_inode);

        let lines = collect(&mut reader);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, b"fresh\n");
        assert_eq!(lines[0].1, 6);
    }

    #[test]
    fn unlinked_file_drains_before_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.log");
        std::fs::write(&path, b"a\n").unwrap();

        let store = store_in(&dir);
        let mut reader = LineReader::attach(&path, 10240, &store).unwrap();

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"tail\n").unwrap();
        drop(f);
        std::fs::remove_file(&path).unwrap();

        assert!(!reader.drained_unlinked(), "bytes remain to drain");
        let lines = collect(&mut reader);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, b"tail\n");

        assert!(reader.drained_unlinked());
        reader.release();
        assert!(!reader.is_open());
    }

    #[test]
    fn over_length_line_is_truncated_at_bound() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.log");
        std::fs::write(&path, b"\n").unwrap();

        let store = store_in(&dir);
        let mut reader = LineReader::attach(&path, 8, &store).unwrap();

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"0123456789abcde\nok\n").unwrap();

        let lines = collect(&mut reader);
        // 8-byte implicit line, the 8-byte remainder with its newline, then "ok\n"
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].0, b"01234567");
        assert_eq!(lines[0].1, 9);
        assert_eq!(lines[1].0, b"89abcde\n");
        assert_eq!(lines[1].1, 17);
        assert_eq!(lines[2].0, b"ok\n");
        assert_eq!(lines[2].1, 20);
    }

    #[test]
    fn alignment_window_without_newline_becomes_residue() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.log");
        std::fs::write(&path, b"partial-without-newline").unwrap();

        let store = store_in(&dir);
        let mut reader = LineReader::attach(&path, 10240, &store).unwrap();
        assert_eq!(reader.pending(), 23);

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b" done\n").unwrap();

        let lines = collect(&mut reader);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, b"partial-without-newline done\n");
        assert_eq!(lines[0].1, 29);
    }
}
