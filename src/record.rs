// SPDX-License-Identifier: Apache-2.0

//! Records flowing from the tail thread to the sinks.
//!
//! A record is owned by exactly one sender queue after dispatch and is
//! dropped on acknowledgement. The back-reference to its file is a stable
//! index into the process-owned file table, never a pointer.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a record is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Kafka topic name.
    Topic(String),
    /// HTTP document-store index name, already resolved from any template.
    Index(String),
}

/// One emitted record.
#[derive(Debug)]
pub struct FileRecord {
    /// Payload bytes handed to the sink verbatim.
    pub payload: Bytes,
    pub route: Route,
    /// Stable index of the originating file in the [`FileTable`].
    pub file: usize,
    /// Inode the payload was read from.
    pub inode: u64,
    /// Byte position immediately after this record's source bytes, or None
    /// for records that do not map to file bytes (aggregation flushes).
    pub offset: Option<u64>,
}

impl FileRecord {
    pub fn new(payload: Bytes, route: Route, file: usize, inode: u64, offset: Option<u64>) -> Self {
        Self {
            payload,
            route,
            file,
            inode,
            offset,
        }
    }
}

/// Immutable map from file index to path, shared with the sinks so an
/// acknowledgement can be routed back to the offset store.
#[derive(Debug)]
pub struct FileTable {
    paths: Vec<PathBuf>,
}

impl FileTable {
    pub fn new(paths: Vec<PathBuf>) -> Arc<Self> {
        Arc::new(Self { paths })
    }

    pub fn path(&self, file: usize) -> &Path {
        &self.paths[file]
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
