// SPDX-License-Identifier: Apache-2.0

//! The watcher thread: file observation, line extraction, transformation
//! and sink dispatch run serially here. Suspension points are the notifier
//! wait (bounded at 500 ms) and blocking sends into sink queues, which is
//! where downstream saturation stalls file consumption.

pub mod reader;
pub mod watcher;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::BoundedSender;
use crate::config::{resolve_index, Config, FileConfig, PipelineSpec, RouteSpec};
use crate::offsets::OffsetStore;
use crate::pipeline::script::{CommandHost, ScriptError};
use crate::pipeline::{Emitted, Pipeline};
use crate::record::{FileRecord, Route};
use crate::sinks::http::HttpDispatcher;
use crate::stats::Stats;
use crate::tail::reader::LineReader;
use crate::tail::watcher::PathWatcher;

/// Notifier wait bound; housekeeping and staleness flushes run at least
/// this often.
pub const WATCH_TICK: Duration = Duration::from_millis(500);
/// A file whose activity sequence trails the global sequence by more than
/// this many ticks has its aggregation cache drained.
pub const STALE_TICKS: u64 = 1000;

/// Where the coordinator hands records off. Both sinks are optional; a
/// configuration with only topics runs without the HTTP fan and vice versa.
pub struct SinkHandles {
    pub kafka: Option<BoundedSender<Vec<FileRecord>>>,
    pub http: Option<HttpDispatcher>,
}

struct FileContext {
    reader: LineReader,
    pipeline: Pipeline,
    route: RouteSpec,
    label: String,
    sn: u64,
}

/// Build the per-file pipeline, spawning the script host subprocess for
/// scripted kinds.
pub fn build_pipeline(config: &FileConfig, host: &str) -> Result<Pipeline, ScriptError> {
    let host = host.to_string();
    let (withhost, withtime, timeidx) = (config.withhost, config.withtime, config.timeidx);
    Ok(match &config.pipeline {
        PipelineSpec::Raw => Pipeline::raw(host, withhost, withtime, timeidx),
        PipelineSpec::Transform(s) => Pipeline::transform(
            Box::new(CommandHost::spawn(&s.command)?),
            host,
            withhost,
            withtime,
            timeidx,
        ),
        PipelineSpec::Grep(s) => Pipeline::grep(
            Box::new(CommandHost::spawn(&s.command)?),
            host,
            withhost,
            withtime,
            timeidx,
        ),
        PipelineSpec::Filter(fields) => {
            Pipeline::filter(fields.clone(), host, withhost, withtime, timeidx)
        }
        PipelineSpec::Aggregate(s) => Pipeline::aggregate(
            Box::new(CommandHost::spawn(&s.command)?),
            host,
            withhost,
            withtime,
            timeidx,
        ),
    })
}

pub struct Coordinator {
    contexts: Vec<FileContext>,
    by_path: HashMap<PathBuf, usize>,
    watcher: PathWatcher,
    offsets: Arc<OffsetStore>,
    sinks: SinkHandles,
    stats: Arc<Stats>,
    cancel: CancellationToken,
    sn: u64,
}

impl Coordinator {
    /// Attach every configured file and install its watch. All failures
    /// here are startup failures and abort the agent.
    pub fn new(
        config: &Config,
        host: &str,
        offsets: Arc<OffsetStore>,
        sinks: SinkHandles,
        stats: Arc<Stats>,
        cancel: CancellationToken,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut watcher = PathWatcher::new()?;
        let mut contexts = Vec::with_capacity(config.files.len());
        let mut by_path = HashMap::new();

        for (i, fc) in config.files.iter().enumerate() {
            let reader = LineReader::attach(&fc.file, fc.max_line_len, &offsets)
                .map_err(|e| format!("{}: {e}", fc.file.display()))?;
            let pipeline = build_pipeline(fc, host)
                .map_err(|e| format!("{}: {e}", fc.file.display()))?;

            watcher
                .watch(&fc.file)
                .map_err(|e| format!("{}: {e}", fc.file.display()))?;

            info!(
                file = %fc.file.display(),
                route = ?fc.route,
                autosplit = fc.autosplit,
                "watching file"
            );

            by_path.insert(fc.file.clone(), i);
            contexts.push(FileContext {
                reader,
                pipeline,
                route: fc.route.clone(),
                label: fc.file.display().to_string(),
                sn: 0,
            });
        }

        Ok(Self {
            contexts,
            by_path,
            watcher,
            offsets,
            sinks,
            stats,
            cancel,
            sn: 0,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("tailpost-watch".into())
            .spawn(move || self.run())
            .expect("failed to spawn watcher thread")
    }

    fn run(mut self) {
        info!(files = self.contexts.len(), "watcher thread running");

        while !self.cancel.is_cancelled() {
            let changed = self.watcher.wait(WATCH_TICK);
            let idle = changed.is_empty();

            if !idle {
                self.sn += 1;
                for path in &changed {
                    if let Some(&i) = self.by_path.get(path) {
                        self.contexts[i].sn = self.sn;
                        self.advance_context(i);
                    }
                }
            }

            self.flush_stale(idle);
            self.try_rm_watch();
            self.try_re_watch();
            self.offsets.maybe_flush();
        }

        self.shutdown();
    }

    fn advance_context(&mut self, i: usize) {
        let mut lines = Vec::new();
        let ctx = &mut self.contexts[i];
        if let Err(e) = ctx
            .reader
            .advance(|line| lines.push((line.bytes.to_vec(), line.end_offset, line.inode)))
        {
            warn!(file = %ctx.label, error = %e, "read failed");
        }
        self.process_lines(i, lines);
    }

    fn process_lines(&mut self, i: usize, lines: Vec<(Vec<u8>, u64, u64)>) {
        for (bytes, end_offset, inode) in lines {
            let (route, records) = {
                let ctx = &mut self.contexts[i];
                let emitted = ctx.pipeline.process_line(&ctx.label, &bytes);
                (ctx.route.clone(), emitted)
            };
            let records = build_records(i, &route, inode, Some(end_offset), records);
            self.dispatch(records);
        }
    }

    /// Drain aggregation caches: every idle cycle drains everything, and a
    /// file whose activity trails the global sequence far enough drains on
    /// busy cycles too.
    fn flush_stale(&mut self, idle: bool) {
        for i in 0..self.contexts.len() {
            let flushed = {
                let ctx = &mut self.contexts[i];
                if !ctx.pipeline.has_pending_aggregation() {
                    continue;
                }
                if !idle && ctx.sn + STALE_TICKS >= self.sn {
                    continue;
                }
                ctx.sn = self.sn;
                debug!(file = %ctx.label, "flushing aggregation cache");
                (
                    ctx.route.clone(),
                    ctx.reader.inode(),
                    ctx.pipeline.flush_stale(),
                )
            };
            let (route, inode, emitted) = flushed;
            let records = build_records(i, &route, inode, None, emitted);
            self.dispatch(records);
        }
    }

    /// Release descriptors whose inode is gone and fully drained.
    fn try_rm_watch(&mut self) {
        for ctx in &mut self.contexts {
            if ctx.reader.is_open() && ctx.reader.drained_unlinked() {
                self.watcher.unwatch(ctx.reader.path());
                ctx.reader.release();
            }
        }
    }

    /// Re-open contexts whose path resolves again, reading the new file
    /// from offset zero.
    fn try_re_watch(&mut self) {
        for i in 0..self.contexts.len() {
            if self.contexts[i].reader.is_open() {
                continue;
            }

            let mut residue = Vec::new();
            let adopted = self.contexts[i]
                .reader
                .try_reopen(|line| residue.push((line.bytes.to_vec(), line.end_offset, line.inode)));

            match adopted {
                Ok(true) => {
                    let path = self.contexts[i].reader.path().to_path_buf();
                    if let Err(e) = self.watcher.watch(&path) {
                        warn!(file = %path.display(), error = %e, "re-watch failed");
                    }
                    self.contexts[i].sn = self.sn;
                    self.process_lines(i, residue);
                    self.advance_context(i);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(file = %self.contexts[i].label, error = %e, "reopen failed");
                }
            }
        }
    }

    fn dispatch(&mut self, records: Vec<FileRecord>) {
        if records.is_empty() {
            return;
        }
        self.stats.record_received(records.len() as u64);

        let is_topic = matches!(records[0].route, Route::Topic(_));
        if is_topic {
            if let Some(tx) = &self.sinks.kafka {
                if tx.send_blocking(records).is_err() {
                    debug!("kafka queue closed, records dropped");
                }
            } else {
                debug!("no kafka sink configured, records dropped");
            }
        } else if let Some(http) = &mut self.sinks.http {
            for record in records {
                if http.dispatch(record).is_err() {
                    debug!("http queue closed, records dropped");
                    break;
                }
            }
        } else {
            debug!("no http sink configured, records dropped");
        }
    }

    /// Final aggregation flush and offset write before the thread exits.
    fn shutdown(&mut self) {
        info!("watcher thread stopping");

        for i in 0..self.contexts.len() {
            let flushed = {
                let ctx = &mut self.contexts[i];
                if !ctx.pipeline.has_pending_aggregation() {
                    continue;
                }
                (
                    ctx.route.clone(),
                    ctx.reader.inode(),
                    ctx.pipeline.flush_stale(),
                )
            };
            let (route, inode, emitted) = flushed;
            let records = build_records(i, &route, inode, None, emitted);
            self.dispatch(records);
        }

        if let Err(e) = self.offsets.flush() {
            warn!(error = %e, "final offset flush failed");
        }
    }
}

fn build_records(
    file: usize,
    route: &RouteSpec,
    inode: u64,
    line_end: Option<u64>,
    emitted: Vec<Emitted>,
) -> Vec<FileRecord> {
    emitted
        .into_iter()
        .map(|e| {
            let offset = if e.offset_bearing { line_end } else { None };
            let route = match route {
                RouteSpec::Topic(t) => Route::Topic(t.clone()),
                RouteSpec::Index(tpl) => Route::Index(resolve_index(tpl, e.time_key.as_deref())),
            };
            FileRecord::new(Bytes::from(e.payload), route, file, inode, offset)
        })
        .collect()
}
