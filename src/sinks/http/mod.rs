// SPDX-License-Identifier: Apache-2.0

//! HTTP document-store sink.
//!
//! A fan of worker tasks, each owning a bounded pool of keep-alive
//! connections and a dispatch channel the router round-robins over. Worker
//! count scales with the connection budget (one worker per 500
//! connections). Each accepted record is driven through the connection
//! state machine; transport failures rotate through the node list until the
//! record's retry budget is spent.

pub mod connection;
pub mod flow;
pub mod parser;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{bounded, BoundedReceiver, BoundedSender, SendError};
use crate::offsets::OffsetStore;
use crate::record::{FileRecord, FileTable, Route};
use crate::sinks::http::connection::{Request, SenderConnection, INACTIVITY_TIMEOUT};
use crate::sinks::http::flow::FlowController;
use crate::stats::Stats;

/// One worker per this many connections of budget.
const WORKER_SHARD: usize = 500;
/// Dispatch queue depth per worker, the wake-up-pipe analog.
const WORKER_QUEUE: usize = 1024;
/// Cadence of the idle-connection sweep.
const HOUSEKEEPING_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    pub nodes: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_connections: usize,
}

impl HttpSinkConfig {
    fn auth(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some(BASE64.encode(format!("{user}:{pass}"))),
            _ => None,
        }
    }
}

/// Handle the router uses from the tail thread: flow control, then a
/// round-robin blocking enqueue.
pub struct HttpDispatcher {
    workers: Vec<BoundedSender<FileRecord>>,
    flow: FlowController,
    next: usize,
}

impl HttpDispatcher {
    pub fn dispatch(&mut self, record: FileRecord) -> Result<(), SendError> {
        self.flow.throttle();
        let worker = self.next % self.workers.len();
        self.next = self.next.wrapping_add(1);
        self.workers[worker].send_blocking(record)
    }

    pub fn load(&self) -> usize {
        self.flow.load()
    }
}

/// Everything a delivery needs, shared by all workers.
struct DeliverCtx {
    nodes: Vec<String>,
    auth: Option<String>,
    files: Arc<FileTable>,
    offsets: Arc<OffsetStore>,
    stats: Arc<Stats>,
}

pub struct HttpSink;

impl HttpSink {
    /// Spawn the worker fan onto `task_set` and hand back the dispatcher.
    pub fn start(
        config: HttpSinkConfig,
        files: Arc<FileTable>,
        offsets: Arc<OffsetStore>,
        stats: Arc<Stats>,
        block: Arc<AtomicBool>,
        task_set: &mut JoinSet<Result<(), Box<dyn std::error::Error + Send + Sync>>>,
        cancel: &CancellationToken,
    ) -> HttpDispatcher {
        let n_workers = config.max_connections.div_ceil(WORKER_SHARD).max(1);
        let capacity = (config.max_connections / n_workers).max(1);

        info!(
            nodes = ?config.nodes,
            workers = n_workers,
            capacity_per_worker = capacity,
            "starting http sink"
        );

        let ctx = Arc::new(DeliverCtx {
            nodes: config.nodes.clone(),
            auth: config.auth(),
            files,
            offsets,
            stats,
        });

        let mut senders = Vec::with_capacity(n_workers);
        let mut gauges = Vec::with_capacity(n_workers);

        for id in 0..n_workers {
            let (tx, rx) = bounded::<FileRecord>(WORKER_QUEUE);
            let busy = Arc::new(AtomicUsize::new(0));
            senders.push(tx);
            gauges.push(busy.clone());

            let worker = Worker {
                id,
                capacity,
                rx,
                busy,
                ctx: ctx.clone(),
            };
            let cancel = cancel.clone();
            task_set.spawn(async move {
                worker.run(cancel).await;
                Ok(())
            });
        }

        HttpDispatcher {
            workers: senders,
            flow: FlowController::new(gauges, block, config.max_connections),
            next: 0,
        }
    }
}

struct Worker {
    id: usize,
    capacity: usize,
    rx: BoundedReceiver<FileRecord>,
    busy: Arc<AtomicUsize>,
    ctx: Arc<DeliverCtx>,
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken) {
        let mut pool: Vec<SenderConnection> = Vec::with_capacity(self.capacity);
        let mut in_flight = FuturesUnordered::new();
        let mut next_node = self.id; // spread fresh connections across nodes
        let mut tick = tokio::time::interval(HOUSEKEEPING_TICK);

        loop {
            select! {
                biased;

                Some(returned) = in_flight.next(), if !in_flight.is_empty() => {
                    self.busy.fetch_sub(1, Ordering::Relaxed);
                    if let Some(conn) = returned {
                        if pool.len() < self.capacity {
                            pool.push(conn);
                        }
                    }
                }

                record = self.rx.next() => {
                    match record {
                        Some(record) => {
                            let conn = pool.pop().unwrap_or_else(|| {
                                let conn = SenderConnection::new(next_node % self.ctx.nodes.len());
                                next_node = next_node.wrapping_add(1);
                                conn
                            });
                            self.busy.fetch_add(1, Ordering::Relaxed);
                            in_flight.push(deliver(self.ctx.clone(), conn, record));
                        }
                        None => {
                            debug!(worker = self.id, "http worker queue closed");
                            break;
                        }
                    }
                }

                _ = tick.tick() => {
                    pool.retain(|conn| conn.idle_for() < INACTIVITY_TIMEOUT);
                }

                _ = cancel.cancelled() => {
                    debug!(worker = self.id, "http worker cancelled");
                    break;
                }
            }
        }

        // Graceful close drains what is already in flight; a cancellation
        // abandons it. Abandoned records were never offset-committed and
        // will be re-read on the next startup.
        loop {
            select! {
                maybe = in_flight.next() => match maybe {
                    Some(_) => {
                        self.busy.fetch_sub(1, Ordering::Relaxed);
                    }
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }

        debug!(worker = self.id, abandoned = in_flight.len(), "http worker stopped");
    }
}

/// Drive one record to acknowledgement or terminal failure. Returns the
/// connection for pooling when it is still usable.
async fn deliver(
    ctx: Arc<DeliverCtx>,
    mut conn: SenderConnection,
    record: FileRecord,
) -> Option<SenderConnection> {
    let Route::Index(index) = &record.route else {
        // routing bug, not a peer problem
        error!(route = ?record.route, "http sink received a non-index record");
        return Some(conn);
    };

    let mut attempts = 0usize;
    // A pooled keep-alive connection may have been closed by the peer while
    // idle; one reconnect against the same node does not consume a retry.
    let mut reused = conn.is_open();

    loop {
        let node = ctx.nodes[conn.node()].clone();
        let request = Request::post_doc(index, &node, ctx.auth.as_deref(), Bytes::clone(&record.payload));

        match conn.exchange(&node, &request).await {
            Ok(response) => {
                ctx.stats.record_sent();
                match response.code {
                    201 => {
                        if let Some(offset) = record.offset {
                            ctx.offsets
                                .put(ctx.files.path(record.file), record.inode, offset);
                        }
                    }
                    400 | 429 => {
                        // client / flow-control condition: logged, retried
                        // nowhere, not an error
                        warn!(
                            node = %node,
                            index = %index,
                            code = response.code,
                            body = %String::from_utf8_lossy(&response.body),
                            "document rejected"
                        );
                    }
                    code => {
                        ctx.stats.record_error();
                        error!(
                            node = %node,
                            index = %index,
                            code,
                            body = %String::from_utf8_lossy(&response.body),
                            "unexpected response"
                        );
                    }
                }
                return Some(conn);
            }
            Err(e) => {
                conn.close();

                if reused {
                    reused = false;
                    debug!(node = %node, error = %e, "stale keep-alive connection, reconnecting");
                    continue;
                }

                if attempts >= ctx.nodes.len() {
                    ctx.stats.record_error();
                    error!(node = %node, index = %index, error = %e, "record failed on every node, dropping");
                    return None;
                }
                attempts += 1;

                let next = (conn.node() + 1) % ctx.nodes.len();
                warn!(
                    from = %node,
                    to = %ctx.nodes[next],
                    error = %e,
                    "switching document-store node"
                );
                conn.set_node(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_fan_scales_with_budget() {
        assert_eq!(100usize.div_ceil(WORKER_SHARD).max(1), 1);
        assert_eq!(500usize.div_ceil(WORKER_SHARD).max(1), 1);
        assert_eq!(501usize.div_ceil(WORKER_SHARD).max(1), 2);
        assert_eq!(1600usize.div_ceil(WORKER_SHARD).max(1), 4);
    }

    #[test]
    fn auth_is_base64_of_user_colon_pass() {
        let cfg = HttpSinkConfig {
            nodes: vec!["n".into()],
            username: Some("user".into()),
            password: Some("pass".into()),
            max_connections: 10,
        };
        assert_eq!(cfg.auth().as_deref(), Some("dXNlcjpwYXNz"));

        let cfg = HttpSinkConfig {
            nodes: vec!["n".into()],
            username: None,
            password: None,
            max_connections: 10,
        };
        assert_eq!(cfg.auth(), None);
    }
}
