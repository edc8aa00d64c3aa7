// SPDX-License-Identifier: Apache-2.0

//! Sink backlog flow control.
//!
//! The controller watches the sum of busy connections across HTTP workers.
//! When the sink runs more than `OVERLOAD_SLACK` past its connection budget
//! it raises the shared block flag and holds the producing thread in 10 ms
//! steps until the backlog drains. Records are delayed, never dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::info;

const OVERLOAD_SLACK: i64 = 10;
const STEP: Duration = Duration::from_millis(10);
const NOTICE_EVERY: u64 = 500;

pub struct FlowController {
    busy: Vec<Arc<AtomicUsize>>,
    block: Arc<AtomicBool>,
    max_connections: usize,
}

impl FlowController {
    pub fn new(busy: Vec<Arc<AtomicUsize>>, block: Arc<AtomicBool>, max_connections: usize) -> Self {
        Self {
            busy,
            block,
            max_connections,
        }
    }

    /// Busy connections across all workers.
    pub fn load(&self) -> usize {
        self.busy.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    /// Block the calling thread until the backlog is back under the
    /// ceiling. Sets the shared flag for other producers while waiting.
    pub fn throttle(&self) {
        let mut i: u64 = 0;
        let mut blocked = false;

        loop {
            let overload = self.load() as i64 - self.max_connections as i64;
            if overload <= OVERLOAD_SLACK {
                break;
            }
            if i % NOTICE_EVERY == 0 {
                info!(
                    overload,
                    waited_ms = i * STEP.as_millis() as u64,
                    "sink backlog, pausing upstream"
                );
                self.block.store(true, Ordering::SeqCst);
                blocked = true;
            }
            i += 1;
            thread::sleep(STEP);
        }

        if blocked {
            self.block.store(false, Ordering::SeqCst);
            info!("sink backlog drained, resuming upstream");
        }
    }
}
