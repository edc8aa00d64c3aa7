// SPDX-License-Identifier: Apache-2.0

//! Kafka sink.
//!
//! One task bridges record groups from the tail thread to the rdkafka
//! producer. Each delivery future is the message's delivery report: success
//! commits the record's offset, a retriable failure re-enqueues the record
//! after a short backoff, a terminal failure drops it and counts an error.
//! The producer honours the shared block flag raised by the HTTP flow
//! controller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::channel::BoundedReceiver;
use crate::offsets::OffsetStore;
use crate::record::{FileRecord, FileTable, Route};
use crate::stats::Stats;

const MAX_IN_FLIGHT: usize = 1024;
const QUEUE_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RETRIES: usize = 3;
const BLOCK_POLL: Duration = Duration::from_millis(10);
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct KafkaSinkConfig {
    /// Comma-separated broker list.
    pub brokers: String,
    /// Free-form librdkafka global properties.
    pub global: HashMap<String, String>,
    /// Free-form librdkafka topic-level properties. librdkafka accepts
    /// topic properties in the global table, so both maps merge into one
    /// client config.
    pub topic: HashMap<String, String>,
}

impl KafkaSinkConfig {
    pub fn build_producer(&self) -> Result<FutureProducer, KafkaError> {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        for (k, v) in &self.global {
            config.set(k, v);
        }
        for (k, v) in &self.topic {
            config.set(k, v);
        }
        config.create()
    }
}

struct KafkaCtx {
    producer: FutureProducer,
    files: Arc<FileTable>,
    offsets: Arc<OffsetStore>,
    stats: Arc<Stats>,
}

pub struct KafkaSink {
    ctx: Arc<KafkaCtx>,
    rx: BoundedReceiver<Vec<FileRecord>>,
    block: Arc<AtomicBool>,
}

impl KafkaSink {
    pub fn new(
        config: &KafkaSinkConfig,
        rx: BoundedReceiver<Vec<FileRecord>>,
        files: Arc<FileTable>,
        offsets: Arc<OffsetStore>,
        stats: Arc<Stats>,
        block: Arc<AtomicBool>,
    ) -> Result<Self, KafkaError> {
        let producer = config.build_producer()?;
        Ok(Self {
            ctx: Arc::new(KafkaCtx {
                producer,
                files,
                offsets,
                stats,
            }),
            rx,
            block,
        })
    }

    pub async fn start(mut self, cancel: CancellationToken) {
        info!("starting kafka sink");

        let mut deliveries = FuturesUnordered::new();

        loop {
            select! {
                biased;

                Some(()) = deliveries.next(), if !deliveries.is_empty() => {}

                group = self.rx.next(), if deliveries.len() < MAX_IN_FLIGHT => {
                    match group {
                        Some(records) => {
                            for record in records {
                                // upstream backpressure raised by the HTTP sink
                                while self.block.load(Ordering::SeqCst) {
                                    tokio::time::sleep(BLOCK_POLL).await;
                                }
                                deliveries.push(deliver(self.ctx.clone(), record));
                            }
                        }
                        None => {
                            debug!("kafka sink queue closed");
                            break;
                        }
                    }
                }

                _ = cancel.cancelled() => {
                    info!("kafka sink cancelled");
                    break;
                }
            }
        }

        // Drain outstanding delivery reports, then let librdkafka flush its
        // internal queues.
        while deliveries.next().await.is_some() {}
        let _ = self.ctx.producer.flush(Timeout::After(SHUTDOWN_FLUSH));

        info!("kafka sink stopped");
    }
}

/// Submit one record and wait for its delivery report.
async fn deliver(ctx: Arc<KafkaCtx>, record: FileRecord) {
    let Route::Topic(topic) = &record.route else {
        error!("kafka sink received a non-topic record");
        return;
    };

    let mut attempt = 0usize;
    loop {
        let request = FutureRecord::<(), _>::to(topic).payload(record.payload.as_ref());
        match ctx.producer.send(request, Timeout::After(QUEUE_TIMEOUT)).await {
            Ok((partition, kafka_offset)) => {
                debug!(topic = %topic, partition, kafka_offset, "delivered");
                ctx.stats.record_sent();
                if let Some(offset) = record.offset {
                    ctx.offsets
                        .put(ctx.files.path(record.file), record.inode, offset);
                }
                return;
            }
            Err((e, _)) if is_retriable(&e) && attempt < MAX_RETRIES => {
                attempt += 1;
                debug!(topic = %topic, error = %e, attempt, "retriable produce failure");
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err((e, _)) => {
                ctx.stats.record_error();
                error!(topic = %topic, error = %e, "produce failed, dropping record");
                return;
            }
        }
    }
}

fn is_retriable(e: &KafkaError) -> bool {
    matches!(
        e,
        KafkaError::MessageProduction(
            RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
        )
    )
}
