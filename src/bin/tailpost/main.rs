// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::select;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use tailpost::channel::bounded;
use tailpost::config::Config;
use tailpost::offsets::OffsetStore;
use tailpost::record::{FileRecord, FileTable};
use tailpost::sinks::http::{HttpSink, HttpSinkConfig};
use tailpost::sinks::kafka::{KafkaSink, KafkaSinkConfig};
use tailpost::stats::Stats;
use tailpost::tail::{Coordinator, SinkHandles};

const SENDING_QUEUE_SIZE: usize = 1_000;

type TaskError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Parser)]
#[command(name = "tailpost")]
#[command(version, about = "Tail log files and ship records to Kafka or an HTTP document store", long_about = None)]
struct Arguments {
    /// Configuration directory holding main.toml and one document per file
    confdir: std::path::PathBuf,

    /// Log filter
    #[arg(long, env = "TAILPOST_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format
    #[arg(value_enum, long, env = "TAILPOST_LOG_FORMAT", default_value = "text")]
    log_format: LogFormatArg,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    // Configuration problems are reported before the logger exists.
    let config = match Config::load_dir(&opt.confdir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return ExitCode::from(1);
        }
    };

    let host = match resolve_host(&config) {
        Ok(host) => host,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return ExitCode::from(1);
        }
    };

    setup_logging(&opt.log_level, opt.log_format);

    match run_agent(config, host) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "agent failed");
            ExitCode::from(1)
        }
    }
}

/// Host identity: the configured shell command's stdout, or the system
/// hostname when none is configured.
fn resolve_host(config: &Config) -> Result<String, String> {
    match &config.main.host_command {
        Some(command) => {
            let out = std::process::Command::new("/bin/sh")
                .arg("-c")
                .arg(command)
                .output()
                .map_err(|e| format!("host command {command:?}: {e}"))?;
            if !out.status.success() {
                return Err(format!("host command {command:?} exited {}", out.status));
            }
            let host = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if host.is_empty() {
                return Err(format!("host command {command:?} produced no output"));
            }
            Ok(host)
        }
        None => Ok(gethostname::gethostname().to_string_lossy().into_owned()),
    }
}

fn setup_logging(log_level: &str, log_format: LogFormatArg) {
    if log_format == LogFormatArg::Json {
        let subscriber = Registry::default()
            .with(EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().json());
        tracing::subscriber::set_global_default(subscriber).expect("logger already installed");
    } else {
        let subscriber = Registry::default().with(EnvFilter::new(log_level)).with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact(),
        );
        tracing::subscriber::set_global_default(subscriber).expect("logger already installed");
    }
}

#[tokio::main]
async fn run_agent(config: Config, host: String) -> Result<(), TaskError> {
    info!(host = %host, files = config.files.len(), "starting tailpost");

    let offsets = Arc::new(OffsetStore::open(&config.main.offsets_file));
    let files = FileTable::new(config.files.iter().map(|f| f.file.clone()).collect());
    let stats = Stats::new();
    let block = Arc::new(AtomicBool::new(false));

    let mut sink_task_set: JoinSet<Result<(), TaskError>> = JoinSet::new();
    let sinks_cancel = CancellationToken::new();
    let tail_cancel = CancellationToken::new();

    // Kafka sink
    let kafka_tx = match &config.main.kafka {
        Some(kafka) => {
            let (tx, rx) = bounded::<Vec<FileRecord>>(SENDING_QUEUE_SIZE);
            let sink_config = KafkaSinkConfig {
                brokers: kafka.brokers.clone(),
                global: kafka.global.clone(),
                topic: kafka.topic.clone(),
            };
            let sink = KafkaSink::new(
                &sink_config,
                rx,
                files.clone(),
                offsets.clone(),
                stats.clone(),
                block.clone(),
            )
            .map_err(|e| format!("kafka producer: {e}"))?;

            let cancel = sinks_cancel.clone();
            sink_task_set.spawn(async move {
                sink.start(cancel).await;
                Ok(())
            });
            Some(tx)
        }
        None => None,
    };

    // HTTP sink
    let http = config.main.http.as_ref().map(|http| {
        HttpSink::start(
            HttpSinkConfig {
                nodes: http.nodes.clone(),
                username: http.username.clone(),
                password: http.password.clone(),
                max_connections: http.max_connections,
            },
            files.clone(),
            offsets.clone(),
            stats.clone(),
            block.clone(),
            &mut sink_task_set,
            &sinks_cancel,
        )
    });

    // Watcher thread: read, transform, dispatch.
    let coordinator = Coordinator::new(
        &config,
        &host,
        offsets.clone(),
        SinkHandles {
            kafka: kafka_tx,
            http,
        },
        stats.clone(),
        tail_cancel.clone(),
    )?;
    let tail_handle = coordinator.spawn();

    signal_wait().await;

    // Stop the watcher first; its exit flushes aggregation caches into the
    // sink queues and drops the senders, which lets the sinks drain out.
    tail_cancel.cancel();
    let join = tokio::task::spawn_blocking(move || tail_handle.join());
    if join.await.map(|r| r.is_err()).unwrap_or(true) {
        warn!("watcher thread did not exit cleanly");
    }

    let res = wait_for_tasks_with_timeout(&mut sink_task_set, Duration::from_secs(5)).await;
    if res.is_err() {
        warn!("sinks did not exit on channel close, cancelling");
        sinks_cancel.cancel();
        wait_for_tasks_with_timeout(&mut sink_task_set, Duration::from_secs(3))
            .await
            .map_err(|e| format!("timed out waiting for sinks to exit: {e}"))?;
    }

    if let Err(e) = offsets.flush() {
        warn!(error = %e, "final offset flush failed");
    }

    let (received, sent, errors) = stats.snapshot();
    info!(received, sent, errors, "tailpost stopped");
    Ok(())
}

async fn wait_for_tasks_with_timeout(
    tasks: &mut JoinSet<Result<(), TaskError>>,
    timeout: Duration,
) -> Result<(), TaskError> {
    let stop_at = Instant::now() + timeout;
    let mut result = Ok(());
    loop {
        match timeout_at(stop_at, tasks.join_next()).await {
            Err(_) => {
                result = Err("timed out waiting for tasks to complete".into());
                break;
            }
            Ok(None) => break,
            Ok(Some(joined)) => match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(e),
                Err(e) => {
                    error!(error = %e, "failed to join task");
                }
            },
        }
    }
    result
}

/// SIGUSR1 is the supervisor's terminal shutdown, SIGUSR2 its graceful
/// replacement during reload; both drain the same way. SIGTERM and SIGINT
/// behave like SIGUSR1 for interactive use.
async fn signal_wait() {
    let mut sig_usr1 = sig(SignalKind::user_defined1());
    let mut sig_usr2 = sig(SignalKind::user_defined2());
    let mut sig_term = sig(SignalKind::terminate());
    let mut sig_int = sig(SignalKind::interrupt());

    select! {
        _ = sig_usr1.recv() => info!("SIGUSR1 received, shutting down"),
        _ = sig_usr2.recv() => info!("SIGUSR2 received, draining for replacement"),
        _ = sig_term.recv() => info!("SIGTERM received, shutting down"),
        _ = sig_int.recv() => info!("SIGINT received, shutting down"),
    }
}

fn sig(kind: SignalKind) -> Signal {
    signal(kind).expect("failed to install signal handler")
}
