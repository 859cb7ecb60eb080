//! Process context
//!
//! [`Bridge`] owns everything that runs: the change feed task, the
//! pipeline, and the auxiliary background tasks. Shutdown order:
//!
//! 1. cancel the token (feed leaves the channel, pending retries give up)
//! 2. the feed task ends and drops the queue sender
//! 3. the pipeline drains the queue, then its workers
//! 4. background tasks stop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use ticket_printer::{AnyPrinter, PrintError, Printer};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError};
use crate::dispatcher::{PrintDispatcher, PrintSink, PrinterSink, RetryPolicy};
use crate::feed::{ChangeFeedClient, FeedConfig, FeedError, FeedResult};
use crate::formatter::TicketFormatter;
use crate::pipeline::{Control, Pipeline, PipelineStats, StatsSnapshot};
use crate::tasks::{BackgroundTasks, TaskKind};
use crate::tracker::{DeliveryTracker, TrackerError};

const STATS_INTERVAL: Duration = Duration::from_secs(60);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_PRINT_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("printer setup failed: {0}")]
    Printer(#[from] PrintError),

    #[error("delivery store failed: {0}")]
    Tracker(#[from] TrackerError),

    #[error("change feed failed: {0}")]
    Feed(#[from] FeedError),

    #[error("task failed: {0}")]
    Task(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

pub struct Bridge {
    shutdown: CancellationToken,
    feed: Option<JoinHandle<FeedResult<()>>>,
    pipeline: JoinHandle<()>,
    control: mpsc::Sender<Control>,
    tasks: BackgroundTasks,
    stats: Arc<PipelineStats>,
    tracker: Arc<DeliveryTracker>,
}

impl Bridge {
    /// Start with the printer named by `printer_target`
    pub async fn start(config: Config) -> BridgeResult<Self> {
        let printer = AnyPrinter::from_target(&config.printer_target)?.with_status_check(config.printer_status_check);
        if !printer.is_online().await {
            tracing::warn!(printer = %printer.describe(), "Printer not reachable yet, tickets will be retried");
        }

        let mut sink = PrinterSink::new(printer, config.printer_encoding);
        if let Some(path) = &config.logo_path {
            let max_dots = (config.paper_width * 12) as u32;
            match ticket_printer::process_logo(&path.to_string_lossy(), max_dots) {
                Ok(raster) => sink = sink.with_logo(raster),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Logo ignored"),
            }
        }

        Self::start_with_sink(config, Arc::new(sink))
    }

    /// Start with any sink
    pub fn start_with_sink(config: Config, sink: Arc<dyn PrintSink>) -> BridgeResult<Self> {
        let shutdown = CancellationToken::new();

        let tracker = Arc::new(match &config.delivery_db_path {
            Some(path) => DeliveryTracker::open(path, config.print_void_tickets)?,
            None => DeliveryTracker::new(config.print_void_tickets),
        });

        tracing::info!(
            table = %config.table_name,
            printer = %sink.describe(),
            workers = config.print_workers,
            persistent = config.delivery_db_path.is_some(),
            void_tickets = config.print_void_tickets,
            "Starting order bridge"
        );

        let formatter = TicketFormatter::new(
            config.paper_width,
            config.printer_encoding,
            config.ticket_title.clone(),
            config.ticket_timezone,
        );
        let policy = RetryPolicy {
            max_attempts: config.print_max_attempts,
            initial_delay: config.print_retry_delay,
            max_delay: MAX_PRINT_RETRY_DELAY,
        };
        let dispatcher = PrintDispatcher::new(sink, policy, shutdown.clone());
        let pipeline = Pipeline::new(
            tracker.clone(),
            formatter,
            dispatcher,
            config.print_workers,
            config.shutdown_timeout,
        );
        let stats = pipeline.stats();

        let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity);
        let (control_tx, control_rx) = mpsc::channel(8);
        let pipeline = pipeline.spawn(event_rx, control_rx);

        let feed_config = FeedConfig {
            endpoint: config.store_endpoint.clone(),
            api_key: config.store_api_key.clone(),
            schema: config.table_schema.clone(),
            retry_backoff_cap: config.retry_backoff_cap,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        };
        let client = ChangeFeedClient::new(feed_config, shutdown.clone());
        let table = config.table_name.clone();
        let feed = tokio::spawn(async move { client.subscribe(&table, event_tx).await });

        let mut tasks = BackgroundTasks::new(shutdown.clone());
        tasks.spawn(
            "stats_reporter",
            TaskKind::Periodic,
            report_stats(stats.clone(), tracker.clone(), shutdown.clone()),
        );
        #[cfg(unix)]
        tasks.spawn(
            "retry_signal",
            TaskKind::Listener,
            retry_on_signal(control_tx.clone(), shutdown.clone()),
        );
        tracing::debug!(count = tasks.len(), "Background tasks running");

        Ok(Self {
            shutdown,
            feed: Some(feed),
            pipeline,
            control: control_tx,
            tasks,
            stats,
            tracker,
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn tracker(&self) -> Arc<DeliveryTracker> {
        self.tracker.clone()
    }

    /// Ask the pipeline to re-dispatch failed tickets
    pub async fn retry_failed(&self) {
        if self.control.send(Control::RetryFailed).await.is_err() {
            tracing::warn!("Pipeline stopped, retry request dropped");
        }
    }

    /// Run until SIGINT/SIGTERM or a fatal feed error
    pub async fn run_until_shutdown(self) -> BridgeResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `stop` resolves or the feed fails for good
    pub async fn run_until(mut self, stop: impl Future<Output = ()>) -> BridgeResult<()> {
        let Some(mut feed) = self.feed.take() else {
            return self.shutdown().await;
        };

        let finished = tokio::select! {
            _ = stop => None,
            result = &mut feed => Some(result),
        };

        match finished {
            None => {
                tracing::info!("Shutdown requested");
                self.feed = Some(feed);
                self.shutdown().await
            }
            Some(result) => {
                let outcome = flatten(result);
                self.shutdown().await?;
                outcome
            }
        }
    }

    /// Stop everything, draining queued tickets
    pub async fn shutdown(mut self) -> BridgeResult<()> {
        let stopped_early = self.tasks.finished();
        if !stopped_early.is_empty() {
            tracing::warn!(tasks = ?stopped_early, "Background tasks had already stopped");
        }
        self.shutdown.cancel();

        let feed_result = match self.feed.take() {
            Some(handle) => flatten(handle.await),
            None => Ok(()),
        };

        self.tasks.shutdown().await;
        drop(self.control);

        let pipeline_result = joined("pipeline", self.pipeline.await);
        if let Err(e) = &pipeline_result {
            tracing::error!(error = %e, "Pipeline task failed");
        }

        log_stats(&self.stats.snapshot(), &self.tracker);
        tracing::info!("Order bridge stopped");
        feed_result.and(pipeline_result)
    }
}

fn flatten(result: Result<FeedResult<()>, JoinError>) -> BridgeResult<()> {
    match result {
        Ok(result) => result.map_err(BridgeError::from),
        Err(e) => joined("change feed", Err(e)),
    }
}

fn joined(task: &str, result: Result<(), JoinError>) -> BridgeResult<()> {
    result.map_err(|e| BridgeError::Task(format!("{}: {}", task, e)))
}

fn log_stats(s: &StatsSnapshot, tracker: &DeliveryTracker) {
    let t = tracker.stats();
    tracing::info!(
        received = s.received,
        printed = s.printed,
        duplicates = s.duplicates,
        unchanged = s.unchanged,
        malformed = s.malformed,
        skipped = s.skipped,
        failed = s.failed,
        retried = s.retried,
        orders = t.orders,
        awaiting_retry = t.failed,
        "Pipeline stats"
    );
}

async fn report_stats(stats: Arc<PipelineStats>, tracker: Arc<DeliveryTracker>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await; // skip immediate tick

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => log_stats(&stats.snapshot(), &tracker),
        }
    }
}

/// SIGUSR1 re-dispatches failed tickets
#[cfg(unix)]
async fn retry_on_signal(control: mpsc::Sender<Control>, shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut usr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGUSR1, manual retry disabled");
            shutdown.cancelled().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = usr1.recv() => {
                tracing::info!("SIGUSR1 received, retrying failed tickets");
                if control.send(Control::RetryFailed).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
