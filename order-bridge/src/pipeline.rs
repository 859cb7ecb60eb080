//! Event pipeline
//!
//! ```text
//! feed ─mpsc─► sequencer ──┬─► worker 0 ─► dispatcher
//!   (normalize, claim,     ├─► worker 1 ─► dispatcher
//!    format in order)      └─► worker N ─► dispatcher
//! ```
//!
//! The sequencer is the only consumer of the feed queue, so normalizing and
//! claiming happen in delivery order. Jobs are sharded by order id: all
//! tickets of one order go through the same worker in order, different
//! orders print concurrently.

use futures::FutureExt;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatcher::PrintDispatcher;
use crate::feed::ChangeEvent;
use crate::formatter::{PrintJob, TicketFormatter};
use crate::normalizer::normalize;
use crate::tasks::panic_message;
use crate::tracker::{Claim, DeliveryTracker};

/// Per-worker queue bound
const WORKER_QUEUE_CAPACITY: usize = 32;

/// Operator commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Re-dispatch every failed job
    RetryFailed,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    printed: AtomicU64,
    duplicates: AtomicU64,
    unchanged: AtomicU64,
    malformed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub printed: u64,
    pub duplicates: u64,
    pub unchanged: u64,
    pub malformed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub retried: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            printed: self.printed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Pipeline {
    tracker: Arc<DeliveryTracker>,
    formatter: TicketFormatter,
    dispatcher: PrintDispatcher,
    workers: usize,
    shutdown_timeout: Duration,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(
        tracker: Arc<DeliveryTracker>,
        formatter: TicketFormatter,
        dispatcher: PrintDispatcher,
        workers: usize,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            tracker,
            formatter,
            dispatcher,
            workers: workers.max(1),
            shutdown_timeout,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn tracker(&self) -> Arc<DeliveryTracker> {
        self.tracker.clone()
    }

    /// Run until the event queue closes and the workers have drained
    pub fn spawn(
        self,
        events: mpsc::Receiver<ChangeEvent>,
        control: mpsc::Receiver<Control>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(events, control))
    }

    async fn run(self, mut events: mpsc::Receiver<ChangeEvent>, mut control: mpsc::Receiver<Control>) {
        let (senders, handles): (Vec<_>, Vec<_>) = (0..self.workers)
            .map(|index| {
                let (tx, rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
                let worker = Worker {
                    index,
                    tracker: self.tracker.clone(),
                    dispatcher: self.dispatcher.clone(),
                    stats: self.stats.clone(),
                };
                (tx, tokio::spawn(worker.run(rx)))
            })
            .unzip();

        tracing::info!(workers = self.workers, sink = %self.dispatcher.sink().describe(), "Pipeline started");

        let mut control_open = true;
        loop {
            tokio::select! {
                biased;
                cmd = control.recv(), if control_open => match cmd {
                    Some(Control::RetryFailed) => self.retry_failed(&senders).await,
                    None => control_open = false,
                },
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::info!("Event queue closed, draining workers");
                        break;
                    };
                    // One poisoned row must not take the sequencer down
                    let handled = AssertUnwindSafe(self.handle_event(event, &senders)).catch_unwind().await;
                    if let Err(panic) = handled {
                        PipelineStats::bump(&self.stats.malformed);
                        tracing::error!(panic = %panic_message(&*panic), "Change event handler panicked, event dropped");
                    }
                }
            }
        }

        // Closing the queues lets each worker finish what it holds
        drop(senders);
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);
        match tokio::time::timeout(self.shutdown_timeout, drain).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Print worker panicked");
                    }
                }
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "Workers still busy at shutdown, abandoning remaining jobs"
                );
                aborts.iter().for_each(|a| a.abort());
                for job in self.tracker.fail_queued("shutdown before the ticket was printed") {
                    PipelineStats::bump(&self.stats.failed);
                    crate::alert!(
                        order_id = %job.key.order_id,
                        kind = %job.key.kind,
                        "Ticket NOT printed before shutdown, waiting for manual retry"
                    );
                }
            }
        }

        let s = self.stats.snapshot();
        tracing::info!(
            received = s.received,
            printed = s.printed,
            duplicates = s.duplicates,
            malformed = s.malformed,
            skipped = s.skipped,
            failed = s.failed,
            "Pipeline stopped"
        );
    }

    async fn handle_event(&self, event: ChangeEvent, senders: &[mpsc::Sender<PrintJob>]) {
        PipelineStats::bump(&self.stats.received);

        let order = match normalize(&event) {
            Ok(order) => order,
            Err(e) => {
                PipelineStats::bump(&self.stats.malformed);
                tracing::warn!(
                    error = %e,
                    operation = ?event.operation,
                    payload = %event.row,
                    "Dropping malformed change event"
                );
                return;
            }
        };

        match self.tracker.claim_job(&order, |key| self.formatter.format(&order, key.kind)) {
            Claim::Print(job) => {
                let key = &job.key;
                tracing::debug!(order_id = %key.order_id, kind = %key.kind, hash = %key.hash, "Ticket queued");
                self.route(job, senders).await;
            }
            Claim::Duplicate => {
                PipelineStats::bump(&self.stats.duplicates);
                tracing::debug!(order_id = %order.order_id, status = %order.status, "Duplicate event ignored");
            }
            Claim::Unchanged => {
                PipelineStats::bump(&self.stats.unchanged);
                tracing::debug!(order_id = %order.order_id, "Update without item changes ignored");
            }
            Claim::Cancelled => {
                PipelineStats::bump(&self.stats.skipped);
                tracing::info!(order_id = %order.order_id, "Order cancelled, nothing to print");
            }
        }
    }

    async fn retry_failed(&self, senders: &[mpsc::Sender<PrintJob>]) {
        let jobs = self.tracker.take_failed();
        tracing::info!(count = jobs.len(), "Manual retry of failed tickets");
        for job in jobs {
            PipelineStats::bump(&self.stats.retried);
            self.route(job, senders).await;
        }
    }

    async fn route(&self, job: PrintJob, senders: &[mpsc::Sender<PrintJob>]) {
        let shard = shard_for(job.order_id(), senders.len());
        if let Err(mpsc::error::SendError(job)) = senders[shard].send(job).await {
            PipelineStats::bump(&self.stats.failed);
            tracing::error!(order_id = %job.order_id(), shard, "Print worker gone, ticket not queued");
            self.tracker.mark_failed(&job, "print worker unavailable");
        }
    }
}

fn shard_for(order_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    order_id.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

struct Worker {
    index: usize,
    tracker: Arc<DeliveryTracker>,
    dispatcher: PrintDispatcher,
    stats: Arc<PipelineStats>,
}

impl Worker {
    async fn run(self, mut jobs: mpsc::Receiver<PrintJob>) {
        tracing::debug!(worker = self.index, "Print worker started");
        while let Some(job) = jobs.recv().await {
            self.print(job).await;
        }
        tracing::debug!(worker = self.index, "Print worker stopped");
    }

    async fn print(&self, job: PrintJob) {
        let key = &job.key;
        self.tracker.begin(&job);

        let tracker = &self.tracker;
        let result = self
            .dispatcher
            .dispatch(&job, |_| tracker.record_attempt(key))
            .await;

        match result {
            Ok(attempts) => {
                self.tracker.mark_printed(key);
                PipelineStats::bump(&self.stats.printed);
                tracing::info!(
                    order_id = %key.order_id,
                    kind = %key.kind,
                    hash = %key.hash,
                    attempts,
                    "Ticket printed"
                );
            }
            Err(e) => {
                self.tracker.mark_failed(&job, &e.to_string());
                PipelineStats::bump(&self.stats.failed);
                crate::alert!(
                    order_id = %key.order_id,
                    kind = %key.kind,
                    attempts = e.attempts(),
                    error = %e,
                    "Ticket NOT printed, waiting for manual retry"
                );
                tracing::error!(order_id = %key.order_id, ticket = %job.plain_text(), "Unprinted ticket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::RetryPolicy;
    use crate::dispatcher::testing::RecordingSink;
    use crate::feed::Operation;
    use crate::formatter::Emphasis;
    use crate::tracker::DeliveryState;
    use chrono::Utc;
    use serde_json::{Value, json};
    use ticket_printer::PrintError;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        events: mpsc::Sender<ChangeEvent>,
        control: mpsc::Sender<Control>,
        handle: JoinHandle<()>,
        sink: Arc<RecordingSink>,
        tracker: Arc<DeliveryTracker>,
        stats: Arc<PipelineStats>,
    }

    impl Harness {
        fn start(sink: RecordingSink, void_tickets: bool) -> Self {
            Self::start_with_timeout(sink, void_tickets, Duration::from_secs(5))
        }

        fn start_with_timeout(sink: RecordingSink, void_tickets: bool, shutdown_timeout: Duration) -> Self {
            let sink = Arc::new(sink);
            let tracker = Arc::new(DeliveryTracker::new(void_tickets));
            let policy = RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
            };
            let dispatcher = PrintDispatcher::new(sink.clone(), policy, CancellationToken::new());
            let pipeline = Pipeline::new(
                tracker.clone(),
                TicketFormatter::default(),
                dispatcher,
                2,
                shutdown_timeout,
            );
            let stats = pipeline.stats();
            let (events, events_rx) = mpsc::channel(16);
            let (control, control_rx) = mpsc::channel(4);
            let handle = pipeline.spawn(events_rx, control_rx);
            Self {
                events,
                control,
                handle,
                sink,
                tracker,
                stats,
            }
        }

        async fn send(&self, operation: Operation, row: Value) {
            let event = ChangeEvent {
                table: "orders".into(),
                operation,
                row,
                old_row: None,
                commit_timestamp: None,
                received_at: Utc::now(),
            };
            self.events.send(event).await.unwrap();
        }

        async fn finish(self) -> (Arc<RecordingSink>, Arc<DeliveryTracker>, StatsSnapshot) {
            drop(self.events);
            self.handle.await.unwrap();
            (self.sink, self.tracker, self.stats.snapshot())
        }
    }

    fn burger(qty: u32) -> Value {
        json!({"id": "A1", "items": [{"name": "Burger", "quantity": qty}]})
    }

    #[tokio::test]
    async fn test_insert_prints_once_despite_redelivery() {
        let h = Harness::start(RecordingSink::default(), false);
        h.send(Operation::Insert, burger(1)).await;
        h.send(Operation::Insert, burger(1)).await;
        let (sink, _, stats) = h.finish().await;

        let printed = sink.printed();
        assert_eq!(printed.len(), 1);
        let text = printed[0].plain_text();
        assert!(text.contains("A1"));
        assert!(text.contains("Burger x1"));
        assert_eq!(stats.received, 2);
        assert_eq!(stats.printed, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[tokio::test]
    async fn test_update_reprints_once_with_new_hash() {
        let h = Harness::start(RecordingSink::default(), false);
        h.send(Operation::Insert, burger(1)).await;
        h.send(Operation::Update, burger(2)).await;
        h.send(Operation::Update, burger(2)).await;
        let (sink, _, _) = h.finish().await;

        let printed = sink.printed();
        assert_eq!(printed.len(), 2);
        assert_ne!(printed[0].key.hash, printed[1].key.hash);
        assert!(printed[1].plain_text().contains("UPDATED ORDER"));
        assert!(printed[1].plain_text().contains("Burger x2"));
    }

    #[tokio::test]
    async fn test_malformed_event_does_not_stop_pipeline() {
        let h = Harness::start(RecordingSink::default(), false);
        h.send(Operation::Insert, json!({"items": [{"name": "Ghost"}]})).await;
        h.send(Operation::Insert, burger(1)).await;
        let (sink, _, stats) = h.finish().await;

        assert_eq!(stats.malformed, 1);
        assert_eq!(sink.printed().len(), 1);
    }

    #[tokio::test]
    async fn test_price_too_large_is_dropped_and_later_orders_print() {
        let h = Harness::start(RecordingSink::default(), false);
        h.send(
            Operation::Insert,
            json!({"id": "X1", "items": [
                {"name": "Caviar", "price": "79228162514264337593543950335", "quantity": 2}
            ]}),
        )
        .await;
        h.send(Operation::Insert, burger(1)).await;
        let (sink, tracker, stats) = h.finish().await;

        let printed = sink.printed();
        assert_eq!(printed.len(), 1);
        assert_eq!(printed[0].order_id(), "A1");
        assert_eq!(stats.malformed, 1);
        assert!(tracker.record("X1").is_none());
    }

    #[tokio::test]
    async fn test_drain_timeout_keeps_unprinted_tickets_for_retry() {
        let h = Harness::start_with_timeout(
            RecordingSink::slow(Duration::from_secs(30)),
            false,
            Duration::from_millis(50),
        );
        h.send(Operation::Insert, burger(1)).await;
        h.send(
            Operation::Insert,
            json!({"id": "B2", "items": [{"name": "Soup", "quantity": 1}]}),
        )
        .await;
        let (sink, tracker, stats) = h.finish().await;

        assert!(sink.printed().is_empty());
        assert_eq!(stats.failed, 2);
        for id in ["A1", "B2"] {
            let record = tracker.record(id).unwrap();
            assert_eq!(record.state, DeliveryState::Failed, "{id}");
            assert!(record.queued.is_empty() && record.in_flight.is_none(), "{id}");
        }
        let retry: Vec<_> = tracker.take_failed().into_iter().map(|j| j.key.order_id).collect();
        assert_eq!(retry, vec!["A1", "B2"]);
    }

    #[tokio::test]
    async fn test_cancelled_never_printed_without_void_policy() {
        let h = Harness::start(RecordingSink::default(), false);
        h.send(Operation::Insert, burger(1)).await;
        h.send(
            Operation::Update,
            json!({"id": "A1", "status": "cancelled", "items": [{"name": "Burger"}]}),
        )
        .await;
        let (sink, _, stats) = h.finish().await;

        assert_eq!(sink.printed().len(), 1);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_void_ticket_with_policy() {
        let h = Harness::start(RecordingSink::default(), true);
        h.send(Operation::Insert, burger(1)).await;
        h.send(Operation::Delete, json!({"id": "A1"})).await;
        h.send(Operation::Delete, json!({"id": "A1"})).await;
        let (sink, _, _) = h.finish().await;

        let printed = sink.printed();
        assert_eq!(printed.len(), 2);
        assert!(printed[1].plain_text().contains("*** VOID ***"));
    }

    #[tokio::test]
    async fn test_failed_ticket_recorded_then_retried() {
        let sink = RecordingSink::failing_with(vec![
            PrintError::Offline("a".into()),
            PrintError::Offline("b".into()),
        ]);
        let h = Harness::start(sink, false);
        h.send(Operation::Insert, burger(1)).await;

        // Wait for the failure to land before asking for a retry
        for _ in 0..200 {
            if h.stats.snapshot().failed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.tracker.record("A1").unwrap().state, DeliveryState::Failed);

        h.control.send(Control::RetryFailed).await.unwrap();
        for _ in 0..200 {
            if h.stats.snapshot().printed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let (sink, tracker, stats) = h.finish().await;

        assert_eq!(sink.printed().len(), 1);
        assert_eq!(stats.retried, 1);
        let record = tracker.record("A1").unwrap();
        assert_eq!(record.state, DeliveryState::Printed);
        assert_eq!(record.attempt_count, 3);
    }

    #[tokio::test]
    async fn test_jobs_for_one_order_keep_their_order() {
        let h = Harness::start(RecordingSink::default(), false);
        h.send(Operation::Insert, burger(1)).await;
        for qty in 2..6 {
            h.send(Operation::Update, burger(qty)).await;
        }
        let (sink, _, _) = h.finish().await;

        let item_lines: Vec<_> = sink
            .printed()
            .iter()
            .filter_map(|job| job.lines.iter().find(|l| l.emphasis == Emphasis::Tall))
            .map(|l| l.text.trim_end().to_string())
            .collect();
        assert_eq!(
            item_lines,
            vec!["Burger x1", "Burger x2", "Burger x3", "Burger x4", "Burger x5"]
        );
    }

    #[test]
    fn test_shard_is_stable() {
        assert_eq!(shard_for("A1", 4), shard_for("A1", 4));
        assert!(shard_for("B2", 3) < 3);
        assert_eq!(shard_for("anything", 1), 0);
    }
}
