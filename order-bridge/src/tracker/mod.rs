//! Delivery tracker
//!
//! Decides whether an order change becomes a ticket and remembers what
//! happened to it. The feed is at-least-once, so every check-and-mark goes
//! through one lock and a key is never handed out twice.

mod storage;

pub use storage::{DeliveryStorage, TrackerError, TrackerResult};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::formatter::PrintJob;
use crate::order::{Order, OrderStatus};

/// Which ticket a job prints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    New,
    Update,
    Void,
}

impl TicketKind {
    pub fn for_status(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Created => TicketKind::New,
            OrderStatus::Updated => TicketKind::Update,
            OrderStatus::Cancelled => TicketKind::Void,
        }
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketKind::New => write!(f, "new"),
            TicketKind::Update => write!(f, "update"),
            TicketKind::Void => write!(f, "void"),
        }
    }
}

/// Identity of one printable change
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryKey {
    pub order_id: String,
    pub kind: TicketKind,
    pub hash: String,
}

impl DeliveryKey {
    pub fn new(order_id: impl Into<String>, kind: TicketKind, hash: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            kind,
            hash: hash.into(),
        }
    }

    pub fn void(order_id: impl Into<String>) -> Self {
        Self::new(order_id, TicketKind::Void, "")
    }
}

impl fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.order_id, self.kind, self.hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Printed,
    Failed,
}

/// Print-dispatch state of one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub order_id: String,
    pub state: DeliveryState,
    pub printed_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_printed_hash: Option<String>,
    /// Hash of the newest content ticket handed out
    pub last_claimed_hash: Option<String>,
    pub claimed: Vec<DeliveryKey>,
    /// Claimed tickets no worker has picked up yet
    #[serde(default)]
    pub queued: Vec<PrintJob>,
    /// Job being dispatched right now
    pub in_flight: Option<PrintJob>,
    /// Tickets waiting for a manual retry, oldest first
    #[serde(default)]
    pub failed_jobs: Vec<PrintJob>,
    pub last_error: Option<String>,
}

impl DeliveryRecord {
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            state: DeliveryState::Pending,
            printed_at: None,
            attempt_count: 0,
            last_printed_hash: None,
            last_claimed_hash: None,
            claimed: Vec::new(),
            queued: Vec::new(),
            in_flight: None,
            failed_jobs: Vec::new(),
            last_error: None,
        }
    }

    fn has_claimed(&self, key: &DeliveryKey) -> bool {
        self.claimed.contains(key)
    }

    /// A content ticket was printed or is on its way to the printer
    fn has_content_ticket(&self) -> bool {
        self.last_printed_hash.is_some()
            || self
                .in_flight
                .iter()
                .chain(&self.queued)
                .any(|job| job.key.kind != TicketKind::Void)
    }

    fn drop_job(&mut self, key: &DeliveryKey) {
        self.queued.retain(|job| &job.key != key);
        self.failed_jobs.retain(|job| &job.key != key);
        if self.in_flight.as_ref().is_some_and(|job| &job.key == key) {
            self.in_flight = None;
        }
    }

    /// Failed beats pending beats printed
    fn settle_state(&mut self) {
        self.state = if !self.failed_jobs.is_empty() {
            DeliveryState::Failed
        } else if self.in_flight.is_some() || !self.queued.is_empty() {
            DeliveryState::Pending
        } else {
            DeliveryState::Printed
        };
    }
}

/// Outcome of [`DeliveryTracker::claim`] and [`DeliveryTracker::claim_job`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim<T = DeliveryKey> {
    /// Print this ticket; the key is now reserved
    Print(T),
    /// Same key was already handed out
    Duplicate,
    /// Update whose items match the last ticket
    Unchanged,
    /// Cancellation that produces no ticket
    Cancelled,
}

impl<T> Claim<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> Claim<U> {
        match self {
            Claim::Print(t) => Claim::Print(f(t)),
            Claim::Duplicate => Claim::Duplicate,
            Claim::Unchanged => Claim::Unchanged,
            Claim::Cancelled => Claim::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub orders: usize,
    pub pending: usize,
    pub printed: usize,
    pub failed: usize,
}

pub struct DeliveryTracker {
    records: Mutex<HashMap<String, DeliveryRecord>>,
    storage: Option<DeliveryStorage>,
    void_tickets: bool,
}

impl DeliveryTracker {
    /// In-memory tracker
    pub fn new(void_tickets: bool) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            storage: None,
            void_tickets,
        }
    }

    /// Tracker persisted to a redb file
    pub fn open(path: impl AsRef<Path>, void_tickets: bool) -> TrackerResult<Self> {
        let storage = DeliveryStorage::open(path)?;
        Self::with_storage(storage, void_tickets)
    }

    /// Load records from storage
    ///
    /// Tickets a previous run had queued or was dispatching may or may not
    /// have come out. They become failed and wait for a manual retry instead
    /// of printing twice.
    pub fn with_storage(storage: DeliveryStorage, void_tickets: bool) -> TrackerResult<Self> {
        let mut records = HashMap::new();
        let mut interrupted = 0;
        for mut record in storage.load_all()? {
            let unfinished: Vec<_> = record.in_flight.take().into_iter().chain(record.queued.drain(..)).collect();
            if !unfinished.is_empty() {
                record.failed_jobs.extend(unfinished);
                record.last_error = Some("interrupted before the printer confirmed".to_string());
            } else if record.state == DeliveryState::Pending && !record.claimed.is_empty() {
                record.last_error = Some("interrupted before dispatch, no ticket stored".to_string());
            } else {
                records.insert(record.order_id.clone(), record);
                continue;
            }
            record.state = DeliveryState::Failed;
            storage.put(&record)?;
            interrupted += 1;
            records.insert(record.order_id.clone(), record);
        }

        tracing::info!(
            records = records.len(),
            interrupted = interrupted,
            "Delivery records loaded"
        );

        Ok(Self {
            records: Mutex::new(records),
            storage: Some(storage),
            void_tickets,
        })
    }

    /// Decide what (if anything) to print for this order, and reserve it
    pub fn claim(&self, order: &Order) -> Claim {
        let mut records = self.records.lock();
        let record = records
            .entry(order.order_id.clone())
            .or_insert_with(|| DeliveryRecord::new(&order.order_id));

        let claim = self.decide(record, order);
        if let Claim::Print(key) = &claim {
            self.reserve(record, key, None);
        }
        claim
    }

    /// Like [`claim`](Self::claim), but the ticket built by `format` is
    /// stored with the reservation so a crash before printing can't lose it
    pub fn claim_job(&self, order: &Order, format: impl FnOnce(&DeliveryKey) -> PrintJob) -> Claim<PrintJob> {
        let mut records = self.records.lock();
        let record = records
            .entry(order.order_id.clone())
            .or_insert_with(|| DeliveryRecord::new(&order.order_id));

        self.decide(record, order).map(|key| {
            let job = format(&key);
            self.reserve(record, &key, Some(&job));
            job
        })
    }

    fn decide(&self, record: &DeliveryRecord, order: &Order) -> Claim {
        match order.status {
            OrderStatus::Cancelled => {
                let key = DeliveryKey::void(&order.order_id);
                if !self.void_tickets || !record.has_content_ticket() {
                    Claim::Cancelled
                } else if record.has_claimed(&key) {
                    Claim::Duplicate
                } else {
                    Claim::Print(key)
                }
            }
            status => {
                let hash = order.content_hash();
                let key = DeliveryKey::new(&order.order_id, TicketKind::for_status(status), &hash);
                if record.has_claimed(&key) {
                    Claim::Duplicate
                } else if status == OrderStatus::Updated
                    && (record.last_printed_hash.as_deref() == Some(hash.as_str())
                        || record.last_claimed_hash.as_deref() == Some(hash.as_str()))
                {
                    Claim::Unchanged
                } else {
                    Claim::Print(key)
                }
            }
        }
    }

    fn reserve(&self, record: &mut DeliveryRecord, key: &DeliveryKey, job: Option<&PrintJob>) {
        if key.kind != TicketKind::Void {
            record.last_claimed_hash = Some(key.hash.clone());
        }
        record.claimed.push(key.clone());
        record.queued.extend(job.cloned());
        record.state = DeliveryState::Pending;
        self.persist(record);
    }

    /// True if the order produces a ticket (reserves it like [`claim`](Self::claim))
    pub fn should_print(&self, order: &Order) -> bool {
        matches!(self.claim(order), Claim::Print(_))
    }

    /// The job is about to be sent to the printer
    pub fn begin(&self, job: &PrintJob) {
        self.update(&job.key.order_id, |record| {
            record.drop_job(&job.key);
            record.in_flight = Some(job.clone());
            record.settle_state();
        });
    }

    pub fn record_attempt(&self, key: &DeliveryKey) {
        self.update(&key.order_id, |record| record.attempt_count += 1);
    }

    pub fn mark_printed(&self, key: &DeliveryKey) {
        self.update(&key.order_id, |record| {
            record.drop_job(key);
            record.printed_at = Some(Utc::now());
            if key.kind != TicketKind::Void {
                record.last_printed_hash = Some(key.hash.clone());
                // A newer content ticket made it out; older failed ones are moot
                record.failed_jobs.retain(|job| job.key.kind == TicketKind::Void);
            }
            if record.failed_jobs.is_empty() {
                record.last_error = None;
            }
            record.settle_state();
        });
    }

    pub fn mark_failed(&self, job: &PrintJob, reason: &str) {
        self.update(&job.key.order_id, |record| {
            record.drop_job(&job.key);
            record.failed_jobs.push(job.clone());
            record.last_error = Some(reason.to_string());
            record.settle_state();
        });
    }

    /// Fail every queued or in-flight job, e.g. when workers are abandoned
    pub fn fail_queued(&self, reason: &str) -> Vec<PrintJob> {
        let mut records = self.records.lock();
        let mut jobs = Vec::new();
        for record in records.values_mut() {
            let unfinished: Vec<_> = record.in_flight.take().into_iter().chain(record.queued.drain(..)).collect();
            if unfinished.is_empty() {
                continue;
            }
            record.failed_jobs.extend(unfinished.iter().cloned());
            record.last_error = Some(reason.to_string());
            record.settle_state();
            self.persist(record);
            jobs.extend(unfinished);
        }
        jobs.sort_by(|a, b| a.key.order_id.cmp(&b.key.order_id));
        jobs
    }

    /// Hand out failed jobs for a manual retry; they count as queued again
    pub fn take_failed(&self) -> Vec<PrintJob> {
        let mut records = self.records.lock();
        let mut jobs = Vec::new();
        for record in records.values_mut() {
            if record.failed_jobs.is_empty() {
                continue;
            }
            let retry: Vec<_> = record.failed_jobs.drain(..).collect();
            record.queued.extend(retry.iter().cloned());
            record.last_error = None;
            record.settle_state();
            self.persist(record);
            jobs.extend(retry);
        }
        jobs.sort_by(|a, b| a.key.order_id.cmp(&b.key.order_id));
        jobs
    }

    pub fn record(&self, order_id: &str) -> Option<DeliveryRecord> {
        self.records.lock().get(order_id).cloned()
    }

    pub fn stats(&self) -> TrackerStats {
        let records = self.records.lock();
        let mut stats = TrackerStats {
            orders: records.len(),
            ..Default::default()
        };
        for record in records.values() {
            match record.state {
                DeliveryState::Pending => stats.pending += 1,
                DeliveryState::Printed => stats.printed += 1,
                DeliveryState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    fn update(&self, order_id: &str, f: impl FnOnce(&mut DeliveryRecord)) {
        let mut records = self.records.lock();
        let record = records
            .entry(order_id.to_string())
            .or_insert_with(|| DeliveryRecord::new(order_id));
        f(record);
        self.persist(record);
    }

    /// Write-through; memory stays authoritative if the disk write fails
    fn persist(&self, record: &DeliveryRecord) {
        if let Some(storage) = &self.storage
            && let Err(e) = storage.put(record)
        {
            tracing::error!(order_id = %record.order_id, error = %e, "Failed to persist delivery record");
        }
    }
}
