//! Print dispatcher
//!
//! Sends one [`PrintJob`] to the print sink, retrying transient failures
//! with exponential backoff. It does not deduplicate; the tracker decides
//! what reaches it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use ticket_printer::{AnyPrinter, PrintError, PrintResult, Printer, TextEncoding};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::formatter::PrintJob;

/// Where print jobs end up
#[async_trait]
pub trait PrintSink: Send + Sync {
    async fn submit(&self, job: &PrintJob) -> PrintResult<()>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Sink backed by a physical or mock printer
pub struct PrinterSink {
    printer: AnyPrinter,
    encoding: TextEncoding,
    logo: Option<Vec<u8>>,
}

impl PrinterSink {
    pub fn new(printer: AnyPrinter, encoding: TextEncoding) -> Self {
        Self {
            printer,
            encoding,
            logo: None,
        }
    }

    /// Raster logo printed above every ticket
    pub fn with_logo(mut self, raster: Vec<u8>) -> Self {
        self.logo = Some(raster);
        self
    }
}

#[async_trait]
impl PrintSink for PrinterSink {
    async fn submit(&self, job: &PrintJob) -> PrintResult<()> {
        let data = if self.printer.accepts_escpos() {
            job.to_escpos(self.encoding, self.logo.as_deref())
        } else {
            job.plain_text().into_bytes()
        };
        self.printer.print(&data).await
    }

    fn describe(&self) -> String {
        self.printer.describe()
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: PrintError },

    #[error("permanent printer failure: {source}")]
    Permanent { attempts: u32, source: PrintError },

    #[error("abandoned by shutdown after {attempts} attempts")]
    Abandoned { attempts: u32 },
}

impl DispatchError {
    pub fn attempts(&self) -> u32 {
        match self {
            DispatchError::Exhausted { attempts, .. }
            | DispatchError::Permanent { attempts, .. }
            | DispatchError::Abandoned { attempts } => *attempts,
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`
    fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct PrintDispatcher {
    sink: Arc<dyn PrintSink>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl PrintDispatcher {
    pub fn new(sink: Arc<dyn PrintSink>, policy: RetryPolicy, shutdown: CancellationToken) -> Self {
        Self {
            sink,
            policy,
            shutdown,
        }
    }

    pub fn sink(&self) -> &Arc<dyn PrintSink> {
        &self.sink
    }

    /// Send a job, retrying transient failures
    ///
    /// Returns the number of attempts it took. `on_attempt` runs before
    /// every attempt so the caller can count them.
    #[instrument(skip(self, job, on_attempt), fields(order_id = %job.key.order_id, kind = %job.key.kind))]
    pub async fn dispatch(&self, job: &PrintJob, mut on_attempt: impl FnMut(u32) + Send) -> DispatchResult<u32> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            on_attempt(attempt);

            let err = match self.sink.submit(job).await {
                Ok(()) => return Ok(attempt),
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(DispatchError::Permanent {
                    attempts: attempt,
                    source: err,
                });
            }
            if attempt >= max_attempts {
                return Err(DispatchError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.policy.delay_after(attempt);
            warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "Print failed, retrying");

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(DispatchError::Abandoned { attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Sink that records jobs and replays scripted failures
    #[derive(Default)]
    pub struct RecordingSink {
        pub jobs: Mutex<Vec<PrintJob>>,
        pub failures: Mutex<VecDeque<PrintError>>,
        pub calls: std::sync::atomic::AtomicU32,
        pub delay: Option<std::time::Duration>,
    }

    impl RecordingSink {
        /// Every submit takes `delay` before it completes
        pub fn slow(delay: std::time::Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        pub fn failing_with(errors: Vec<PrintError>) -> Self {
            Self {
                failures: Mutex::new(errors.into()),
                ..Default::default()
            }
        }

        pub fn printed(&self) -> Vec<PrintJob> {
            self.jobs.lock().clone()
        }
    }

    #[async_trait]
    impl PrintSink for RecordingSink {
        async fn submit(&self, job: &PrintJob) -> PrintResult<()> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.failures.lock().pop_front() {
                return Err(err);
            }
            self.jobs.lock().push(job.clone());
            Ok(())
        }

        fn describe(&self) -> String {
            "recording".to_string()
        }
    }
}
