//! Background task registry
//!
//! Auxiliary tasks (stats reporter, signal listeners) are registered here
//! so they share one cancellation token and are stopped together.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Waits for external input (signals)
    Listener,
    /// Runs on a timer
    Periodic,
}

pub struct BackgroundTasks {
    running: Vec<(&'static str, JoinHandle<()>)>,
    shutdown: CancellationToken,
}

impl BackgroundTasks {
    /// Tasks stop when `shutdown` is cancelled
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            running: Vec::new(),
            shutdown,
        }
    }

    /// Spawn a task; panics are caught and logged
    pub fn spawn<F>(&mut self, name: &'static str, kind: TaskKind, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(()) if shutdown.is_cancelled() => {
                    tracing::debug!(task = name, ?kind, "Background task stopped");
                }
                Ok(()) => {
                    tracing::warn!(task = name, ?kind, "Background task ended before shutdown");
                }
                Err(panic) => {
                    tracing::error!(task = name, ?kind, panic = %panic_message(&*panic), "Background task panicked");
                }
            }
        });
        tracing::debug!(task = name, ?kind, "Background task started");
        self.running.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    /// Names of tasks that are no longer running
    pub fn finished(&self) -> Vec<&'static str> {
        self.running
            .iter()
            .filter(|(_, h)| h.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    /// Cancel every task and wait for them
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for (name, handle) in self.running {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                tracing::error!(task = name, error = %e, "Background task failed to join");
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_shutdown_stops_tasks() {
        let token = CancellationToken::new();
        let mut tasks = BackgroundTasks::new(token.clone());
        let stopped = Arc::new(AtomicBool::new(false));

        let flag = stopped.clone();
        let t = token.clone();
        tasks.spawn("waiter", TaskKind::Listener, async move {
            t.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(tasks.len(), 1);
        assert!(tasks.finished().is_empty());

        tasks.shutdown().await;
        assert!(stopped.load(Ordering::SeqCst));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let mut tasks = BackgroundTasks::new(CancellationToken::new());
        tasks.spawn("boom", TaskKind::Periodic, async {
            panic!("boom");
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(tasks.finished(), vec!["boom"]);
        tasks.shutdown().await;
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "unknown panic");
    }
}
