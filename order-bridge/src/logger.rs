//! Logging setup
//!
//! - Console output, pretty or JSON
//! - With a log directory: daily files under `app/` (cleaned after
//!   [`APP_LOG_RETENTION_DAYS`]) and `alert/` (target `alert` only, kept)

use std::fs;
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, prelude::*};

pub const APP_LOG_RETENTION_DAYS: i64 = 14;

/// Target used by [`alert!`](crate::alert) for failures that need a human
pub const ALERT_TARGET: &str = "alert";

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Initialize console logging and, with `log_dir`, the file appenders
pub fn init_logger(level: &str, json_format: bool, log_dir: Option<&Path>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let mut layers: Vec<BoxedLayer<_>> = vec![console_layer(json_format)];

    if let Some(dir) = log_dir {
        let app_dir = dir.join("app");
        let alert_dir = dir.join("alert");
        fs::create_dir_all(&app_dir)?;
        fs::create_dir_all(&alert_dir)?;

        let app_log = daily_appender(&app_dir, "app")?;
        layers.push(file_layer(json_format, app_log, |target| target != ALERT_TARGET));

        let alert_log = daily_appender(&alert_dir, "alert")?;
        layers.push(file_layer(json_format, alert_log, |target| target == ALERT_TARGET));

        tokio::spawn(periodic_cleanup(dir.to_path_buf()));
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;
    Ok(())
}

fn daily_appender(dir: &Path, prefix: &str) -> anyhow::Result<RollingFileAppender> {
    Ok(RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(dir)?)
}

fn console_layer<S>(json_format: bool) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if json_format {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    }
}

fn file_layer<S>(
    json_format: bool,
    appender: RollingFileAppender,
    keep: fn(&str) -> bool,
) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let filter = tracing_subscriber::filter::filter_fn(move |meta| keep(meta.target()));
    let writer = std::sync::Mutex::new(appender);
    if json_format {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_thread_ids(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(filter)
            .boxed()
    }
}

/// Delete `app.YYYY-MM-DD.log` files older than the retention window
///
/// Returns the number of files removed.
pub fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> anyhow::Result<usize> {
    let cutoff = chrono::Utc::now().date_naive() - chrono::Duration::days(retention_days);
    let app_dir = log_dir.join("app");
    if !app_dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(app_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(date) = name
            .strip_prefix("app.")
            .and_then(|d| d.strip_suffix(".log"))
            .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            && date < cutoff
        {
            fs::remove_file(&path)?;
            tracing::info!(file = %name, "Deleted old log file");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Runs hourly for the life of the process
async fn periodic_cleanup(log_dir: PathBuf) {
    use tokio::time::{Duration, sleep};

    loop {
        sleep(Duration::from_secs(3600)).await;

        if let Err(e) = cleanup_old_logs(&log_dir, APP_LOG_RETENTION_DAYS) {
            tracing::error!(error = %e, "Failed to cleanup old logs");
        }
    }
}

/// Alert helper: an error on the `alert` target
///
/// Alerts land in the console and, with a log directory, in `alert/`.
///
/// ```ignore
/// alert!(order_id = %id, error = %e, "Ticket NOT printed");
/// ```
#[macro_export]
macro_rules! alert {
    ($($arg:tt)*) => {
        tracing::error!(target: "alert", $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_removes_only_old_app_logs() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        fs::create_dir_all(&app).unwrap();

        let today = chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string();
        fs::write(app.join("app.2000-01-01.log"), "old").unwrap();
        fs::write(app.join(format!("app.{}.log", today)), "new").unwrap();
        fs::write(app.join("notes.txt"), "keep").unwrap();

        let removed = cleanup_old_logs(dir.path(), APP_LOG_RETENTION_DAYS).unwrap();
        assert_eq!(removed, 1);
        assert!(!app.join("app.2000-01-01.log").exists());
        assert!(app.join(format!("app.{}.log", today)).exists());
        assert!(app.join("notes.txt").exists());
    }

    #[test]
    fn test_cleanup_without_app_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(cleanup_old_logs(dir.path(), 14).unwrap(), 0);
    }
}
