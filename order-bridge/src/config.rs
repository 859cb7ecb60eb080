use chrono_tz::Tz;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use ticket_printer::TextEncoding;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Bridge configuration
///
/// # Environment variables
///
/// | Variable | Default | Meaning |
/// |----------|---------|---------|
/// | STORE_ENDPOINT (SUPABASE_URL, VITE_SUPABASE_URL) | required | change feed endpoint |
/// | STORE_API_KEY (SUPABASE_KEY, VITE_SUPABASE_ANON_KEY) | required | API key |
/// | TABLE_NAME | orders | table to subscribe to |
/// | TABLE_SCHEMA | public | schema of the table |
/// | PRINTER_TARGET | console | `tcp://host:port`, `host:port`, `windows:NAME`, `console`, `file:PATH` |
/// | PRINTER_STATUS_CHECK | true | query network printers (DLE EOT) before each ticket |
/// | RETRY_BACKOFF_CAP | 60 | max seconds between reconnects |
/// | PAPER_WIDTH | 48 | characters per line (32 for 58mm) |
/// | PRINTER_ENCODING | latin | `latin` or `gbk` |
/// | TICKET_TITLE | KITCHEN TICKET | header title |
/// | TICKET_TIMEZONE | UTC | IANA zone for ticket times |
/// | LOGO_PATH | - | image printed above each ticket |
/// | PRINT_MAX_ATTEMPTS | 3 | attempts per ticket |
/// | PRINT_RETRY_DELAY_MS | 1000 | first retry delay |
/// | PRINT_WORKERS | 2 | concurrent print workers |
/// | PRINT_VOID_TICKETS | false | print a void ticket on cancellation |
/// | DELIVERY_DB_PATH | - | persist delivery records |
/// | EVENT_QUEUE_CAPACITY | 256 | feed queue bound |
/// | SHUTDOWN_TIMEOUT_MS | 10000 | drain window at shutdown |
/// | LOG_LEVEL | info | tracing filter |
/// | LOG_JSON | false | JSON console logs |
/// | LOG_DIR | - | daily log files |
///
/// # Example
///
/// ```ignore
/// STORE_ENDPOINT=https://xyz.supabase.co STORE_API_KEY=... PRINTER_TARGET=192.168.1.50:9100 order-bridge
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub store_endpoint: String,
    pub store_api_key: String,
    pub table_name: String,
    pub table_schema: String,
    pub printer_target: String,
    pub printer_status_check: bool,
    pub retry_backoff_cap: Duration,
    pub paper_width: usize,
    pub printer_encoding: TextEncoding,
    pub ticket_title: String,
    pub ticket_timezone: Tz,
    pub logo_path: Option<PathBuf>,
    pub print_max_attempts: u32,
    pub print_retry_delay: Duration,
    pub print_workers: usize,
    pub print_void_tickets: bool,
    pub delivery_db_path: Option<PathBuf>,
    pub event_queue_capacity: usize,
    pub shutdown_timeout: Duration,
    pub log_level: String,
    pub log_json: bool,
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Load from the process environment
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key → value source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let env = Env { lookup: &lookup };

        let config = Self {
            store_endpoint: env
                .first(&["STORE_ENDPOINT", "SUPABASE_URL", "VITE_SUPABASE_URL"])
                .ok_or(ConfigError::Missing("STORE_ENDPOINT"))?,
            store_api_key: env
                .first(&["STORE_API_KEY", "SUPABASE_KEY", "VITE_SUPABASE_ANON_KEY"])
                .ok_or(ConfigError::Missing("STORE_API_KEY"))?,
            table_name: env.string("TABLE_NAME", "orders"),
            table_schema: env.string("TABLE_SCHEMA", "public"),
            printer_target: env.string("PRINTER_TARGET", "console"),
            printer_status_check: env.flag("PRINTER_STATUS_CHECK", true)?,
            retry_backoff_cap: Duration::from_secs(env.parse("RETRY_BACKOFF_CAP", 60)?),
            paper_width: env.parse("PAPER_WIDTH", 48)?,
            printer_encoding: env.parse("PRINTER_ENCODING", TextEncoding::Latin)?,
            ticket_title: env.string("TICKET_TITLE", "KITCHEN TICKET"),
            ticket_timezone: env.parse("TICKET_TIMEZONE", Tz::UTC)?,
            logo_path: env.get("LOGO_PATH").map(PathBuf::from),
            print_max_attempts: env.parse("PRINT_MAX_ATTEMPTS", 3)?,
            print_retry_delay: Duration::from_millis(env.parse("PRINT_RETRY_DELAY_MS", 1000)?),
            print_workers: env.parse("PRINT_WORKERS", 2)?,
            print_void_tickets: env.flag("PRINT_VOID_TICKETS", false)?,
            delivery_db_path: env.get("DELIVERY_DB_PATH").map(PathBuf::from),
            event_queue_capacity: env.parse("EVENT_QUEUE_CAPACITY", 256)?,
            shutdown_timeout: Duration::from_millis(env.parse("SHUTDOWN_TIMEOUT_MS", 10000)?),
            log_level: env.string("LOG_LEVEL", "info"),
            log_json: env.flag("LOG_JSON", false)?,
            log_dir: env.get("LOG_DIR").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        fn invalid(var: &'static str, value: impl ToString, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                var,
                value: value.to_string(),
                reason: reason.to_string(),
            }
        }

        if !(16..=128).contains(&self.paper_width) {
            return Err(invalid("PAPER_WIDTH", self.paper_width, "expected 16..=128"));
        }
        if self.print_max_attempts == 0 {
            return Err(invalid("PRINT_MAX_ATTEMPTS", 0, "must be at least 1"));
        }
        if self.print_workers == 0 {
            return Err(invalid("PRINT_WORKERS", 0, "must be at least 1"));
        }
        if self.event_queue_capacity == 0 {
            return Err(invalid("EVENT_QUEUE_CAPACITY", 0, "must be at least 1"));
        }
        if self.retry_backoff_cap.is_zero() {
            return Err(invalid("RETRY_BACKOFF_CAP", 0, "must be at least 1"));
        }
        if self.table_name.is_empty() {
            return Err(invalid("TABLE_NAME", "", "must not be empty"));
        }
        Ok(())
    }
}

/// Load `.env` from the working directory, falling back to `../.env`
///
/// Returns the file that was loaded, if any.
pub fn load_dotenv() -> Option<PathBuf> {
    if let Ok(path) = dotenv::dotenv() {
        return Some(path);
    }
    let parent = Path::new("..").join(".env");
    dotenv::from_path(&parent).ok().map(|_| parent)
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    /// Non-empty, trimmed value
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.get(k))
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> ConfigResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var: key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn flag(&self, key: &'static str, default: bool) -> ConfigResult<bool> {
        match self.get(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var: key,
                    value: v,
                    reason: "expected true or false".to_string(),
                }),
            },
        }
    }
}
