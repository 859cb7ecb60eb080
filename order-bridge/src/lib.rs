//! Order Bridge - realtime order feed to kitchen printer
//!
//! # Architecture
//!
//! ```text
//! change feed ──► queue ──► sequencer ──► worker shards ──► printer
//!  (feed)                  normalize        format
//!                          claim (tracker)  dispatch + retry
//! ```
//!
//! - **feed**: Realtime websocket subscription with heartbeat and reconnect
//! - **normalizer**: raw row → [`Order`]
//! - **tracker**: at-most-once claims per order revision, optionally persisted in redb
//! - **formatter**: [`Order`] → [`PrintJob`]
//! - **dispatcher**: print with bounded retry
//! - **pipeline**: ordering per order, concurrency across orders
//!
//! # Module layout
//!
//! ```text
//! order-bridge/src/
//! ├── bridge.rs      # process context, startup and shutdown
//! ├── config.rs      # environment configuration
//! ├── feed/          # change feed client and wire frames
//! ├── normalizer.rs
//! ├── order.rs       # domain model
//! ├── tracker/       # delivery records and storage
//! ├── formatter.rs
//! ├── dispatcher.rs
//! ├── pipeline.rs
//! ├── tasks.rs       # background tasks
//! └── logger.rs
//! ```

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod feed;
pub mod formatter;
pub mod logger;
pub mod normalizer;
pub mod order;
pub mod pipeline;
pub mod tasks;
pub mod tracker;

pub use bridge::{Bridge, BridgeError, BridgeResult};
pub use config::{Config, ConfigError, load_dotenv};
pub use dispatcher::{PrintDispatcher, PrintSink, PrinterSink, RetryPolicy};
pub use feed::{ChangeEvent, ChangeFeedClient, FeedConfig, FeedError, Operation};
pub use formatter::{PrintJob, TicketFormatter};
pub use logger::{cleanup_old_logs, init_logger};
pub use normalizer::{MalformedEventError, normalize};
pub use order::{LineItem, Order, OrderDetails, OrderStatus};
pub use pipeline::{Control, Pipeline, StatsSnapshot};
pub use tracker::{Claim, DeliveryKey, DeliveryTracker, TicketKind};

pub fn print_banner() {
    println!(
        r#"
  ____          _             ____       _     _
 / __ \_ __ __| | ___ _ __  | __ ) _ __(_) __| | __ _  ___
| |  | | '__/ _` |/ _ \ '__| |  _ \| '__| |/ _` |/ _` |/ _ \
| |__| | | | (_| |  __/ |    | |_) | |  | | (_| | (_| |  __/
 \____/|_|  \__,_|\___|_|    |____/|_|  |_|\__,_|\__, |\___|
                                                 |___/
    "#
    );
}
