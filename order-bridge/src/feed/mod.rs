//! Change feed
//!
//! Subscribes to row changes of one table over the Realtime channel
//! protocol (Phoenix frames on a WebSocket) and turns them into
//! [`ChangeEvent`]s on a single-consumer queue.
//!
//! ```text
//! store ──ws──► ChangeFeedClient ──mpsc──► Pipeline
//!                  │
//!                  └── reconnect with exponential backoff
//! ```

mod client;
pub mod protocol;

pub use client::{ChangeFeedClient, FeedConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Row operation reported by the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Some(Operation::Insert),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// One row-level change, as delivered by the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub operation: Operation,
    /// New row contents (empty object for deletes)
    pub row: serde_json::Value,
    /// Previous row contents, when the feed sends them
    pub old_row: Option<serde_json::Value>,
    pub commit_timestamp: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FeedError {
    /// The store rejected our credentials; retrying will not help
    #[error("Authentication rejected by change feed: {0}")]
    Auth(String),

    #[error("Invalid feed endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Subscription rejected: {0}")]
    Subscribe(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FeedError {
    /// Fatal errors end the subscription instead of triggering a reconnect
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::Auth(_) | FeedError::InvalidEndpoint(_))
    }
}

pub type FeedResult<T> = Result<T, FeedError>;
