//! Realtime channel wire format
//!
//! Frames are JSON objects `{topic, event, payload, ref, join_ref}`.
//! Only the pieces the bridge needs are modelled; everything else stays a
//! `serde_json::Value`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ChangeEvent, Operation};

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_CHANGES: &str = "postgres_changes";
pub const EVENT_SYSTEM: &str = "system";
pub const TOPIC_PHOENIX: &str = "phoenix";

/// Protocol version sent in the socket URL
pub const VSN: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Frame {
    /// Join request subscribing to every change of `schema.table`
    pub fn join(topic: &str, schema: &str, table: &str, access_token: &str, reference: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: EVENT_JOIN.to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "ack": false, "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [
                        { "event": "*", "schema": schema, "table": table }
                    ]
                },
                "access_token": access_token
            }),
            reference: Some(reference.to_string()),
            join_ref: Some(reference.to_string()),
        }
    }

    pub fn leave(topic: &str, reference: &str, join_ref: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: EVENT_LEAVE.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: TOPIC_PHOENIX.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    /// Reply with `payload.status == "ok"` / `"error"`
    pub fn reply(topic: &str, reference: &str, status: &str, response: Value) -> Self {
        Self {
            topic: topic.to_string(),
            event: EVENT_REPLY.to_string(),
            payload: json!({ "status": status, "response": response }),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    pub fn reply_status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    /// Human readable reason of an error reply
    pub fn reply_reason(&self) -> String {
        let response = self.payload.get("response");
        response
            .and_then(|r| r.get("reason").or_else(|| r.get("message")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| response.map(Value::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Topic of the channel carrying our subscription
pub fn channel_topic(channel: &str) -> String {
    format!("realtime:{}", channel)
}

/// Whether a rejection reason points at credentials
pub fn is_auth_reason(reason: &str) -> bool {
    let r = reason.to_ascii_lowercase();
    ["unauthorized", "jwt", "token", "apikey", "api key", "auth", "forbidden"]
        .iter()
        .any(|needle| r.contains(needle))
}

/// Extract a change event from a `postgres_changes` payload
///
/// Accepts the current `{data: {type, record, old_record}}` shape as well as
/// older flat shapes using `record` / `new` / `old` and `eventType`.
pub fn extract_change(payload: &Value, received_at: DateTime<Utc>) -> Option<ChangeEvent> {
    let data = payload
        .get("data")
        .filter(|d| d.is_object())
        .unwrap_or(payload);

    let operation = data
        .get("type")
        .or_else(|| data.get("eventType"))
        .and_then(Value::as_str)
        .and_then(Operation::parse)?;

    let row = data
        .get("record")
        .or_else(|| data.get("new"))
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or_else(|| json!({}));

    let old_row = data
        .get("old_record")
        .or_else(|| data.get("old"))
        .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
        .cloned();

    let table = data
        .get("table")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let commit_timestamp = data
        .get("commit_timestamp")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(ChangeEvent {
        table,
        operation,
        row,
        old_row,
        commit_timestamp,
        received_at,
    })
}
