//! Canonical order model
//!
//! Everything downstream of the normalizer works on [`Order`]; the raw row
//! JSON is only kept for diagnostics.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Change type of an order event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Updated,
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Created => write!(f, "created"),
            OrderStatus::Updated => write!(f, "updated"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One line on the ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub quantity: u32,
    /// Modifier lines (sauce, toppings, free text)
    pub notes: Vec<String>,
    pub unit_price: Option<Decimal>,
}

impl LineItem {
    /// `None` without a price or when the total does not fit a `Decimal`
    pub fn line_total(&self) -> Option<Decimal> {
        self.unit_price?.checked_mul(Decimal::from(self.quantity))
    }
}

/// Header information carried by the row, printed as given
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub location: Option<String>,
    pub payment_method: Option<String>,
    pub total: Option<Decimal>,
    pub notes: Option<String>,
}

/// A kitchen order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub status: OrderStatus,
    pub items: Vec<LineItem>,
    /// When the change event arrived locally
    pub received_at: DateTime<Utc>,
    /// The row's own creation time, if it has one
    pub placed_at: Option<DateTime<Utc>>,
    pub details: OrderDetails,
    pub raw_payload: serde_json::Value,
}

impl Order {
    /// Hash of the item list; equal items give equal hashes
    pub fn content_hash(&self) -> String {
        content_hash(&self.items)
    }

    /// Time printed on the ticket
    pub fn ticket_time(&self) -> DateTime<Utc> {
        self.placed_at.unwrap_or(self.received_at)
    }
}

/// Truncated hex SHA-256 over the canonical JSON of `items`
pub fn content_hash(items: &[LineItem]) -> String {
    let mut hasher = Sha256::new();
    // Struct fields serialize in declaration order, so this is canonical
    match serde_json::to_vec(items) {
        Ok(bytes) => hasher.update(&bytes),
        Err(_) => {
            for item in items {
                hasher.update(item.name.as_bytes());
                hasher.update(item.quantity.to_le_bytes());
            }
        }
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn item(name: &str, quantity: u32) -> LineItem {
        LineItem {
            name: name.to_string(),
            quantity,
            notes: vec![],
            unit_price: None,
        }
    }

    pub fn order(id: &str, status: OrderStatus, items: Vec<LineItem>) -> Order {
        Order {
            order_id: id.to_string(),
            status,
            items,
            received_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            placed_at: None,
            details: OrderDetails::default(),
            raw_payload: serde_json::Value::Null,
        }
    }
}
