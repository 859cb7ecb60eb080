//! Change event → [`Order`]
//!
//! Rows come from a table written by a web frontend, so the parser is
//! lenient about shapes (ids as numbers, items as a JSON string, prices as
//! strings) and strict about the few things a ticket cannot do without.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;
use thiserror::Error;

use crate::feed::{ChangeEvent, Operation};
use crate::order::{LineItem, Order, OrderDetails, OrderStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedEventError {
    #[error("row is not a JSON object")]
    NotAnObject,

    #[error("missing or empty order id")]
    MissingId,

    #[error("missing items")]
    MissingItems,

    #[error("items is not a list: {0}")]
    InvalidItems(String),

    #[error("order has no items")]
    EmptyItems,

    #[error("item {index}: {reason}")]
    InvalidItem { index: usize, reason: String },
}

pub type NormalizeResult<T> = Result<T, MalformedEventError>;

/// Build the canonical order for a change event
pub fn normalize(event: &ChangeEvent) -> NormalizeResult<Order> {
    // Deletes only carry the old row (often just the primary key)
    let row = match event.operation {
        Operation::Delete => event
            .old_row
            .as_ref()
            .filter(|r| r.get("id").is_some())
            .unwrap_or(&event.row),
        _ => &event.row,
    };
    let obj = row.as_object().ok_or(MalformedEventError::NotAnObject)?;

    let order_id = parse_id(obj.get("id")).ok_or(MalformedEventError::MissingId)?;
    let status = status_for(event.operation, obj);

    let items = match (status, obj.get("items")) {
        (OrderStatus::Cancelled, None | Some(Value::Null)) => Vec::new(),
        (_, None | Some(Value::Null)) => return Err(MalformedEventError::MissingItems),
        (_, Some(raw)) => parse_items(raw)?,
    };
    if items.is_empty() && status != OrderStatus::Cancelled {
        return Err(MalformedEventError::EmptyItems);
    }

    Ok(Order {
        order_id,
        status,
        items,
        received_at: event.received_at,
        placed_at: obj.get("created_at").and_then(parse_timestamp),
        details: parse_details(obj),
        raw_payload: row.clone(),
    })
}

fn status_for(operation: Operation, row: &Map<String, Value>) -> OrderStatus {
    match operation {
        Operation::Insert => OrderStatus::Created,
        Operation::Delete => OrderStatus::Cancelled,
        Operation::Update => {
            let cancelled = row
                .get("status")
                .and_then(Value::as_str)
                .map(|s| {
                    let s = s.trim().to_ascii_lowercase();
                    s == "cancelled" || s == "canceled"
                })
                .unwrap_or(false);
            if cancelled {
                OrderStatus::Cancelled
            } else {
                OrderStatus::Updated
            }
        }
    }
}

fn parse_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_items(raw: &Value) -> NormalizeResult<Vec<LineItem>> {
    // Some writers store the list as a JSON-encoded string
    let decoded;
    let list = match raw {
        Value::Array(list) => list,
        Value::String(s) => {
            decoded = serde_json::from_str::<Value>(s)
                .map_err(|e| MalformedEventError::InvalidItems(e.to_string()))?;
            decoded
                .as_array()
                .ok_or_else(|| MalformedEventError::InvalidItems("decoded value is not a list".into()))?
        }
        other => return Err(MalformedEventError::InvalidItems(type_name(other).into())),
    };

    list.iter()
        .enumerate()
        .map(|(index, item)| parse_item(item).map_err(|reason| MalformedEventError::InvalidItem { index, reason }))
        .collect()
}

fn parse_item(value: &Value) -> Result<LineItem, String> {
    let obj = value.as_object().ok_or_else(|| format!("expected object, got {}", type_name(value)))?;

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or("missing name")?
        .to_string();

    let quantity = match obj.get("quantity") {
        None | Some(Value::Null) => 1,
        Some(v) => parse_quantity(v).ok_or_else(|| format!("invalid quantity {}", v))?,
    };

    let mut notes = Vec::new();
    for key in ["notes", "note"] {
        if let Some(text) = obj.get(key).and_then(non_empty_str) {
            notes.push(text.to_string());
        }
    }
    if let Some(custom) = obj.get("customizations").and_then(Value::as_object) {
        if let Some(sauce) = custom.get("sauce").and_then(non_empty_str) {
            notes.push(format!("Sauce: {}", sauce));
        }
        if let Some(cheese) = custom.get("cheese").and_then(non_empty_str) {
            notes.push(format!("Cheese: {}", cheese));
        }
        if let Some(toppings) = custom.get("toppings").and_then(Value::as_array) {
            notes.extend(
                toppings
                    .iter()
                    .filter_map(non_empty_str)
                    .map(|t| format!("Add: {}", t)),
            );
        }
    }

    let item = LineItem {
        name,
        quantity,
        notes,
        unit_price: obj.get("price").and_then(parse_decimal),
    };
    if item.unit_price.is_some() && item.line_total().is_none() {
        return Err(format!("price out of range for quantity {}", item.quantity));
    }
    Ok(item)
}

fn parse_quantity(value: &Value) -> Option<u32> {
    let n = match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            // 2.0 from a float column
            n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)
        })?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    u32::try_from(n).ok().filter(|n| *n >= 1)
}

fn parse_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok())),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?;
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| {
            // Postgres timestamptz text without the 'T'
            DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z").map(|t| t.with_timezone(&Utc))
        })
        .ok()
}

fn parse_details(row: &Map<String, Value>) -> OrderDetails {
    let text = |key: &str| row.get(key).and_then(non_empty_str).map(str::to_string);
    OrderDetails {
        customer_name: text("customer_name"),
        customer_phone: text("customer_phone"),
        location: text("location").or_else(|| text("dorm")),
        payment_method: text("payment_method"),
        total: row
            .get("total_amount")
            .or_else(|| row.get("total"))
            .and_then(parse_decimal),
        notes: text("notes"),
    }
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(operation: Operation, row: Value) -> ChangeEvent {
        ChangeEvent {
            table: "orders".into(),
            operation,
            row,
            old_row: None,
            commit_timestamp: None,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_minimal() {
        let ev = event(
            Operation::Insert,
            json!({"id": "A1", "items": [{"name": "Burger", "quantity": 1}]}),
        );
        let order = normalize(&ev).unwrap();
        assert_eq!(order.order_id, "A1");
        assert_eq!(order.status, OrderStatus::Created);
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].name, "Burger");
        assert_eq!(order.items[0].quantity, 1);
        assert_eq!(order.received_at, ev.received_at);
    }

    #[test]
    fn test_numeric_id_and_string_items() {
        let ev = event(
            Operation::Insert,
            json!({"id": 42, "items": "[{\"name\": \"Debug Pizza\", \"quantity\": 1, \"price\": 0}]"}),
        );
        let order = normalize(&ev).unwrap();
        assert_eq!(order.order_id, "42");
        assert_eq!(order.items[0].name, "Debug Pizza");
        assert_eq!(order.items[0].unit_price, Some(Decimal::ZERO));
    }

    #[test]
    fn test_missing_id_is_malformed() {
        let ev = event(Operation::Insert, json!({"items": [{"name": "Burger"}]}));
        assert_eq!(normalize(&ev).unwrap_err(), MalformedEventError::MissingId);

        let ev = event(Operation::Insert, json!({"id": "  ", "items": [{"name": "Burger"}]}));
        assert_eq!(normalize(&ev).unwrap_err(), MalformedEventError::MissingId);
    }

    #[test]
    fn test_items_errors() {
        let ev = event(Operation::Insert, json!({"id": "A1"}));
        assert_eq!(normalize(&ev).unwrap_err(), MalformedEventError::MissingItems);

        let ev = event(Operation::Insert, json!({"id": "A1", "items": []}));
        assert_eq!(normalize(&ev).unwrap_err(), MalformedEventError::EmptyItems);

        let ev = event(Operation::Insert, json!({"id": "A1", "items": 5}));
        assert!(matches!(normalize(&ev), Err(MalformedEventError::InvalidItems(_))));

        let ev = event(Operation::Insert, json!({"id": "A1", "items": "not json"}));
        assert!(matches!(normalize(&ev), Err(MalformedEventError::InvalidItems(_))));

        let ev = event(Operation::Insert, json!({"id": "A1", "items": [{"quantity": 2}]}));
        assert!(matches!(
            normalize(&ev),
            Err(MalformedEventError::InvalidItem { index: 0, .. })
        ));

        let ev = event(Operation::Insert, json!({"id": "A1", "items": [{"name": "X", "quantity": 0}]}));
        assert!(matches!(normalize(&ev), Err(MalformedEventError::InvalidItem { .. })));
    }

    #[test]
    fn test_quantity_and_price_shapes() {
        let ev = event(
            Operation::Insert,
            json!({"id": "A1", "items": [
                {"name": "A", "quantity": "3", "price": "4.50"},
                {"name": "B", "quantity": 2.0, "price": 1.25},
                {"name": "C"}
            ]}),
        );
        let order = normalize(&ev).unwrap();
        assert_eq!(order.items[0].quantity, 3);
        assert_eq!(order.items[0].unit_price, Some(Decimal::from_str("4.50").unwrap()));
        assert_eq!(order.items[1].quantity, 2);
        assert_eq!(order.items[1].unit_price, Some(Decimal::from_str("1.25").unwrap()));
        assert_eq!(order.items[2].quantity, 1);
        assert_eq!(order.items[2].unit_price, None);
    }

    #[test]
    fn test_price_overflowing_line_total_is_rejected() {
        let ev = event(
            Operation::Insert,
            json!({"id": "X1", "items": [
                {"name": "Soup", "quantity": 1},
                {"name": "Gold", "quantity": 2, "price": "79228162514264337593543950335"}
            ]}),
        );
        let err = normalize(&ev).unwrap_err();
        assert!(matches!(err, MalformedEventError::InvalidItem { index: 1, ref reason } if reason.contains("price")));

        // The same price once is still a valid line
        let ev = event(
            Operation::Insert,
            json!({"id": "X1", "items": [{"name": "Gold", "price": "79228162514264337593543950335"}]}),
        );
        assert_eq!(normalize(&ev).unwrap().items[0].line_total(), Some(Decimal::MAX));
    }

    #[test]
    fn test_customizations_become_notes() {
        let ev = event(
            Operation::Insert,
            json!({"id": "A1", "items": [{
                "name": "Pizza",
                "note": "well done",
                "customizations": {"sauce": "BBQ", "cheese": "", "toppings": ["Olives", "Ham"]}
            }]}),
        );
        let order = normalize(&ev).unwrap();
        assert_eq!(
            order.items[0].notes,
            vec!["well done", "Sauce: BBQ", "Add: Olives", "Add: Ham"]
        );
    }

    #[test]
    fn test_update_status_mapping() {
        let row = json!({"id": "A1", "status": "preparing", "items": [{"name": "Burger"}]});
        assert_eq!(normalize(&event(Operation::Update, row)).unwrap().status, OrderStatus::Updated);

        let row = json!({"id": "A1", "status": "Canceled", "items": [{"name": "Burger"}]});
        assert_eq!(normalize(&event(Operation::Update, row)).unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn test_delete_uses_old_row_without_items() {
        let mut ev = event(Operation::Delete, json!({}));
        ev.old_row = Some(json!({"id": "A1"}));
        let order = normalize(&ev).unwrap();
        assert_eq!(order.order_id, "A1");
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order.items.is_empty());
    }

    #[test]
    fn test_details_and_placed_at() {
        let ev = event(
            Operation::Insert,
            json!({
                "id": "A1",
                "items": [{"name": "Burger"}],
                "customer_name": "Ana",
                "customer_phone": "555",
                "dorm": "Hall B",
                "payment_method": "cash",
                "total_amount": 12.5,
                "notes": "no onions",
                "created_at": "2024-05-01T10:15:00+00:00"
            }),
        );
        let order = normalize(&ev).unwrap();
        assert_eq!(order.details.customer_name.as_deref(), Some("Ana"));
        assert_eq!(order.details.location.as_deref(), Some("Hall B"));
        assert_eq!(order.details.total, Some(Decimal::from_str("12.5").unwrap()));
        assert_eq!(order.details.notes.as_deref(), Some("no onions"));
        assert_eq!(order.placed_at.unwrap().to_rfc3339(), "2024-05-01T10:15:00+00:00");
    }

    #[test]
    fn test_postgres_timestamp_format() {
        let ts = parse_timestamp(&json!("2024-05-01 10:15:00.123456+00")).unwrap();
        assert_eq!(ts.format("%H:%M:%S").to_string(), "10:15:00");
    }
}
