//! End-to-end: fake Realtime server → Bridge → recording sink

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use order_bridge::feed::protocol::{self, Frame};
use order_bridge::{Bridge, BridgeError, Config, FeedError, PrintJob, PrintSink};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use ticket_printer::PrintResult;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
struct RecordingSink {
    jobs: Mutex<Vec<PrintJob>>,
}

impl RecordingSink {
    fn printed(&self) -> Vec<PrintJob> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl PrintSink for RecordingSink {
    async fn submit(&self, job: &PrintJob) -> PrintResult<()> {
        self.jobs.lock().push(job.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}

fn config(port: u16) -> Config {
    Config::from_lookup(|k| match k {
        "STORE_ENDPOINT" => Some(format!("http://127.0.0.1:{}", port)),
        "STORE_API_KEY" => Some("anon".to_string()),
        _ => None,
    })
    .unwrap()
}

fn config_with_void_tickets(port: u16) -> Config {
    let mut config = config(port);
    config.print_void_tickets = true;
    config
}

async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Accept one socket and wait for its join request
async fn accept_join(listener: &TcpListener) -> (WebSocketStream<TcpStream>, Frame) {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("client never connected")
        .unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

    loop {
        let msg = ws.next().await.expect("socket closed before join").unwrap();
        if let Message::Text(text) = msg {
            let frame: Frame = serde_json::from_str(&text).unwrap();
            if frame.event == protocol::EVENT_JOIN {
                return (ws, frame);
            }
        }
    }
}

async fn reply(ws: &mut WebSocketStream<TcpStream>, join: &Frame, status: &str, response: Value) {
    let reference = join.reference.clone().unwrap();
    let frame = Frame::reply(&join.topic, &reference, status, response);
    send(ws, &frame).await;
}

async fn send(ws: &mut WebSocketStream<TcpStream>, frame: &Frame) {
    let text = serde_json::to_string(frame).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

fn change(topic: &str, kind: &str, record: Value) -> Frame {
    change_with_old(topic, kind, record, json!({}))
}

fn change_with_old(topic: &str, kind: &str, record: Value, old_record: Value) -> Frame {
    Frame {
        topic: topic.to_string(),
        event: protocol::EVENT_CHANGES.to_string(),
        payload: json!({
            "data": {
                "schema": "public",
                "table": "orders",
                "commit_timestamp": "2024-05-01T12:00:00Z",
                "type": kind,
                "record": record,
                "old_record": old_record
            },
            "ids": [1]
        }),
        reference: None,
        join_ref: None,
    }
}

fn order_row(id: &str, items: Value) -> Value {
    json!({
        "id": id,
        "customer_name": "Ana",
        "status": "pending",
        "items": items,
        "total_amount": 12.5
    })
}

async fn wait_for_jobs(sink: &RecordingSink, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while sink.printed().len() < count {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("tickets not printed in time");
}

#[tokio::test]
async fn test_prints_once_across_redelivery_and_reconnect() {
    let (listener, port) = bind().await;
    let sink = Arc::new(RecordingSink::default());
    let bridge = Bridge::start_with_sink(config(port), sink.clone()).unwrap();

    let row = order_row("ord-1001", json!([{"name": "Burger", "quantity": 2, "price": 5.0}]));

    // First session: insert delivered twice, then the server drops us
    let (mut ws, join) = accept_join(&listener).await;
    assert_eq!(join.topic, "realtime:orders");
    assert_eq!(join.payload["access_token"], "anon");
    reply(&mut ws, &join, "ok", json!({})).await;
    send(&mut ws, &change(&join.topic, "INSERT", row.clone())).await;
    send(&mut ws, &change(&join.topic, "INSERT", row.clone())).await;
    wait_for_jobs(&sink, 1).await;
    drop(ws);

    // Second session replays the insert and adds a real update
    let (mut ws, join) = accept_join(&listener).await;
    reply(&mut ws, &join, "ok", json!({})).await;
    send(&mut ws, &change(&join.topic, "INSERT", row.clone())).await;
    let updated = order_row(
        "ord-1001",
        json!([{"name": "Burger", "quantity": 2, "price": 5.0}, {"name": "Fries", "quantity": 1}]),
    );
    send(&mut ws, &change(&join.topic, "UPDATE", updated.clone())).await;
    // Same update again is unchanged
    send(&mut ws, &change(&join.topic, "UPDATE", updated)).await;
    wait_for_jobs(&sink, 2).await;

    bridge.shutdown().await.unwrap();

    let printed = sink.printed();
    assert_eq!(printed.len(), 2);
    assert!(printed.iter().all(|j| j.order_id() == "ord-1001"));
    assert!(printed[0].plain_text().contains("NEW ORDER"));
    assert!(printed[1].plain_text().contains("UPDATED ORDER"));
    assert!(printed[1].plain_text().contains("Fries x1"));
}

#[tokio::test]
async fn test_malformed_row_does_not_block_later_orders() {
    let (listener, port) = bind().await;
    let sink = Arc::new(RecordingSink::default());
    let bridge = Bridge::start_with_sink(config(port), sink.clone()).unwrap();

    let (mut ws, join) = accept_join(&listener).await;
    reply(&mut ws, &join, "ok", json!({})).await;
    send(&mut ws, &change(&join.topic, "INSERT", json!({"customer_name": "no id"}))).await;
    send(
        &mut ws,
        &change(&join.topic, "INSERT", order_row("ord-2", json!([{"name": "Soup", "quantity": 1}]))),
    )
    .await;
    wait_for_jobs(&sink, 1).await;

    let stats = bridge.stats();
    bridge.shutdown().await.unwrap();

    assert_eq!(stats.malformed, 1);
    assert_eq!(sink.printed()[0].order_id(), "ord-2");
}

#[tokio::test]
async fn test_delete_with_old_record_prints_void_ticket() {
    let (listener, port) = bind().await;
    let sink = Arc::new(RecordingSink::default());
    let bridge = Bridge::start_with_sink(config_with_void_tickets(port), sink.clone()).unwrap();

    let (mut ws, join) = accept_join(&listener).await;
    reply(&mut ws, &join, "ok", json!({})).await;
    send(
        &mut ws,
        &change(&join.topic, "INSERT", order_row("ord-7", json!([{"name": "Tacos", "quantity": 3}]))),
    )
    .await;
    wait_for_jobs(&sink, 1).await;

    // Deletes carry only the primary key in old_record
    let delete = change_with_old(&join.topic, "DELETE", json!(null), json!({"id": "ord-7"}));
    send(&mut ws, &delete).await;
    send(&mut ws, &delete).await;
    wait_for_jobs(&sink, 2).await;

    bridge.shutdown().await.unwrap();

    let printed = sink.printed();
    assert_eq!(printed.len(), 2);
    assert_eq!(printed[1].order_id(), "ord-7");
    assert!(printed[1].plain_text().contains("*** VOID ***"));
    assert!(printed[1].plain_text().contains("CANCELLED - DO NOT PREPARE"));
}

#[tokio::test]
async fn test_rejected_credentials_end_the_bridge() {
    let (listener, port) = bind().await;
    let sink = Arc::new(RecordingSink::default());
    let bridge = Bridge::start_with_sink(config(port), sink.clone()).unwrap();

    let server = tokio::spawn(async move {
        let (mut ws, join) = accept_join(&listener).await;
        reply(&mut ws, &join, "error", json!({"reason": "Invalid JWT"})).await;
        // Keep the socket open until the client hangs up
        while let Some(Ok(_)) = ws.next().await {}
    });

    let result = tokio::time::timeout(Duration::from_secs(10), bridge.run_until(std::future::pending()))
        .await
        .expect("bridge kept running after auth failure");
    assert!(matches!(result, Err(BridgeError::Feed(FeedError::Auth(_)))));
    assert!(sink.printed().is_empty());
    server.abort();
}
