//! ChangeFeedClient: Realtime subscription with reconnect
//!
//! 1. Connect the WebSocket (`/realtime/v1/websocket`)
//! 2. Join `realtime:<table>` asking for every change of the table
//! 3. Forward `postgres_changes` to the pipeline queue
//! 4. Heartbeat every 30s, two unanswered heartbeats drop the session
//! 5. Reconnect with exponential backoff on disconnect

use chrono::Utc;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::protocol::{self, Frame};
use super::{ChangeEvent, FeedError, FeedResult};

/// First reconnect delay; doubles up to `retry_backoff_cap`
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Unanswered heartbeats before the session is considered dead
const MAX_MISSED_HEARTBEATS: u32 = 2;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub endpoint: String,
    pub api_key: String,
    pub schema: String,
    pub retry_backoff_cap: Duration,
    pub heartbeat_interval: Duration,
}

impl FeedConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            schema: "public".to_string(),
            retry_backoff_cap: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// How a session ended without a fatal error
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    /// The pipeline stopped listening
    SinkClosed,
    Dropped { joined: bool, reason: String },
}

pub struct ChangeFeedClient {
    config: FeedConfig,
    shutdown: CancellationToken,
}

impl ChangeFeedClient {
    pub fn new(config: FeedConfig, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    /// WebSocket URL derived from the store endpoint
    pub fn socket_url(&self) -> FeedResult<String> {
        let endpoint = self.config.endpoint.trim().trim_end_matches('/');
        let (scheme, rest) = endpoint
            .split_once("://")
            .ok_or_else(|| FeedError::InvalidEndpoint(format!("missing scheme: {}", endpoint)))?;
        let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(FeedError::InvalidEndpoint(format!(
                    "unsupported scheme '{}'",
                    other
                )));
            }
        };
        if rest.is_empty() {
            return Err(FeedError::InvalidEndpoint("missing host".to_string()));
        }
        Ok(format!(
            "{}://{}/realtime/v1/websocket?apikey={}&vsn={}",
            ws_scheme,
            rest,
            self.config.api_key,
            protocol::VSN
        ))
    }

    /// Stream every change of `table` into `sink` until shutdown
    ///
    /// Returns `Ok` on shutdown or when the receiver goes away, and an
    /// error only when retrying cannot help (bad credentials or endpoint).
    pub async fn subscribe(&self, table: &str, sink: mpsc::Sender<ChangeEvent>) -> FeedResult<()> {
        tracing::info!(table = %table, schema = %self.config.schema, "Change feed started");
        let cap = self.config.retry_backoff_cap.max(INITIAL_RECONNECT_DELAY);
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.run_session(table, &sink).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::SinkClosed) => {
                    tracing::info!("Event queue closed, change feed stopping");
                    break;
                }
                Ok(SessionEnd::Dropped { joined, reason }) => {
                    if joined {
                        reconnect_delay = INITIAL_RECONNECT_DELAY;
                    }
                    tracing::warn!(
                        reason = %reason,
                        delay_secs = reconnect_delay.as_secs(),
                        "Change feed disconnected, reconnecting"
                    );
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Change feed failed permanently");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        delay_secs = reconnect_delay.as_secs(),
                        "Change feed connection failed, retrying"
                    );
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(reconnect_delay) => {},
            }
            reconnect_delay = (reconnect_delay * 2).min(cap);
        }

        tracing::info!("Change feed stopped");
        Ok(())
    }

    /// One connection: connect, join, pump frames until it ends
    async fn run_session(&self, table: &str, sink: &mpsc::Sender<ChangeEvent>) -> FeedResult<SessionEnd> {
        let url = self.socket_url()?;
        let (ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| FeedError::Connect("connect timed out".to_string()))?
            .map_err(map_connect_error)?;
        tracing::debug!("Change feed socket connected");

        let (mut ws_sink, mut ws_stream) = ws.split();

        let mut next_ref: u64 = 0;
        let mut make_ref = || {
            next_ref += 1;
            next_ref.to_string()
        };

        let topic = protocol::channel_topic(table);
        let join_ref = make_ref();
        let join = Frame::join(&topic, &self.config.schema, table, &self.config.api_key, &join_ref);
        send_frame(&mut ws_sink, &join).await?;

        let join_deadline = tokio::time::sleep(JOIN_TIMEOUT);
        tokio::pin!(join_deadline);
        let mut joined = false;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await; // skip immediate tick
        let mut awaiting_heartbeat = false;
        let mut missed_heartbeats = 0;

        let dropped = |joined: bool, reason: &str| SessionEnd::Dropped {
            joined,
            reason: reason.to_string(),
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let leave = Frame::leave(&topic, &make_ref(), &join_ref);
                    let _ = send_frame(&mut ws_sink, &leave).await;
                    let _ = ws_sink.close().await;
                    return Ok(SessionEnd::Shutdown);
                }

                _ = &mut join_deadline, if !joined => {
                    return Err(FeedError::Subscribe("no reply to join".to_string()));
                }

                _ = heartbeat.tick() => {
                    if awaiting_heartbeat {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= MAX_MISSED_HEARTBEATS {
                            return Ok(dropped(joined, "heartbeat timeout"));
                        }
                    }
                    if send_frame(&mut ws_sink, &Frame::heartbeat(&make_ref())).await.is_err() {
                        return Ok(dropped(joined, "heartbeat send failed"));
                    }
                    awaiting_heartbeat = true;
                }

                msg = ws_stream.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                            return Ok(dropped(joined, &format!("closed by server {}", reason)));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) if joined => return Ok(dropped(joined, &e.to_string())),
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(dropped(joined, "stream ended")),
                    };

                    let frame: Frame = match serde_json::from_str(&text) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::warn!(error = %e, "Ignoring unparseable frame");
                            continue;
                        }
                    };

                    if frame.topic == protocol::TOPIC_PHOENIX {
                        if frame.event == protocol::EVENT_REPLY {
                            awaiting_heartbeat = false;
                            missed_heartbeats = 0;
                        }
                        continue;
                    }
                    if frame.topic != topic {
                        tracing::debug!(topic = %frame.topic, event = %frame.event, "Frame for another topic");
                        continue;
                    }

                    match frame.event.as_str() {
                        protocol::EVENT_REPLY if frame.reference.as_deref() == Some(join_ref.as_str()) => {
                            if frame.reply_status() == Some("ok") {
                                joined = true;
                                tracing::info!(topic = %topic, "Subscribed to change feed");
                            } else {
                                let reason = frame.reply_reason();
                                if protocol::is_auth_reason(&reason) {
                                    return Err(FeedError::Auth(reason));
                                }
                                return Err(FeedError::Subscribe(reason));
                            }
                        }
                        protocol::EVENT_CHANGES => {
                            let Some(event) = protocol::extract_change(&frame.payload, Utc::now()) else {
                                tracing::warn!(payload = %frame.payload, "Change without a usable operation");
                                continue;
                            };
                            tracing::debug!(operation = ?event.operation, table = %event.table, "Change received");
                            if sink.send(event).await.is_err() {
                                return Ok(SessionEnd::SinkClosed);
                            }
                        }
                        protocol::EVENT_SYSTEM => {
                            let status = frame.payload.get("status").and_then(|s| s.as_str());
                            if status == Some("error") {
                                tracing::warn!(payload = %frame.payload, "Realtime reported a subscription error");
                            } else {
                                tracing::debug!(payload = %frame.payload, "Realtime system message");
                            }
                        }
                        protocol::EVENT_ERROR | protocol::EVENT_CLOSE => {
                            return Ok(dropped(joined, &format!("channel {}", frame.event)));
                        }
                        other => {
                            tracing::debug!(event = %other, "Ignoring channel event");
                        }
                    }
                }
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> FeedResult<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(frame)?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Separate rejected credentials from transient failures
fn map_connect_error(e: tungstenite::Error) -> FeedError {
    match e {
        tungstenite::Error::Http(ref resp) => {
            let status = resp.status().as_u16();
            if status == 401 || status == 403 {
                FeedError::Auth(format!("store rejected connection (HTTP {})", status))
            } else {
                FeedError::Connect(format!("HTTP {} during upgrade", status))
            }
        }
        tungstenite::Error::Url(e) => FeedError::InvalidEndpoint(e.to_string()),
        other => FeedError::Connect(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(endpoint: &str) -> ChangeFeedClient {
        ChangeFeedClient::new(FeedConfig::new(endpoint, "anon-key"), CancellationToken::new())
    }

    #[test]
    fn test_socket_url() {
        assert_eq!(
            client("https://abc.supabase.co").socket_url().unwrap(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
        assert_eq!(
            client("http://127.0.0.1:54321/").socket_url().unwrap(),
            "ws://127.0.0.1:54321/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
    }

    #[test]
    fn test_socket_url_rejects_bad_endpoints() {
        assert!(matches!(client("abc.supabase.co").socket_url(), Err(FeedError::InvalidEndpoint(_))));
        assert!(matches!(client("ftp://host").socket_url(), Err(FeedError::InvalidEndpoint(_))));
        assert!(matches!(client("https://").socket_url(), Err(FeedError::InvalidEndpoint(_))));
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_fatal() {
        let (tx, _rx) = mpsc::channel(1);
        let err = client("nonsense").subscribe("orders", tx).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_shutdown_before_connect() {
        let token = CancellationToken::new();
        token.cancel();
        let c = ChangeFeedClient::new(FeedConfig::new("http://127.0.0.1:1", "k"), token);
        let (tx, _rx) = mpsc::channel(1);
        assert!(c.subscribe("orders", tx).await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_refused_retries_until_shutdown() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let token = CancellationToken::new();
        let c = ChangeFeedClient::new(FeedConfig::new(format!("http://127.0.0.1:{}", port), "k"), token.clone());
        let (tx, _rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move { c.subscribe("orders", tx).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_finished());
        token.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unanswered_heartbeats_drop_the_session() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let token = CancellationToken::new();
        let mut config = FeedConfig::new(format!("http://127.0.0.1:{}", port), "k");
        config.heartbeat_interval = Duration::from_millis(50);
        let c = ChangeFeedClient::new(config, token.clone());
        let (tx, _rx) = mpsc::channel(1);
        let client = tokio::spawn(async move { c.subscribe("orders", tx).await });

        // Join is accepted, heartbeats are never answered
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut heartbeats = 0;
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Text(text) = msg else { continue };
            let frame: Frame = serde_json::from_str(&text).unwrap();
            if frame.event == protocol::EVENT_JOIN {
                let reference = frame.reference.clone().unwrap();
                let reply = Frame::reply(&frame.topic, &reference, "ok", serde_json::json!({}));
                ws.send(Message::Text(serde_json::to_string(&reply).unwrap().into()))
                    .await
                    .unwrap();
            } else if frame.event == protocol::EVENT_HEARTBEAT {
                heartbeats += 1;
            }
        }
        assert_eq!(heartbeats, MAX_MISSED_HEARTBEATS);

        // The client reconnects by itself
        let (second, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
            .await
            .expect("no reconnect after heartbeat timeout")
            .unwrap();
        token.cancel();
        drop(second);
        assert!(client.await.unwrap().is_ok());
    }
}
