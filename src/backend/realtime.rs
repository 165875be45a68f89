// Websocket client for the hosted realtime endpoint (Phoenix channel protocol)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use super::{BackendError, ChangeSubscription};
use crate::types::{ChangeEvent, ChangeKind, ChangeScope, Table};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const PHOENIX_TOPIC: &str = "phoenix";

pub struct RealtimeClient {
    socket_url: Url,
    heartbeat: Duration,
    channel_seq: Arc<AtomicU64>,
}

impl RealtimeClient {
    /// `backend_url` is the service root (`https://<project>.supabase.co`)
    pub fn new(backend_url: &Url, anon_key: &str, heartbeat: Duration) -> Result<Self, BackendError> {
        let mut socket_url = backend_url
            .join("realtime/v1/websocket")
            .map_err(|e| BackendError::Subscription(format!("invalid realtime url: {}", e)))?;
        let scheme = if backend_url.scheme() == "https" { "wss" } else { "ws" };
        socket_url
            .set_scheme(scheme)
            .map_err(|_| BackendError::Subscription("cannot derive websocket scheme".to_string()))?;
        socket_url
            .query_pairs_mut()
            .append_pair("apikey", anon_key)
            .append_pair("vsn", "1.0.0");

        Ok(Self { socket_url, heartbeat, channel_seq: Arc::new(AtomicU64::new(0)) })
    }

    pub fn socket_url(&self) -> &Url {
        &self.socket_url
    }

    /// Open one channel covering every scope; resolves once the server acknowledged the join
    pub async fn subscribe(
        &self,
        scopes: &[ChangeScope],
        access_token: Option<String>,
    ) -> Result<ChangeSubscription, BackendError> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.socket_url.as_str())
            .await
            .map_err(|e| BackendError::Subscription(format!("connect failed: {}", e)))?;
        let (mut sink, mut source) = stream.split();

        let topic = format!("realtime:haven-{}", self.channel_seq.fetch_add(1, Ordering::SeqCst));
        let join = join_message(&topic, scopes, access_token.as_deref(), "1");
        sink.send(Message::Text(join.to_string()))
            .await
            .map_err(|e| BackendError::Subscription(format!("join send failed: {}", e)))?;

        tokio::time::timeout(JOIN_TIMEOUT, await_join(&mut source))
            .await
            .map_err(|_| BackendError::Timeout("realtime join timed out".to_string()))??;

        tracing::info!("Realtime channel {} joined ({} scopes)", topic, scopes.len());

        let (tx, rx) = mpsc::channel(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let heartbeat = self.heartbeat;
        let channel_topic = topic.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            let mut msg_ref: u64 = 1;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        msg_ref += 1;
                        let leave = json!({
                            "topic": channel_topic,
                            "event": "phx_leave",
                            "payload": {},
                            "ref": msg_ref.to_string(),
                        });
                        let _ = sink.send(Message::Text(leave.to_string())).await;
                        let _ = sink.close().await;
                        tracing::debug!("Realtime channel {} left", channel_topic);
                        break;
                    }
                    _ = ticker.tick() => {
                        msg_ref += 1;
                        let beat = json!({
                            "topic": PHOENIX_TOPIC,
                            "event": "heartbeat",
                            "payload": {},
                            "ref": msg_ref.to_string(),
                        });
                        if let Err(e) = sink.send(Message::Text(beat.to_string())).await {
                            let _ = tx.send(Err(BackendError::Subscription(format!("heartbeat failed: {}", e)))).await;
                            break;
                        }
                    }
                    frame = source.next() => {
                        let text = match frame {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | None => {
                                let _ = tx.send(Err(BackendError::Subscription("socket closed".to_string()))).await;
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                let _ = tx.send(Err(BackendError::Subscription(e.to_string()))).await;
                                break;
                            }
                        };
                        let Ok(message) = serde_json::from_str::<Value>(&text) else {
                            tracing::warn!("Ignoring undecodable realtime frame");
                            continue;
                        };
                        match message["event"].as_str() {
                            Some("postgres_changes") => {
                                if let Some(event) = decode_change(&message["payload"]) {
                                    if tx.send(Ok(event)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some("phx_error") | Some("phx_close") => {
                                let _ = tx
                                    .send(Err(BackendError::Subscription(format!("channel {}", message["event"]))))
                                    .await;
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        Ok(ChangeSubscription::new(topic, rx, move || {
            let _ = shutdown_tx.send(());
        }))
    }
}

async fn await_join<S>(source: &mut S) -> Result<(), BackendError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = source.next().await {
        let frame = frame.map_err(|e| BackendError::Subscription(e.to_string()))?;
        let Message::Text(text) = frame else { continue };
        let message: Value = serde_json::from_str(&text)?;
        if message["event"] == "phx_reply" && message["ref"] == "1" {
            return match message["payload"]["status"].as_str() {
                Some("ok") => Ok(()),
                _ => Err(BackendError::Subscription(format!(
                    "join rejected: {}",
                    message["payload"]["response"]
                ))),
            };
        }
    }
    Err(BackendError::Subscription("socket closed during join".to_string()))
}

/// `phx_join` frame subscribing to postgres changes for each scope
pub fn join_message(topic: &str, scopes: &[ChangeScope], access_token: Option<&str>, msg_ref: &str) -> Value {
    let changes: Vec<Value> = scopes
        .iter()
        .map(|scope| {
            let mut entry = json!({
                "event": "*",
                "schema": "public",
                "table": scope.table.as_str(),
            });
            if let Some(filter) = scope.filter_expression() {
                entry["filter"] = json!(filter);
            }
            entry
        })
        .collect();

    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": changes,
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = json!(token);
    }

    json!({
        "topic": topic,
        "event": "phx_join",
        "payload": payload,
        "ref": msg_ref,
        "join_ref": msg_ref,
    })
}

/// Decode the `payload` of a `postgres_changes` frame
pub fn decode_change(payload: &Value) -> Option<ChangeEvent> {
    let data = payload.get("data")?;
    let table = Table::parse(data.get("table")?.as_str()?)?;
    let kind = ChangeKind::parse(data.get("type")?.as_str()?)?;
    let non_empty = |value: Option<&Value>| {
        value
            .filter(|v| v.as_object().map(|o| !o.is_empty()).unwrap_or(false))
            .cloned()
    };
    Some(ChangeEvent {
        table,
        kind,
        new: non_empty(data.get("record")),
        old: non_empty(data.get("old_record")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_uses_websocket_scheme_and_key() {
        let base = Url::parse("https://demo.supabase.co").unwrap();
        let client = RealtimeClient::new(&base, "anon", Duration::from_secs(30)).unwrap();
        assert_eq!(
            client.socket_url().as_str(),
            "wss://demo.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn join_message_carries_record_filter() {
        let scopes = vec![ChangeScope::record(Table::Apps, "abc-123"), ChangeScope::table(Table::AppReviews)];
        let join = join_message("realtime:x", &scopes, Some("jwt"), "1");
        let changes = &join["payload"]["config"]["postgres_changes"];
        assert_eq!(changes[0]["filter"], "id=eq.abc-123");
        assert!(changes[1].get("filter").is_none());
        assert_eq!(join["payload"]["access_token"], "jwt");
    }

    #[test]
    fn decodes_delete_payload_with_old_record() {
        let payload = json!({
            "data": {
                "schema": "public",
                "table": "apps",
                "type": "DELETE",
                "record": {},
                "old_record": { "id": "abc-123" }
            }
        });
        let event = decode_change(&payload).unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert!(event.new.is_none());
        assert_eq!(event.row().unwrap()["id"], "abc-123");
    }
}
