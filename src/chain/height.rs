//! Cached chain height fed by the node's new-block-header event stream.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::chain::ChainError;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Caches the height of the connected node, updated on every
/// `NewBlockHeader` event. The initial value comes from a synchronous
/// status query before the subscription is armed.
pub struct ChainHeightTracker {
    state: Arc<RwLock<HeightState>>,
}

struct HeightState {
    last_height: i64,
    last_error: Option<String>,
}

impl ChainHeightTracker {
    pub async fn new(
        tmrpc_endpoint: &str,
        rpc_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Self>, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let initial = query_status_height(&client, &http_base(tmrpc_endpoint)).await?;
        if initial < 1 {
            return Err(ChainError::NonPositiveHeight);
        }

        let tracker = Arc::new(Self {
            state: Arc::new(RwLock::new(HeightState {
                last_height: initial,
                last_error: None,
            })),
        });

        tokio::spawn(subscribe(
            ws_url(tmrpc_endpoint),
            Arc::clone(&tracker.state),
            shutdown,
        ));

        Ok(tracker)
    }

    /// Last committed height seen, or the subscription's last error.
    pub fn get_chain_height(&self) -> Result<i64, ChainError> {
        let state = self.state.read().expect("height state poisoned");
        match &state.last_error {
            Some(err) => Err(ChainError::Height(err.clone())),
            None => Ok(state.last_height),
        }
    }
}

async fn query_status_height(
    client: &reqwest::Client,
    http_base: &str,
) -> Result<i64, ChainError> {
    let body = json!({"jsonrpc": "2.0", "id": 1, "method": "status", "params": {}});
    let resp: Value = client
        .post(http_base)
        .json(&body)
        .send()
        .await
        .map_err(|e| ChainError::Rpc(e.to_string()))?
        .json()
        .await
        .map_err(|e| ChainError::Rpc(e.to_string()))?;

    resp["result"]["sync_info"]["latest_block_height"]
        .as_str()
        .and_then(|h| h.parse().ok())
        .ok_or_else(|| ChainError::Rpc("malformed status response".to_string()))
}

async fn subscribe(
    url: String,
    state: Arc<RwLock<HeightState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let set = |height: Option<i64>, error: Option<String>| {
        let mut s = state.write().expect("height state poisoned");
        if let Some(height) = height {
            s.last_height = height;
        }
        s.last_error = error;
    };

    while !*shutdown.borrow() {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                let (mut write, mut read) = stream.split();
                let frame = json!({
                    "jsonrpc": "2.0",
                    "method": "subscribe",
                    "id": 0,
                    "params": { "query": "tm.event = 'NewBlockHeader'" },
                });
                if let Err(err) = write.send(Message::Text(frame.to_string().into())).await {
                    set(None, Some(err.to_string()));
                } else {
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                // Dropping the connection tears down the
                                // server-side subscription.
                                let _ = write.send(Message::Close(None)).await;
                                info!("closing new block header subscription");
                                return;
                            }
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if let Some(height) = parse_header_height(text.as_str()) {
                                        set(Some(height), None);
                                    }
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    let _ = write.send(Message::Pong(payload)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    set(None, Some("block header stream closed".to_string()));
                                    break;
                                }
                                Some(Err(err)) => {
                                    set(None, Some(err.to_string()));
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "block header subscription connect failed");
                set(None, Some(err.to_string()));
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
        }
    }
}

fn parse_header_height(text: &str) -> Option<i64> {
    let value: Value = serde_json::from_str(text).ok()?;
    value["result"]["data"]["value"]["header"]["height"]
        .as_str()?
        .parse()
        .ok()
}

/// "tcp://host:26657" (or a bare address) -> "http://host:26657".
pub(crate) fn http_base(endpoint: &str) -> String {
    match endpoint.split_once("://") {
        Some(("http" | "https", _)) => endpoint.to_string(),
        Some((_, rest)) => format!("http://{rest}"),
        None => format!("http://{endpoint}"),
    }
}

fn ws_url(endpoint: &str) -> String {
    let base = http_base(endpoint);
    let ws = match base.strip_prefix("https://") {
        Some(rest) => format!("wss://{rest}"),
        None => format!("ws://{}", base.trim_start_matches("http://")),
    };
    format!("{}/websocket", ws.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_conversion() {
        assert_eq!(http_base("tcp://localhost:26657"), "http://localhost:26657");
        assert_eq!(http_base("localhost:26657"), "http://localhost:26657");
        assert_eq!(
            http_base("https://rpc.example.com"),
            "https://rpc.example.com"
        );
        assert_eq!(
            ws_url("tcp://localhost:26657"),
            "ws://localhost:26657/websocket"
        );
        assert_eq!(
            ws_url("https://rpc.example.com"),
            "wss://rpc.example.com/websocket"
        );
    }

    #[test]
    fn header_event_height_is_parsed() {
        let event = r#"{"jsonrpc":"2.0","id":0,"result":{"query":"tm.event = 'NewBlockHeader'","data":{"type":"tendermint/event/NewBlockHeader","value":{"header":{"height":"12345"}}}}}"#;
        assert_eq!(parse_header_height(event), Some(12345));
        assert_eq!(parse_header_height(r#"{"jsonrpc":"2.0","id":0,"result":{}}"#), None);
    }
}
