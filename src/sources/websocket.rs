//! Shared websocket connection controller used by every streaming
//! adapter.
//!
//! Owns the connect / subscribe / read / reconnect lifecycle so venue
//! modules only supply subscription frames and a message parser. Uses
//! split read/write halves so heartbeat replies never block the read
//! loop.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::sources::ProviderKind;
use crate::types::CurrencyPair;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Venue-specific half of a streaming adapter: frames to send on
/// (re)connect and the parser that feeds the adapter's caches.
pub(crate) trait VenueHandler: Send + Sync + 'static {
    fn kind(&self) -> ProviderKind;

    fn ws_url(&self) -> String;

    /// Subscription frames for the given pairs, sent after every
    /// successful handshake.
    fn subscription_frames(&self, pairs: &[CurrencyPair]) -> Vec<Message>;

    /// Parse one text frame, updating the adapter caches. Returns a
    /// reply frame when the venue protocol demands one (heartbeats).
    fn on_text(&self, text: &str) -> Option<Message>;

    /// Decode a binary frame into text (e.g. gzip venues). `None` skips
    /// the frame.
    fn decode_binary(&self, _payload: &[u8]) -> Option<String> {
        None
    }
}

/// Handle kept by the adapter to amend the live subscription set.
pub(crate) struct Subscriptions {
    tx: mpsc::UnboundedSender<Vec<CurrencyPair>>,
}

impl Subscriptions {
    pub(crate) fn add(&self, pairs: Vec<CurrencyPair>) {
        // The reader task is gone only after shutdown; nothing to do then.
        let _ = self.tx.send(pairs);
    }
}

/// Spawn the connection task for a venue. The task lives until the root
/// shutdown signal fires.
pub(crate) fn spawn<H: VenueHandler>(
    handler: Arc<H>,
    pairs: Vec<CurrencyPair>,
    shutdown: watch::Receiver<bool>,
) -> Subscriptions {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(handler, pairs, rx, shutdown));
    Subscriptions { tx }
}

async fn run<H: VenueHandler>(
    handler: Arc<H>,
    mut pairs: Vec<CurrencyPair>,
    mut sub_rx: mpsc::UnboundedReceiver<Vec<CurrencyPair>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_INITIAL;

    while !*shutdown.borrow() {
        let url = handler.ws_url();
        let ws = tokio::select! {
            _ = shutdown.changed() => return,
            ws = connect_async(url.as_str()) => ws,
        };

        match ws {
            Ok((stream, _)) => {
                info!(provider = %handler.kind(), %url, "websocket connected");
                backoff = BACKOFF_INITIAL;

                let (mut write, mut read) = stream.split();
                let mut send_failed = false;
                for frame in handler.subscription_frames(&pairs) {
                    if let Err(err) = write.send(frame).await {
                        warn!(provider = %handler.kind(), error = %err, "failed to send subscription");
                        send_failed = true;
                        break;
                    }
                }

                while !send_failed {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }
                        added = sub_rx.recv() => {
                            if let Some(added) = added {
                                let added: Vec<_> = added
                                    .into_iter()
                                    .filter(|p| !pairs.contains(p))
                                    .collect();
                                if added.is_empty() {
                                    continue;
                                }
                                // Record the pairs first: a failed amend
                                // is retried by the resubscribe on
                                // reconnect.
                                pairs.extend(added.iter().cloned());
                                let mut amend_failed = false;
                                for frame in handler.subscription_frames(&added) {
                                    if write.send(frame).await.is_err() {
                                        amend_failed = true;
                                        break;
                                    }
                                }
                                if amend_failed {
                                    break;
                                }
                            }
                        }
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(reply) = handler.on_text(text.as_str()) {
                                    let _ = write.send(reply).await;
                                }
                            }
                            Some(Ok(Message::Binary(payload))) => {
                                if let Some(text) = handler.decode_binary(&payload) {
                                    if let Some(reply) = handler.on_text(&text) {
                                        let _ = write.send(reply).await;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(_))) => {
                                warn!(provider = %handler.kind(), "websocket closed by server");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(provider = %handler.kind(), error = %err, "websocket read error");
                                break;
                            }
                            None => {
                                warn!(provider = %handler.kind(), "websocket stream ended");
                                break;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(provider = %handler.kind(), error = %err, "websocket connect failed");
            }
        }

        let delay = jitter(backoff);
        debug!(provider = %handler.kind(), delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

/// Apply ±20% jitter so a fleet of feeders doesn't reconnect in lockstep.
fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for _ in 0..100 {
            let d = jitter(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(8));
            assert!(d <= Duration::from_secs(12));
        }
    }
}
