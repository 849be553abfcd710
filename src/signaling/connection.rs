#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::gateway::SignalingGateway;
use super::protocol::ServerMessage;
use crate::error::ErrorKind;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
pub const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if no frame arrives within this duration
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket: burst capacity
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// 1 token in microseconds (integer math)
const TOKEN_US: u64 = 1_000_000;
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Token bucket limiting inbound requests per connection
struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: Instant::now(),
            warned: false,
        }
    }

    /// Takes one token. Returns `None` when allowed, `Some(first)` when
    /// limited, `first` being true only for the first rejection in a row.
    fn check(&mut self, now: Instant) -> Option<bool> {
        let elapsed_us = u64::try_from(now.duration_since(self.last_refill).as_micros()).unwrap_or(u64::MAX);
        self.last_refill = now;
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(RATE_LIMIT_REFILL_RATE))
            .min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            None
        } else {
            let first = !self.warned;
            self.warned = true;
            Some(first)
        }
    }
}

/// Handles a single WebSocket connection until it closes or idles out
pub async fn handle_connection(
    socket: WebSocket,
    gateway: SignalingGateway,
    _permit: OwnedSemaphorePermit,
) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", peer_id);

    let metrics = gateway.metrics().clone();
    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_peer = peer_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for peer: {}", send_peer);
    });

    gateway.connect(&peer_id, tx.clone());

    let mut limiter = RateLimiter::new();

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("WebSocket error for peer {}: {}", peer_id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for peer {}", peer_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                if let Some(first) = limiter.check(Instant::now()) {
                    if first {
                        warn!("Rate limit exceeded for peer {}", peer_id);
                        rate_limited(&tx);
                    }
                    continue;
                }

                gateway.dispatch(&peer_id, text.as_str()).await;

                // The send task exited, nobody is listening anymore
                if tx.is_closed() {
                    break;
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", peer_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                warn!("Unexpected binary frame from peer {}", peer_id);
            }
        }
    }

    gateway.disconnect(&peer_id).await;
    drop(tx);
    send_task.abort();
    info!("Connection closed: {}", peer_id);
}

fn rate_limited(tx: &mpsc::Sender<Arc<String>>) {
    let message = ServerMessage::Error {
        request: "unknown".to_string(),
        kind: ErrorKind::InvalidRequest,
        message: format!("Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"),
    };
    match serde_json::to_string(&message) {
        Ok(json) => {
            let _ = tx.try_send(Arc::new(json));
        }
        Err(e) => warn!("Failed to serialize rate limit error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_allows_burst_then_limits() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new();
        limiter.last_refill = start;

        for _ in 0..RATE_LIMIT_MAX_TOKENS {
            assert_eq!(limiter.check(start), None);
        }
        assert_eq!(limiter.check(start), Some(true));
        assert_eq!(limiter.check(start), Some(false));

        // 10ms refills one token at 100/s
        let later = start + Duration::from_millis(10);
        assert_eq!(limiter.check(later), None);
    }
}
