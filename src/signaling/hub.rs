#![forbid(unsafe_code)]

// Outbound delivery to connected peers

use super::protocol::ServerMessage;
use crate::metrics::ServerMetrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Maps connection ids to their outbound channel.
///
/// Every send is best-effort: a full or closed channel drops the frame for
/// that peer only and never blocks or fails a broadcast.
pub struct ConnectionHub {
    senders: StdRwLock<HashMap<String, mpsc::Sender<Arc<String>>>>,
    metrics: ServerMetrics,
}

impl ConnectionHub {
    pub fn new(metrics: ServerMetrics) -> Self {
        Self {
            senders: StdRwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn register(&self, peer_id: &str, sender: mpsc::Sender<Arc<String>>) {
        let mut senders = self.senders.write().unwrap_or_else(|e| e.into_inner());
        senders.insert(peer_id.to_string(), sender);
    }

    pub fn unregister(&self, peer_id: &str) {
        let mut senders = self.senders.write().unwrap_or_else(|e| e.into_inner());
        senders.remove(peer_id);
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        let senders = self.senders.read().unwrap_or_else(|e| e.into_inner());
        senders.get(peer_id).is_some_and(|s| !s.is_closed())
    }

    /// Send a message to a specific peer
    pub fn send_to(&self, peer_id: &str, message: &ServerMessage) {
        if let Some(json) = encode(message) {
            let senders = self.senders.read().unwrap_or_else(|e| e.into_inner());
            self.deliver(&senders, peer_id, json);
        }
    }

    /// Send one message to every listed peer
    pub fn broadcast<'a, I>(&self, peer_ids: I, message: &ServerMessage)
    where
        I: IntoIterator<Item = &'a String>,
    {
        let Some(json) = encode(message) else {
            return;
        };
        let senders = self.senders.read().unwrap_or_else(|e| e.into_inner());
        for peer_id in peer_ids {
            self.deliver(&senders, peer_id, json.clone());
        }
    }

    /// Send to every listed peer except `except`
    pub fn broadcast_except<'a, I>(&self, peer_ids: I, except: &str, message: &ServerMessage)
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.broadcast(peer_ids.into_iter().filter(|id| id.as_str() != except), message);
    }

    fn deliver(
        &self,
        senders: &HashMap<String, mpsc::Sender<Arc<String>>>,
        peer_id: &str,
        json: Arc<String>,
    ) {
        let Some(sender) = senders.get(peer_id) else {
            debug!("No connection for peer {}, dropping message", peer_id);
            return;
        };
        match sender.try_send(json) {
            Ok(()) => self.metrics.inc_messages_sent(),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for peer {}, dropping message", peer_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for peer {} (disconnected)", peer_id);
            }
        }
    }
}

/// Serialize once so a broadcast shares one allocation across recipients
fn encode(message: &ServerMessage) -> Option<Arc<String>> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!("Failed to serialize message: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_survives_closed_peer() {
        let hub = ConnectionHub::new(ServerMetrics::new());
        let (tx_a, rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.register("a", tx_a);
        hub.register("b", tx_b);
        drop(rx_a);

        let peers = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        hub.broadcast(&peers, &ServerMessage::RoomClosed { room_id: "r".into() });

        let frame = rx_b.try_recv().unwrap();
        assert!(frame.contains("room-closed"));
        assert!(!hub.is_connected("a"));
    }

    #[test]
    fn test_broadcast_except_skips_sender() {
        let hub = ConnectionHub::new(ServerMetrics::new());
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.register("a", tx_a);
        hub.register("b", tx_b);

        let peers = vec!["a".to_string(), "b".to_string()];
        hub.broadcast_except(&peers, "a", &ServerMessage::Left { room_id: "r".into() });

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }
}
