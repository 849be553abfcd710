#![forbid(unsafe_code)]

// Per-connection ledger of media engine handles (transports, producers, consumers)

use super::types::{ConsumerInfo, MediaKind, TransportDirection, TransportInfo};
use super::MediaEngine;
use crate::error::{SignalError, SignalResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct TransportEntry {
    id: String,
    direction: TransportDirection,
}

/// A consumer and the producer it reads from
#[derive(Debug, Clone)]
struct ConsumerEntry {
    id: String,
    producer_id: String,
}

/// Handles owned by one connection
#[derive(Debug, Clone, Default)]
pub struct PeerResources {
    transports: Vec<TransportEntry>,
    producers: Vec<String>,
    consumers: Vec<ConsumerEntry>,
}

impl PeerResources {
    pub fn producers(&self) -> &[String] {
        &self.producers
    }

    fn transport(&self, transport_id: &str) -> Option<&TransportEntry> {
        self.transports.iter().find(|t| t.id == transport_id)
    }

    /// Most recently created receive transport
    fn recv_transport(&self) -> Option<&TransportEntry> {
        self.transports
            .iter()
            .rev()
            .find(|t| t.direction == TransportDirection::Recv)
    }
}

/// Ownership ledger keeping the media engine free of leaked handles.
///
/// Holds no room knowledge. The outer map lock is never held across an engine
/// call: each operation reads what it needs, releases the lock, calls the
/// engine, then re-checks that the peer still exists before recording the
/// new handle. A handle created for a peer that disconnected meanwhile is
/// closed immediately.
pub struct PeerResourceRegistry {
    engine: Arc<dyn MediaEngine>,
    peers: StdRwLock<HashMap<String, PeerResources>>,
}

impl PeerResourceRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            peers: StdRwLock::new(HashMap::new()),
        }
    }

    /// Starts tracking a connection (idempotent)
    pub fn open(&self, peer_id: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.entry(peer_id.to_string()).or_default();
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.contains_key(peer_id)
    }

    /// Snapshot of a peer's handles
    pub fn resources(&self, peer_id: &str) -> Option<PeerResources> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(peer_id).cloned()
    }

    fn transport_owned_by(&self, peer_id: &str, transport_id: &str) -> SignalResult<TransportDirection> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .get(peer_id)
            .and_then(|p| p.transport(transport_id))
            .map(|t| t.direction)
            .ok_or_else(|| SignalError::TransportNotFound(format!("transport {transport_id}")))
    }

    /// Applies `record` to the peer's entry; false if the peer is gone.
    fn record<F>(&self, peer_id: &str, record: F) -> bool
    where
        F: FnOnce(&mut PeerResources),
    {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(peer_id) {
            Some(resources) => {
                record(resources);
                true
            }
            None => false,
        }
    }

    async fn discard(&self, peer_id: &str, handle: &str) -> SignalError {
        debug!("Peer {} disconnected during engine call, closing {}", peer_id, handle);
        self.engine.close(handle).await;
        SignalError::NotInRoom(format!("peer {peer_id} disconnected"))
    }

    pub async fn capabilities(&self) -> SignalResult<Value> {
        Ok(self.engine.capabilities().await?)
    }

    pub async fn create_transport(
        &self,
        peer_id: &str,
        direction: TransportDirection,
    ) -> SignalResult<TransportInfo> {
        if !self.contains(peer_id) {
            return Err(SignalError::NotInRoom(format!("peer {peer_id} disconnected")));
        }

        let info = self.engine.create_transport(peer_id, direction).await?;

        let entry = TransportEntry {
            id: info.id.clone(),
            direction,
        };
        if !self.record(peer_id, |r| r.transports.push(entry)) {
            return Err(self.discard(peer_id, &info.id).await);
        }

        info!("Created {} transport {} for peer {}", direction, info.id, peer_id);
        Ok(info)
    }

    pub async fn connect_transport(
        &self,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> SignalResult<()> {
        self.transport_owned_by(peer_id, transport_id)?;
        self.engine.connect_transport(transport_id, dtls_parameters).await?;
        debug!("Connected transport {} for peer {}", transport_id, peer_id);
        Ok(())
    }

    /// Creates a producer on one of the peer's transports and records it
    pub async fn produce(
        &self,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> SignalResult<String> {
        self.transport_owned_by(peer_id, transport_id)?;

        let producer_id = self.engine.produce(transport_id, kind, rtp_parameters).await?;

        let id = producer_id.clone();
        if !self.record(peer_id, |r| r.producers.push(id)) {
            return Err(self.discard(peer_id, &producer_id).await);
        }

        debug!("Created {:?} producer {} for peer {}", kind, producer_id, peer_id);
        Ok(producer_id)
    }

    /// Creates a consumer of `producer_id` on the peer's receive transport
    pub async fn consume(
        &self,
        peer_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> SignalResult<ConsumerInfo> {
        let transport_id = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers
                .get(peer_id)
                .and_then(PeerResources::recv_transport)
                .map(|t| t.id.clone())
                .ok_or_else(|| SignalError::TransportNotFound("no receive transport".to_string()))?
        };

        if !self.engine.can_consume(producer_id, &rtp_capabilities).await {
            return Err(SignalError::CannotConsume(producer_id.to_string()));
        }

        let consumer = self
            .engine
            .consume(&transport_id, producer_id, rtp_capabilities)
            .await?;

        let entry = ConsumerEntry {
            id: consumer.id.clone(),
            producer_id: producer_id.to_string(),
        };
        if !self.record(peer_id, |r| r.consumers.push(entry)) {
            return Err(self.discard(peer_id, &consumer.id).await);
        }

        debug!("Created consumer {} of {} for peer {}", consumer.id, producer_id, peer_id);
        Ok(consumer)
    }

    /// Closes one of the peer's producers
    pub async fn close_producer(&self, peer_id: &str, producer_id: &str) -> SignalResult<()> {
        let owned = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers
                .get_mut(peer_id)
                .map(|r| {
                    let before = r.producers.len();
                    r.producers.retain(|p| p != producer_id);
                    before != r.producers.len()
                })
                .unwrap_or(false)
        };
        if !owned {
            return Err(SignalError::TransportNotFound(format!("producer {producer_id}")));
        }

        self.engine.close(producer_id).await;
        self.close_consumers_of(&[producer_id.to_string()]).await;
        Ok(())
    }

    /// Closes every consumer, of any peer, reading from one of `producer_ids`
    async fn close_consumers_of(&self, producer_ids: &[String]) {
        if producer_ids.is_empty() {
            return;
        }

        let orphaned: Vec<String> = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            let mut orphaned = Vec::new();
            for resources in peers.values_mut() {
                resources.consumers.retain(|c| {
                    if producer_ids.contains(&c.producer_id) {
                        orphaned.push(c.id.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            orphaned
        };

        for consumer in &orphaned {
            self.engine.close(consumer).await;
        }
        if !orphaned.is_empty() {
            debug!("Closed {} consumers of closed producers", orphaned.len());
        }
    }

    /// Closes a handle that the caller obtained but could not keep
    pub async fn close_handle(&self, peer_id: &str, handle: &str) {
        self.record(peer_id, |r| {
            r.transports.retain(|t| t.id != handle);
            r.producers.retain(|p| p != handle);
            r.consumers.retain(|c| c.id != handle);
        });
        self.engine.close(handle).await;
    }

    /// Closes every handle owned by the peer, then forgets the peer.
    ///
    /// Consumers go first, then producers, then transports. Safe to call for
    /// an unknown peer.
    pub async fn release(&self, peer_id: &str) {
        let resources = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.remove(peer_id)
        };

        let Some(resources) = resources else {
            return;
        };

        for consumer in &resources.consumers {
            self.engine.close(&consumer.id).await;
        }
        for producer in &resources.producers {
            self.engine.close(producer).await;
        }
        self.close_consumers_of(&resources.producers).await;
        for transport in &resources.transports {
            self.engine.close(&transport.id).await;
        }

        let total = resources.consumers.len() + resources.producers.len() + resources.transports.len();
        if total > 0 {
            info!("Released {} media handles for peer {}", total, peer_id);
        }
    }

    /// Releases every tracked peer (shutdown)
    pub async fn release_all(&self) {
        let peer_ids: Vec<String> = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.keys().cloned().collect()
        };
        for peer_id in peer_ids {
            self.release(&peer_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::inmemory::{CodecCapability, InMemoryEngine};
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};

    fn setup() -> (Arc<InMemoryEngine>, PeerResourceRegistry) {
        let engine = Arc::new(
            InMemoryEngine::new(CodecCapability::defaults(), IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap(),
        );
        let registry = PeerResourceRegistry::new(engine.clone());
        (engine, registry)
    }

    fn vp8() -> Value {
        json!({ "codecs": [{ "mimeType": "video/VP8" }] })
    }

    #[tokio::test]
    async fn test_release_closes_every_handle() {
        let (engine, registry) = setup();
        registry.open("a");
        registry.open("b");

        let send = registry.create_transport("a", TransportDirection::Send).await.unwrap();
        let producer = registry.produce("a", &send.id, MediaKind::Video, vp8()).await.unwrap();
        registry.create_transport("b", TransportDirection::Recv).await.unwrap();
        registry.consume("b", &producer, vp8()).await.unwrap();
        assert_eq!(engine.open_handles(), 4);

        registry.release("b").await;
        assert_eq!(engine.open_handles(), 2);
        assert!(!registry.contains("b"));

        registry.release("a").await;
        assert_eq!(engine.open_handles(), 0);

        // Second release is a no-op
        registry.release("a").await;
    }

    #[tokio::test]
    async fn test_foreign_transport_is_not_found() {
        let (_engine, registry) = setup();
        registry.open("a");
        registry.open("b");
        let send = registry.create_transport("a", TransportDirection::Send).await.unwrap();

        let err = registry
            .produce("b", &send.id, MediaKind::Video, vp8())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::TransportNotFound(_)));

        let err = registry.connect_transport("b", &send.id, json!({})).await.unwrap_err();
        assert!(matches!(err, SignalError::TransportNotFound(_)));
    }

    #[tokio::test]
    async fn test_consume_without_recv_transport() {
        let (_engine, registry) = setup();
        registry.open("a");
        let err = registry.consume("a", "whatever", vp8()).await.unwrap_err();
        assert!(matches!(err, SignalError::TransportNotFound(_)));
    }

    #[tokio::test]
    async fn test_incompatible_capabilities_cannot_consume() {
        let (_engine, registry) = setup();
        registry.open("a");
        registry.open("b");
        let send = registry.create_transport("a", TransportDirection::Send).await.unwrap();
        let producer = registry.produce("a", &send.id, MediaKind::Video, vp8()).await.unwrap();
        registry.create_transport("b", TransportDirection::Recv).await.unwrap();

        let opus = json!({ "codecs": [{ "mimeType": "audio/opus" }] });
        let err = registry.consume("b", &producer, opus).await.unwrap_err();
        assert!(matches!(err, SignalError::CannotConsume(_)));
    }

    #[tokio::test]
    async fn test_engine_rejection_is_engine_failure() {
        let (_engine, registry) = setup();
        registry.open("a");
        let recv = registry.create_transport("a", TransportDirection::Recv).await.unwrap();
        let err = registry
            .produce("a", &recv.id, MediaKind::Video, vp8())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::EngineFailure(_)));
    }

    #[tokio::test]
    async fn test_unknown_peer_gets_no_transport() {
        let (engine, registry) = setup();
        let err = registry
            .create_transport("ghost", TransportDirection::Send)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::NotInRoom(_)));
        assert_eq!(engine.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_close_producer_requires_ownership() {
        let (engine, registry) = setup();
        registry.open("a");
        registry.open("b");
        let send = registry.create_transport("a", TransportDirection::Send).await.unwrap();
        let producer = registry.produce("a", &send.id, MediaKind::Video, vp8()).await.unwrap();

        assert!(registry.close_producer("b", &producer).await.is_err());
        registry.close_producer("a", &producer).await.unwrap();
        assert!(!engine.is_open(&producer));
        assert!(registry.resources("a").unwrap().producers().is_empty());
    }

    #[tokio::test]
    async fn test_close_producer_closes_its_consumers() {
        let (engine, registry) = setup();
        for peer in ["a", "b", "c"] {
            registry.open(peer);
        }
        let send = registry.create_transport("a", TransportDirection::Send).await.unwrap();
        let camera = registry.produce("a", &send.id, MediaKind::Video, vp8()).await.unwrap();
        let screen = registry.produce("a", &send.id, MediaKind::Video, vp8()).await.unwrap();
        registry.create_transport("b", TransportDirection::Recv).await.unwrap();
        registry.create_transport("c", TransportDirection::Recv).await.unwrap();
        let b_camera = registry.consume("b", &camera, vp8()).await.unwrap();
        let c_camera = registry.consume("c", &camera, vp8()).await.unwrap();
        let b_screen = registry.consume("b", &screen, vp8()).await.unwrap();

        registry.close_producer("a", &camera).await.unwrap();
        assert!(!engine.is_open(&b_camera.id));
        assert!(!engine.is_open(&c_camera.id));
        assert!(engine.is_open(&b_screen.id));

        // The consumer ledger no longer holds the closed ones
        registry.release("b").await;
        registry.release("c").await;
        assert!(!engine.is_open(&b_screen.id));
        assert_eq!(engine.open_handles(), 2);
    }

    #[tokio::test]
    async fn test_release_closes_consumers_of_other_peers() {
        let (engine, registry) = setup();
        registry.open("a");
        registry.open("b");
        let send = registry.create_transport("a", TransportDirection::Send).await.unwrap();
        let producer = registry.produce("a", &send.id, MediaKind::Video, vp8()).await.unwrap();
        let recv = registry.create_transport("b", TransportDirection::Recv).await.unwrap();
        let consumer = registry.consume("b", &producer, vp8()).await.unwrap();

        registry.release("a").await;
        assert!(!engine.is_open(&consumer.id));
        assert!(engine.is_open(&recv.id));
        assert_eq!(engine.open_handles(), 1);
        assert_eq!(registry.resources("b").unwrap().producers().len(), 0);
    }

    #[tokio::test]
    async fn test_close_handle_forgets_the_handle() {
        let (engine, registry) = setup();
        registry.open("b");
        let recv = registry.create_transport("b", TransportDirection::Recv).await.unwrap();

        registry.close_handle("b", &recv.id).await;
        assert!(!engine.is_open(&recv.id));
        assert!(registry.resources("b").unwrap().recv_transport().is_none());
        assert!(matches!(
            registry.consume("b", "p", vp8()).await,
            Err(SignalError::TransportNotFound(_))
        ));
    }
}
