#![forbid(unsafe_code)]

// Signaling gateway - routes client requests to the room and media registries

use super::hub::ConnectionHub;
use super::protocol::{ClientMessage, JoinRole, ServerMessage};
use crate::error::{SignalError, SignalResult};
use crate::media::PeerResourceRegistry;
use crate::metrics::ServerMetrics;
use crate::room::{Departed, Departure, JoinCredentials, RoomRegistry};
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest accepted room id, in bytes
pub const MAX_ROOM_ID_LEN: usize = 128;
/// Longest accepted chat message, in bytes
pub const MAX_CHAT_LEN: usize = 4096;

/// Per-request entry point shared by every connection.
///
/// Requests from one connection are handled one at a time, in arrival order.
/// Replies go only to the requester; everything else is delivered through
/// the hub by the registries.
#[derive(Clone)]
pub struct SignalingGateway {
    rooms: Arc<RoomRegistry>,
    resources: Arc<PeerResourceRegistry>,
    hub: Arc<ConnectionHub>,
    metrics: ServerMetrics,
    /// peer id → reconnect token handed out in `welcome`
    sessions: Arc<StdRwLock<HashMap<String, String>>>,
}

impl SignalingGateway {
    pub fn new(
        rooms: Arc<RoomRegistry>,
        resources: Arc<PeerResourceRegistry>,
        hub: Arc<ConnectionHub>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            rooms,
            resources,
            hub,
            metrics,
            sessions: Arc::new(StdRwLock::new(HashMap::new())),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Registers a new connection and greets it with its peer id and the
    /// token a later connection can present to resume its room ownership
    pub fn connect(&self, peer_id: &str, sender: mpsc::Sender<Arc<String>>) {
        let token = Uuid::new_v4().to_string();
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id.to_string(), token.clone());
        self.hub.register(peer_id, sender);
        self.resources.open(peer_id);
        self.reply(
            peer_id,
            ServerMessage::Welcome {
                peer_id: peer_id.to_string(),
                reconnect_token: token,
            },
        );
        debug!("Peer {} connected", peer_id);
    }

    /// Tears down everything the connection owned.
    ///
    /// An owner's room enters its grace period; anyone else leaves their room
    /// immediately. Media handles are released in both cases.
    pub async fn disconnect(&self, peer_id: &str) {
        self.hub.unregister(peer_id);
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id);
        match self.rooms.depart(peer_id, Departure::Disconnected).await {
            Some(Departed::GraceStarted(room_id)) => {
                debug!("Owner {} of room {} gone, grace period running", peer_id, room_id);
            }
            Some(Departed::Left(room_id)) | Some(Departed::Closed(room_id)) => {
                debug!("Peer {} removed from room {} on disconnect", peer_id, room_id);
            }
            None => {}
        }
        self.resources.release(peer_id).await;
        info!("Peer {} disconnected", peer_id);
    }

    /// Parses and handles one text frame, answering failures with an `error` event
    pub async fn dispatch(&self, peer_id: &str, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Invalid message format from {}: {}", peer_id, e);
                self.metrics.inc_errors();
                let request = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                let error = SignalError::InvalidRequest(format!("malformed message: {e}"));
                self.reply_error(peer_id, &request, &error);
                return;
            }
        };

        let request = message.name();
        let start = Instant::now();
        let result = self.handle(peer_id, message).await;
        self.metrics.observe_message_handling(start.elapsed());

        if let Err(e) = result {
            debug!("{} from {} failed: {}", request, peer_id, e);
            self.metrics.inc_errors();
            self.reply_error(peer_id, request, &e);
        }
    }

    /// Handles one request. Successful requests may or may not produce a reply.
    pub async fn handle(&self, peer_id: &str, message: ClientMessage) -> SignalResult<()> {
        match message {
            ClientMessage::JoinRoom {
                room_id,
                reconnect_token,
            } => self.join_room(peer_id, room_id, reconnect_token).await,

            ClientMessage::ApproveJoin { target_id } => {
                self.rooms.approve(peer_id, &target_id)?;
                Ok(())
            }

            ClientMessage::DenyJoin { target_id } => {
                self.rooms.deny(peer_id, &target_id)?;
                Ok(())
            }

            ClientMessage::LeaveRoom => {
                let room_id = match self.rooms.depart(peer_id, Departure::Left).await {
                    Some(Departed::Left(room_id))
                    | Some(Departed::Closed(room_id))
                    | Some(Departed::GraceStarted(room_id)) => room_id,
                    None => return Err(SignalError::not_in_room(peer_id)),
                };
                self.reset_media(peer_id).await;
                self.reply(peer_id, ServerMessage::Left { room_id });
                Ok(())
            }

            ClientMessage::CloseRoom => {
                // The owner is a participant, so it receives room-closed with everyone else
                self.rooms.close(peer_id).await?;
                self.reset_media(peer_id).await;
                Ok(())
            }

            ClientMessage::GetCapabilities => {
                let rtp_capabilities = self.resources.capabilities().await?;
                self.reply(peer_id, ServerMessage::Capabilities { rtp_capabilities });
                Ok(())
            }

            ClientMessage::CreateTransport { direction } => {
                let room_id = self.rooms.require_participant(peer_id)?;
                let transport = self.resources.create_transport(peer_id, direction).await?;

                if !self.still_in(peer_id, &room_id) {
                    self.resources.close_handle(peer_id, &transport.id).await;
                    return Err(SignalError::not_in_room(peer_id));
                }

                self.reply(
                    peer_id,
                    ServerMessage::TransportCreated {
                        transport_id: transport.id,
                        direction: transport.direction,
                        params: transport.params,
                    },
                );
                Ok(())
            }

            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.rooms.require_participant(peer_id)?;
                self.resources
                    .connect_transport(peer_id, &transport_id, dtls_parameters)
                    .await?;
                self.reply(peer_id, ServerMessage::TransportConnected { transport_id });
                Ok(())
            }

            ClientMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
                media_tag,
            } => {
                self.rooms.require_participant(peer_id)?;
                let producer_id = self
                    .resources
                    .produce(peer_id, &transport_id, kind, rtp_parameters)
                    .await?;

                // Membership may have changed while the engine call was in flight
                if let Err(e) = self.rooms.register_producer(peer_id, &producer_id, kind, &media_tag) {
                    if let Err(close_err) = self.resources.close_producer(peer_id, &producer_id).await {
                        debug!("Producer {} already gone: {}", producer_id, close_err);
                    }
                    return Err(e);
                }

                self.reply(peer_id, ServerMessage::Produced { producer_id });
                Ok(())
            }

            ClientMessage::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                let room_id = self.rooms.require_participant(peer_id)?;
                if self.rooms.producer(&room_id, &producer_id).is_none() {
                    return Err(SignalError::TransportNotFound(format!("producer {producer_id}")));
                }

                let consumer = self
                    .resources
                    .consume(peer_id, &producer_id, rtp_capabilities)
                    .await?;

                if !self.still_in(peer_id, &room_id) {
                    self.resources.close_handle(peer_id, &consumer.id).await;
                    return Err(SignalError::not_in_room(peer_id));
                }
                if self.rooms.producer(&room_id, &producer_id).is_none() {
                    self.resources.close_handle(peer_id, &consumer.id).await;
                    return Err(SignalError::TransportNotFound(format!("producer {producer_id}")));
                }

                self.metrics.inc_consumers_created();
                self.reply(
                    peer_id,
                    ServerMessage::Consumed {
                        consumer_id: consumer.id,
                        producer_id: consumer.producer_id,
                        kind: consumer.kind,
                        rtp_parameters: consumer.rtp_parameters,
                    },
                );
                Ok(())
            }

            ClientMessage::CloseProducer { producer_id } => {
                self.rooms.remove_producer(peer_id, &producer_id)?;
                self.resources.close_producer(peer_id, &producer_id).await
            }

            ClientMessage::ChatSend { room_id, text } => {
                if text.len() > MAX_CHAT_LEN {
                    return Err(SignalError::InvalidRequest(format!(
                        "chat message longer than {MAX_CHAT_LEN} bytes"
                    )));
                }
                self.rooms.chat(peer_id, &room_id, &text)?;
                Ok(())
            }

            ClientMessage::ChatToggle { target_id, enabled } => {
                self.rooms.set_mute(peer_id, &target_id, !enabled)
            }

            ClientMessage::CodeGet { room_id } => {
                let text = self.rooms.code(peer_id, &room_id)?;
                self.reply(peer_id, ServerMessage::Code { room_id, text });
                Ok(())
            }

            ClientMessage::CodeSet { room_id, text } => self.rooms.set_code(peer_id, &room_id, &text),
        }
    }

    async fn join_room(
        &self,
        peer_id: &str,
        room_id: String,
        reconnect_token: Option<String>,
    ) -> SignalResult<()> {
        if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
            return Err(SignalError::InvalidRequest(format!(
                "room id must be 1 to {MAX_ROOM_ID_LEN} bytes"
            )));
        }

        let credentials = JoinCredentials {
            session_token: self
                .sessions
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(peer_id)
                .cloned(),
            reconnect_token,
        };

        let previous = self.rooms.room_id_of(peer_id);
        let outcome = self.rooms.create_or_join(&room_id, peer_id, &credentials).await?;

        // Switching rooms drops the media of the previous one
        if previous.as_deref().is_some_and(|current| current != room_id) {
            self.reset_media(peer_id).await;
        }

        let role = outcome.role;
        self.reply(
            peer_id,
            ServerMessage::Joined {
                room_id: room_id.clone(),
                role,
                wait_for_approval: role == JoinRole::Pending,
            },
        );

        // A reclaiming owner inherits the queue; ask again so nothing is lost
        for waiting in outcome.pending {
            self.reply(
                peer_id,
                ServerMessage::JoinRequest {
                    room_id: room_id.clone(),
                    peer_id: waiting,
                },
            );
        }
        Ok(())
    }

    fn still_in(&self, peer_id: &str, room_id: &str) -> bool {
        self.rooms
            .require_participant(peer_id)
            .is_ok_and(|current| current == room_id)
    }

    /// Closes the peer's media handles while keeping the connection tracked
    async fn reset_media(&self, peer_id: &str) {
        self.resources.release(peer_id).await;
        if self.hub.is_connected(peer_id) {
            self.resources.open(peer_id);
        }
    }

    fn reply(&self, peer_id: &str, message: ServerMessage) {
        self.hub.send_to(peer_id, &message);
    }

    fn reply_error(&self, peer_id: &str, request: &str, error: &SignalError) {
        self.reply(
            peer_id,
            ServerMessage::Error {
                request: request.to_string(),
                kind: error.kind(),
                message: error.to_string(),
            },
        );
    }

    /// Closes every room and releases every media handle
    pub async fn shutdown(&self) {
        self.rooms.shutdown().await;
        self.resources.release_all().await;
        info!("Signaling gateway shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::media::inmemory::{CodecCapability, InMemoryEngine};
    use crate::media::{
        ConsumerInfo, MediaEngine, MediaKind, MediaResult, TransportDirection, TransportInfo,
    };
    use crate::room::names::InMemoryNameReservation;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Fixture {
        gateway: SignalingGateway,
        engine: Arc<InMemoryEngine>,
    }

    fn in_memory_engine() -> Arc<InMemoryEngine> {
        Arc::new(InMemoryEngine::new(CodecCapability::defaults(), IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap())
    }

    fn fixture() -> Fixture {
        let engine = in_memory_engine();
        fixture_with(engine.clone(), engine)
    }

    /// `engine` serves the gateway; `handles` is the engine whose open handles are counted
    fn fixture_with(engine: Arc<dyn MediaEngine>, handles: Arc<InMemoryEngine>) -> Fixture {
        let metrics = ServerMetrics::new();
        let hub = Arc::new(ConnectionHub::new(metrics.clone()));
        let rooms = Arc::new(RoomRegistry::new(
            Arc::new(InMemoryNameReservation::new()),
            "test".to_string(),
            Duration::from_secs(30),
            hub.clone(),
            metrics.clone(),
        ));
        let resources = Arc::new(PeerResourceRegistry::new(engine));
        Fixture {
            gateway: SignalingGateway::new(rooms, resources, hub, metrics),
            engine: handles,
        }
    }

    /// Parks the first produce or transport call it is told to, after the
    /// handle exists, until resumed
    struct StallingEngine {
        inner: Arc<InMemoryEngine>,
        stall_produce: AtomicBool,
        stall_transport: AtomicBool,
        entered: Notify,
        resume: Notify,
    }

    impl StallingEngine {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: in_memory_engine(),
                stall_produce: AtomicBool::new(false),
                stall_transport: AtomicBool::new(false),
                entered: Notify::new(),
                resume: Notify::new(),
            })
        }

        async fn hold(&self, flag: &AtomicBool) {
            if flag.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.resume.notified().await;
            }
        }
    }

    #[async_trait]
    impl MediaEngine for StallingEngine {
        async fn capabilities(&self) -> MediaResult<Value> {
            self.inner.capabilities().await
        }

        async fn create_transport(
            &self,
            peer_id: &str,
            direction: TransportDirection,
        ) -> MediaResult<TransportInfo> {
            let transport = self.inner.create_transport(peer_id, direction).await?;
            self.hold(&self.stall_transport).await;
            Ok(transport)
        }

        async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
            self.inner.connect_transport(transport_id, dtls_parameters).await
        }

        async fn produce(
            &self,
            transport_id: &str,
            kind: MediaKind,
            rtp_parameters: Value,
        ) -> MediaResult<String> {
            let producer_id = self.inner.produce(transport_id, kind, rtp_parameters).await?;
            self.hold(&self.stall_produce).await;
            Ok(producer_id)
        }

        async fn consume(
            &self,
            transport_id: &str,
            producer_id: &str,
            rtp_capabilities: Value,
        ) -> MediaResult<ConsumerInfo> {
            self.inner.consume(transport_id, producer_id, rtp_capabilities).await
        }

        async fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
            self.inner.can_consume(producer_id, rtp_capabilities).await
        }

        async fn close(&self, handle: &str) {
            self.inner.close(handle).await
        }
    }

    /// Owner `a` and admitted member `b` in room r1, with every event drained
    async fn owner_and_member(
        gateway: &SignalingGateway,
    ) -> (mpsc::Receiver<Arc<String>>, mpsc::Receiver<Arc<String>>) {
        let mut a = connect(gateway, "a");
        let mut b = connect(gateway, "b");
        send(gateway, "a", json!({ "type": "join-room", "roomId": "r1" })).await;
        send(gateway, "b", json!({ "type": "join-room", "roomId": "r1" })).await;
        send(gateway, "a", json!({ "type": "approve-join", "targetId": "b" })).await;
        drain(&mut a);
        drain(&mut b);
        (a, b)
    }

    fn connect(gateway: &SignalingGateway, peer_id: &str) -> mpsc::Receiver<Arc<String>> {
        let (tx, mut rx) = mpsc::channel(64);
        gateway.connect(peer_id, tx);
        let welcome: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(welcome["type"], "welcome");
        rx
    }

    fn next(rx: &mut mpsc::Receiver<Arc<String>>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(serde_json::from_str(&frame).unwrap());
        }
        events
    }

    async fn send(gateway: &SignalingGateway, peer_id: &str, message: Value) {
        gateway.dispatch(peer_id, &message.to_string()).await;
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_invalid_request() {
        let f = fixture();
        let mut a = connect(&f.gateway, "a");

        f.gateway.dispatch("a", "{not json").await;
        let error = next(&mut a);
        assert_eq!(error["type"], "error");
        assert_eq!(error["request"], "unknown");
        assert_eq!(error["kind"], "InvalidRequest");

        send(&f.gateway, "a", json!({ "type": "join-room" })).await;
        let error = next(&mut a);
        assert_eq!(error["request"], "join-room");
        assert_eq!(error["kind"], "InvalidRequest");
    }

    #[tokio::test]
    async fn test_room_id_length_is_checked() {
        let f = fixture();
        let mut a = connect(&f.gateway, "a");

        send(&f.gateway, "a", json!({ "type": "join-room", "roomId": "" })).await;
        assert_eq!(next(&mut a)["kind"], "InvalidRequest");

        let long = "x".repeat(MAX_ROOM_ID_LEN + 1);
        send(&f.gateway, "a", json!({ "type": "join-room", "roomId": long })).await;
        assert_eq!(next(&mut a)["kind"], "InvalidRequest");
        assert_eq!(f.gateway.rooms().room_count(), 0);
    }

    #[tokio::test]
    async fn test_waiting_peer_cannot_create_transport() {
        let f = fixture();
        let _a = connect(&f.gateway, "a");
        let mut b = connect(&f.gateway, "b");

        send(&f.gateway, "a", json!({ "type": "join-room", "roomId": "r1" })).await;
        send(&f.gateway, "b", json!({ "type": "join-room", "roomId": "r1" })).await;
        let joined = next(&mut b);
        assert_eq!(joined["role"], "pending");
        assert_eq!(joined["waitForApproval"], true);

        send(&f.gateway, "b", json!({ "type": "create-transport", "direction": "send" })).await;
        let error = next(&mut b);
        assert_eq!(error["kind"], "NotInRoom");
        assert_eq!(f.engine.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_produce_on_foreign_transport_is_rejected() {
        let f = fixture();
        let mut a = connect(&f.gateway, "a");
        send(&f.gateway, "a", json!({ "type": "join-room", "roomId": "r1" })).await;
        next(&mut a);

        send(&f.gateway, "a", json!({
            "type": "produce",
            "transportId": "not-mine",
            "kind": "audio",
            "rtpParameters": { "codecs": [{ "mimeType": "audio/opus" }] },
        }))
        .await;
        assert_eq!(next(&mut a)["kind"], "TransportNotFound");
    }

    #[tokio::test]
    async fn test_disconnect_releases_media_handles() {
        let f = fixture();
        let mut a = connect(&f.gateway, "a");
        send(&f.gateway, "a", json!({ "type": "join-room", "roomId": "r1" })).await;
        next(&mut a);

        send(&f.gateway, "a", json!({ "type": "create-transport", "direction": "send" })).await;
        let created = next(&mut a);
        assert_eq!(created["type"], "transport-created");
        let transport_id = created["transportId"].as_str().unwrap().to_string();

        send(&f.gateway, "a", json!({
            "type": "produce",
            "transportId": transport_id,
            "kind": "video",
            "rtpParameters": { "codecs": [{ "mimeType": "video/VP8" }] },
            "mediaTag": "camera",
        }))
        .await;
        assert_eq!(next(&mut a)["type"], "produced");
        assert_eq!(f.engine.open_handles(), 2);

        f.gateway.disconnect("a").await;
        assert_eq!(f.engine.open_handles(), 0);
        assert!(f.gateway.rooms().snapshot("r1").unwrap().in_grace_period);
    }

    #[tokio::test]
    async fn test_chat_length_limit() {
        let f = fixture();
        let mut a = connect(&f.gateway, "a");
        send(&f.gateway, "a", json!({ "type": "join-room", "roomId": "r1" })).await;
        next(&mut a);

        let long = "y".repeat(MAX_CHAT_LEN + 1);
        send(&f.gateway, "a", json!({ "type": "chat-send", "roomId": "r1", "text": long })).await;
        let error = next(&mut a);
        assert_eq!(error["request"], "chat-send");
        assert_eq!(error["kind"], "InvalidRequest");
    }

    #[tokio::test]
    async fn test_leave_without_room_is_not_in_room() {
        let f = fixture();
        let mut a = connect(&f.gateway, "a");
        let err = f.gateway.handle("a", ClientMessage::LeaveRoom).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInRoom);
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_capabilities_reply() {
        let f = fixture();
        let mut a = connect(&f.gateway, "a");
        send(&f.gateway, "a", json!({ "type": "get-capabilities" })).await;
        let reply = next(&mut a);
        assert_eq!(reply["type"], "capabilities");
        assert!(reply["rtpCapabilities"]["codecs"].as_array().is_some_and(|c| !c.is_empty()));
    }

    #[tokio::test]
    async fn test_disconnect_during_produce_closes_late_producer() {
        let engine = StallingEngine::new();
        let f = fixture_with(engine.clone(), engine.inner.clone());
        let (mut a, mut b) = owner_and_member(&f.gateway).await;

        send(&f.gateway, "b", json!({ "type": "create-transport", "direction": "send" })).await;
        let transport_id = next(&mut b)["transportId"].as_str().unwrap().to_string();

        engine.stall_produce.store(true, Ordering::SeqCst);
        let gateway = f.gateway.clone();
        let request = tokio::spawn(async move {
            gateway
                .handle(
                    "b",
                    ClientMessage::Produce {
                        transport_id,
                        kind: MediaKind::Video,
                        rtp_parameters: json!({ "codecs": [{ "mimeType": "video/VP8" }] }),
                        media_tag: "camera".to_string(),
                    },
                )
                .await
        });

        engine.entered.notified().await;
        f.gateway.disconnect("b").await;
        engine.resume.notify_one();

        let err = request.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInRoom);
        assert_eq!(f.engine.open_handles(), 0);
        assert!(f.gateway.rooms().snapshot("r1").unwrap().producers.is_empty());
        assert!(drain(&mut a).iter().all(|e| e["type"] != "newProducer"));
    }

    #[tokio::test]
    async fn test_room_closed_during_transport_creation_closes_transport() {
        let engine = StallingEngine::new();
        let f = fixture_with(engine.clone(), engine.inner.clone());
        let (_a, mut b) = owner_and_member(&f.gateway).await;

        engine.stall_transport.store(true, Ordering::SeqCst);
        let gateway = f.gateway.clone();
        let request = tokio::spawn(async move {
            gateway
                .handle(
                    "b",
                    ClientMessage::CreateTransport {
                        direction: TransportDirection::Send,
                    },
                )
                .await
        });

        engine.entered.notified().await;
        send(&f.gateway, "a", json!({ "type": "close-room" })).await;
        engine.resume.notify_one();

        let err = request.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInRoom);
        assert_eq!(f.engine.open_handles(), 0);
        let seen: Vec<Value> = drain(&mut b);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["type"], "room-closed");

        // b is still connected and tracked
        assert!(f.gateway.resources.contains("b"));
    }
}
