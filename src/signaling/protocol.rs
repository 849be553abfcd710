#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::error::ErrorKind;
use crate::media::types::{MediaKind, TransportDirection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a room, creating it if the id is unseen. `reconnect_token` is the
    /// token from an earlier `welcome`, presented to resume that connection's
    /// ownership of a room in its grace period.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reconnect_token: Option<String>,
    },
    /// Admit a waiting peer (owner only)
    #[serde(rename_all = "camelCase")]
    ApproveJoin { target_id: String },
    /// Reject a waiting peer (owner only)
    #[serde(rename_all = "camelCase")]
    DenyJoin { target_id: String },
    /// Leave the current room
    LeaveRoom,
    /// Destroy the current room (owner only)
    CloseRoom,
    /// Get RTP capabilities of the media engine
    GetCapabilities,
    #[serde(rename_all = "camelCase")]
    CreateTransport { direction: TransportDirection },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
        /// Free-form label, e.g. "camera", "microphone", "screen"
        #[serde(default)]
        media_tag: String,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: String,
        rtp_capabilities: Value,
    },
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: String },
    #[serde(rename_all = "camelCase")]
    ChatSend { room_id: String, text: String },
    /// Grant or revoke a participant's chat permission (owner only)
    #[serde(rename_all = "camelCase")]
    ChatToggle { target_id: String, enabled: bool },
    #[serde(rename_all = "camelCase")]
    CodeGet { room_id: String },
    #[serde(rename_all = "camelCase")]
    CodeSet { room_id: String, text: String },
}

impl ClientMessage {
    /// Wire name of the request, echoed back in `error` events
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::ApproveJoin { .. } => "approve-join",
            ClientMessage::DenyJoin { .. } => "deny-join",
            ClientMessage::LeaveRoom => "leave-room",
            ClientMessage::CloseRoom => "close-room",
            ClientMessage::GetCapabilities => "get-capabilities",
            ClientMessage::CreateTransport { .. } => "create-transport",
            ClientMessage::ConnectTransport { .. } => "connect-transport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::CloseProducer { .. } => "close-producer",
            ClientMessage::ChatSend { .. } => "chat-send",
            ClientMessage::ChatToggle { .. } => "chat-toggle",
            ClientMessage::CodeGet { .. } => "code-get",
            ClientMessage::CodeSet { .. } => "code-set",
        }
    }
}

/// Role granted by `join-room`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinRole {
    /// Created (or reclaimed) the room
    Owner,
    /// Already an admitted participant
    Member,
    /// Waiting for the owner's approval
    Pending,
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Sent once after the WebSocket is accepted
    #[serde(rename_all = "camelCase")]
    Welcome { peer_id: String, reconnect_token: String },
    #[serde(rename_all = "camelCase")]
    Joined {
        room_id: String,
        role: JoinRole,
        wait_for_approval: bool,
    },
    #[serde(rename_all = "camelCase")]
    Left { room_id: String },
    /// Error response to a request
    Error {
        request: String,
        kind: ErrorKind,
        message: String,
    },
    /// A peer asks the owner for admission
    #[serde(rename_all = "camelCase")]
    JoinRequest { room_id: String, peer_id: String },
    /// Sent to the admitted peer with the room's current producers
    #[serde(rename_all = "camelCase")]
    JoinApproved {
        room_id: String,
        producers: Vec<ProducerSummary>,
    },
    #[serde(rename_all = "camelCase")]
    JoinDenied { room_id: String },
    #[serde(rename_all = "camelCase")]
    ParticipantJoined { peer_id: String },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        peer_id: String,
        producer_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    RoomClosed { room_id: String },
    #[serde(rename_all = "camelCase")]
    Capabilities { rtp_capabilities: Value },
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        transport_id: String,
        direction: TransportDirection,
        params: Value,
    },
    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: String },
    #[serde(rename_all = "camelCase")]
    Produced { producer_id: String },
    #[serde(rename_all = "camelCase")]
    Consumed {
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },
    /// New producer available from another participant
    #[serde(rename = "newProducer", rename_all = "camelCase")]
    NewProducer {
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
        media_tag: String,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { peer_id: String, producer_id: String },
    /// A "screen" producer was closed by its owner
    #[serde(rename_all = "camelCase")]
    ScreenStopped { peer_id: String, producer_id: String },
    #[serde(rename_all = "camelCase")]
    ChatRecv {
        room_id: String,
        peer_id: String,
        text: String,
    },
    /// The recipient's chat permission changed
    #[serde(rename_all = "camelCase")]
    ChatPerm { room_id: String, enabled: bool },
    #[serde(rename_all = "camelCase")]
    Code { room_id: String, text: String },
    #[serde(rename_all = "camelCase")]
    CodeUpdate {
        room_id: String,
        peer_id: String,
        text: String,
    },
}

/// Entry of the producer directory handed to newly admitted peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub peer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub media_tag: String,
}
