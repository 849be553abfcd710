#![forbid(unsafe_code)]

// In-process media engine. Issues handles and enforces the engine's structural
// rules (send/recv direction, codec compatibility) without moving any media.
// Used when no external engine is attached, and as the engine in tests.

use super::types::{ConsumerInfo, MediaError, MediaKind, MediaResult, TransportDirection, TransportInfo};
use super::MediaEngine;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex as StdMutex;
use tracing::{debug, info};
use uuid::Uuid;

/// One codec offered by the engine's router
#[derive(Debug, Clone)]
pub struct CodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    pub preferred_payload_type: u8,
}

impl CodecCapability {
    /// Opus, VP8, VP9 and H264, matching what browser clients negotiate by default
    pub fn defaults() -> Vec<CodecCapability> {
        vec![
            CodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                clock_rate: 48_000,
                channels: Some(2),
                preferred_payload_type: 111,
            },
            CodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                channels: None,
                preferred_payload_type: 96,
            },
            CodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP9".to_string(),
                clock_rate: 90_000,
                channels: None,
                preferred_payload_type: 98,
            },
            CodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/H264".to_string(),
                clock_rate: 90_000,
                channels: None,
                preferred_payload_type: 102,
            },
        ]
    }

    fn to_json(&self) -> Value {
        let mut codec = json!({
            "kind": self.kind,
            "mimeType": self.mime_type,
            "clockRate": self.clock_rate,
            "preferredPayloadType": self.preferred_payload_type,
        });
        if let (Some(channels), Some(obj)) = (self.channels, codec.as_object_mut()) {
            obj.insert("channels".to_string(), json!(channels));
        }
        codec
    }
}

enum Handle {
    Transport {
        direction: TransportDirection,
        connected: bool,
    },
    Producer {
        kind: MediaKind,
        mime_type: Option<String>,
        rtp_parameters: Value,
    },
    Consumer,
}

pub struct InMemoryEngine {
    codecs: Vec<CodecCapability>,
    announced_ip: IpAddr,
    handles: StdMutex<HashMap<String, Handle>>,
}

impl InMemoryEngine {
    /// Creates an engine serving `codecs`.
    ///
    /// # Errors
    /// Returns `MediaError::InitError` if the codec table is empty or contains
    /// a MIME type that does not match its kind.
    pub fn new(codecs: Vec<CodecCapability>, announced_ip: IpAddr) -> MediaResult<Self> {
        if codecs.is_empty() {
            return Err(MediaError::InitError("no codecs configured".to_string()));
        }
        if let Some(bad) = codecs
            .iter()
            .find(|c| !c.mime_type.to_ascii_lowercase().starts_with(c.kind.mime_prefix()))
        {
            return Err(MediaError::InitError(format!(
                "codec {} does not match kind {:?}",
                bad.mime_type, bad.kind
            )));
        }

        info!("In-memory media engine ready with {} codecs", codecs.len());
        Ok(Self {
            codecs,
            announced_ip,
            handles: StdMutex::new(HashMap::new()),
        })
    }

    /// Number of live (unclosed) handles of any type
    pub fn open_handles(&self) -> usize {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_open(&self, handle: &str) -> bool {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(handle)
    }

    fn supports(&self, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

/// MIME types listed under `codecs[].mimeType` of a capabilities/parameters object
fn listed_mime_types(value: &Value) -> Vec<String> {
    value
        .get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| {
            codecs
                .iter()
                .filter_map(|c| c.get("mimeType").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl MediaEngine for InMemoryEngine {
    async fn capabilities(&self) -> MediaResult<Value> {
        let codecs: Vec<Value> = self.codecs.iter().map(CodecCapability::to_json).collect();
        Ok(json!({ "codecs": codecs, "headerExtensions": [] }))
    }

    async fn create_transport(
        &self,
        peer_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportInfo> {
        let id = Uuid::new_v4().to_string();
        let params = json!({
            "iceParameters": {
                "usernameFragment": Uuid::new_v4().simple().to_string(),
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true,
            },
            "iceCandidates": [{
                "foundation": "udpcandidate",
                "priority": 1_076_302_079u32,
                "address": self.announced_ip.to_string(),
                "protocol": "udp",
                "type": "host",
            }],
            "dtlsParameters": {
                "role": "auto",
                "fingerprints": [],
            },
        });

        self.handles.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id.clone(),
            Handle::Transport {
                direction,
                connected: false,
            },
        );

        debug!("Created {} transport {} for peer {}", direction, id, peer_id);
        Ok(TransportInfo { id, direction, params })
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        if !dtls_parameters.is_object() {
            return Err(MediaError::TransportError(
                "dtlsParameters must be an object".to_string(),
            ));
        }

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        match handles.get_mut(transport_id) {
            Some(Handle::Transport { connected, .. }) => {
                if *connected {
                    return Err(MediaError::TransportError(format!(
                        "Transport {transport_id} already connected"
                    )));
                }
                *connected = true;
                Ok(())
            }
            _ => Err(MediaError::ResourceNotFound(transport_id.to_string())),
        }
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<String> {
        let mime_type = listed_mime_types(&rtp_parameters).into_iter().next();
        if let Some(mime) = &mime_type {
            if !mime.to_ascii_lowercase().starts_with(kind.mime_prefix()) || !self.supports(mime) {
                return Err(MediaError::ProducerError(format!("Unsupported codec {mime}")));
            }
        }

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        match handles.get(transport_id) {
            Some(Handle::Transport { direction: TransportDirection::Send, .. }) => {}
            Some(Handle::Transport { .. }) => {
                return Err(MediaError::ProducerError(format!(
                    "Transport {transport_id} is not a send transport"
                )));
            }
            _ => return Err(MediaError::ResourceNotFound(transport_id.to_string())),
        }

        let id = Uuid::new_v4().to_string();
        handles.insert(
            id.clone(),
            Handle::Producer {
                kind,
                mime_type,
                rtp_parameters,
            },
        );
        Ok(id)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerInfo> {
        if !self.can_consume(producer_id, &rtp_capabilities).await {
            return Err(MediaError::ConsumerError(format!(
                "Capabilities cannot consume producer {producer_id}"
            )));
        }

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        match handles.get(transport_id) {
            Some(Handle::Transport { direction: TransportDirection::Recv, .. }) => {}
            Some(Handle::Transport { .. }) => {
                return Err(MediaError::ConsumerError(format!(
                    "Transport {transport_id} is not a receive transport"
                )));
            }
            _ => return Err(MediaError::ResourceNotFound(transport_id.to_string())),
        }

        let (kind, rtp_parameters) = match handles.get(producer_id) {
            Some(Handle::Producer { kind, rtp_parameters, .. }) => (*kind, rtp_parameters.clone()),
            _ => return Err(MediaError::ResourceNotFound(producer_id.to_string())),
        };

        let id = Uuid::new_v4().to_string();
        handles.insert(id.clone(), Handle::Consumer);
        Ok(ConsumerInfo {
            id,
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters,
        })
    }

    async fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let (kind, producer_mime) = {
            let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            match handles.get(producer_id) {
                Some(Handle::Producer { kind, mime_type, .. }) => (*kind, mime_type.clone()),
                _ => return false,
            }
        };

        listed_mime_types(rtp_capabilities).iter().any(|mime| match &producer_mime {
            Some(wanted) => wanted.eq_ignore_ascii_case(mime),
            None => mime.to_ascii_lowercase().starts_with(kind.mime_prefix()) && self.supports(mime),
        })
    }

    async fn close(&self, handle: &str) {
        let removed = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(handle);
        if removed.is_some() {
            debug!("Closed media handle {}", handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn engine() -> InMemoryEngine {
        InMemoryEngine::new(CodecCapability::defaults(), IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap()
    }

    fn vp8_caps() -> Value {
        json!({ "codecs": [{ "mimeType": "video/VP8" }] })
    }

    #[test]
    fn test_empty_codec_table_fails_init() {
        let result = InMemoryEngine::new(vec![], IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(matches!(result, Err(MediaError::InitError(_))));
    }

    #[tokio::test]
    async fn test_produce_requires_send_transport() {
        let engine = engine();
        let recv = engine.create_transport("p1", TransportDirection::Recv).await.unwrap();
        let result = engine.produce(&recv.id, MediaKind::Video, vp8_caps()).await;
        assert!(matches!(result, Err(MediaError::ProducerError(_))));

        let send = engine.create_transport("p1", TransportDirection::Send).await.unwrap();
        assert!(engine.produce(&send.id, MediaKind::Video, vp8_caps()).await.is_ok());
    }

    #[tokio::test]
    async fn test_can_consume_checks_codecs() {
        let engine = engine();
        let send = engine.create_transport("p1", TransportDirection::Send).await.unwrap();
        let producer = engine.produce(&send.id, MediaKind::Video, vp8_caps()).await.unwrap();

        assert!(engine.can_consume(&producer, &vp8_caps()).await);
        let opus_only = json!({ "codecs": [{ "mimeType": "audio/opus" }] });
        assert!(!engine.can_consume(&producer, &opus_only).await);
        assert!(!engine.can_consume("missing", &vp8_caps()).await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let engine = engine();
        let t = engine.create_transport("p1", TransportDirection::Send).await.unwrap();
        assert_eq!(engine.open_handles(), 1);
        engine.close(&t.id).await;
        engine.close(&t.id).await;
        assert_eq!(engine.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let engine = engine();
        let t = engine.create_transport("p1", TransportDirection::Send).await.unwrap();
        engine.connect_transport(&t.id, json!({})).await.unwrap();
        assert!(engine.connect_transport(&t.id, json!({})).await.is_err());
    }
}
