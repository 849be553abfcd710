#![forbid(unsafe_code)]

// Media module - boundary to the media engine and per-peer handle bookkeeping.
// RTP/SRTP transport, ICE/DTLS and codec routing live behind `MediaEngine`.

pub mod inmemory;
pub mod resources;
pub mod types;

pub use inmemory::InMemoryEngine;
pub use resources::PeerResourceRegistry;
pub use types::{ConsumerInfo, MediaError, MediaKind, MediaResult, TransportDirection, TransportInfo};

use async_trait::async_trait;
use serde_json::Value;

/// Capability set consumed from the media engine.
///
/// Every call may suspend. Callers must not hold room or peer state locks
/// across these calls and must re-validate that state once they resume.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Router RTP capabilities handed to clients before they produce/consume
    async fn capabilities(&self) -> MediaResult<Value>;

    async fn create_transport(
        &self,
        peer_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportInfo>;

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()>;

    /// Returns the new producer handle
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<String>;

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerInfo>;

    async fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    /// Closes any handle. Closing an unknown or already-closed handle is a no-op.
    async fn close(&self, handle: &str);
}
