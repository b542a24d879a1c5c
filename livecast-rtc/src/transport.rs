//! Peer transport abstraction
//!
//! [`LiveConnection`](crate::LiveConnection) drives negotiation through this
//! trait; [`WebRtcTransport`](crate::WebRtcTransport) implements it on top of
//! the `webrtc` crate.

use async_trait::async_trait;
use livecast_core::{
    models::{IceCandidate, SessionDescription},
    Result,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::media::{LocalTrack, RemoteTrack};

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Whether the connection can no longer carry media
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl std::fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Event raised by the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Local ICE candidate discovered
    IceCandidate(IceCandidate),
    /// Inbound track negotiated
    Track(RemoteTrack),
    StateChanged(PeerConnectionState),
}

/// Two-party media connection
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Take the event receiver (can only be called once)
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}
