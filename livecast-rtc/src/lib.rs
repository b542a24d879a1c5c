//! `LiveCast` realtime peer connections
//!
//! Live broadcasts between two peers, negotiated through the realtime store.
//!
//! ## Architecture
//!
//! - **`PeerTransport`**: one two-party media connection (`WebRtcTransport`
//!   in production)
//! - **`LiveConnection`**: wraps a transport and runs the offer/answer and
//!   candidate exchange for one role in one session
//! - **`Broadcast`**: registers a live session, acquires media and streams it;
//!   `stop_streaming` cleans up everything
//! - **`MediaSource`**: produces the `LocalStream` to broadcast
//!   (`SampleSource` for encoded frames supplied by the application)
//! - **`MediaFiles`**: plays IVF (VP8) and Ogg (Opus) files into local tracks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livecast_rtc::{Broadcast, MediaConstraints, MediaFiles, SampleSource, WebRtcTransport};
//!
//! let transport = WebRtcTransport::new(&config.webrtc).await?;
//! let broadcast = Broadcast::go_live(
//!     registry,
//!     transport,
//!     &identity,
//!     GoLiveRequest::public(),
//!     &SampleSource::default(),
//!     &MediaConstraints::default(),
//! )
//! .await?;
//!
//! let media = MediaFiles::load(Some(Path::new("video.ivf")), None).await?;
//! let cancel = CancellationToken::new();
//! if let Some(stream) = broadcast.connection().local_stream() {
//!     media.spawn(&stream, true, &cancel);
//! }
//!
//! broadcast.stop_streaming().await?;
//! ```

mod broadcast;
mod connection;
mod feed;
mod media;
mod transport;
mod webrtc_transport;

pub use broadcast::{watch_live, Broadcast};
pub use connection::{LiveConnection, RemoteStreamCallback};
pub use feed::{join_playback, play_ivf, play_ogg, MediaFiles};
pub use media::{
    LocalStream, LocalTrack, MediaConstraints, MediaSource, RemoteStream, RemoteTrack,
    SampleSource, TrackKind,
};
pub use transport::{PeerConnectionState, PeerTransport, TransportEvent};
pub use webrtc_transport::{ice_servers, WebRtcTransport};
