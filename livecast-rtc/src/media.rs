//! Local and remote media streams
//!
//! This module handles:
//! - Track kinds and the encoded-sample local tracks fed to the peer connection
//! - Exclusive acquisition of a capture source and its release on stop
//! - Aggregation of inbound tracks into one remote stream

use async_trait::async_trait;
use bytes::Bytes;
use livecast_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info};
use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    media::Sample,
    rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// Which kinds of media to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

/// Outbound track carrying encoded samples
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Create a VP8 (video) or Opus (audio) sample track
    #[must_use]
    pub fn new(kind: TrackKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let mime_type = match kind {
            TrackKind::Video => MIME_TYPE_VP8,
            TrackKind::Audio => MIME_TYPE_OPUS,
        };
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.into(),
            stream_id.into(),
        );
        Self {
            kind,
            track: Arc::new(track),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.track.id()
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        self.track.stream_id()
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Underlying track handed to the peer connection
    #[must_use]
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    /// Write one encoded frame lasting `duration`
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::InvalidState(format!("Track {} is stopped", self.id())));
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!(track_id = %self.id(), kind = %self.kind, "Local track stopped");
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Set of local tracks captured together
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
    /// Capture lease released on stop
    lease: Option<Arc<AtomicBool>>,
    /// Set by the first `stop` of this stream or any of its clones
    released: Arc<AtomicBool>,
}

impl LocalStream {
    #[must_use]
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
            lease: None,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Stop every track and release the capture source
    ///
    /// Only the first call releases the source, so stopping a stale stream
    /// again cannot free a source that a newer stream holds.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(lease) = &self.lease {
            lease.store(false, Ordering::SeqCst);
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_stopped)
    }
}

/// Provider of local media
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire a stream; fails with `Error::MediaAccess` when the source
    /// cannot satisfy the constraints
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream>;
}

/// Source of VP8/Opus sample tracks that the application feeds with
/// encoded frames
///
/// Only one stream may be held at a time; stopping it frees the source.
#[derive(Debug, Clone)]
pub struct SampleSource {
    label: String,
    in_use: Arc<AtomicBool>,
}

impl SampleSource {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }
}

impl Default for SampleSource {
    fn default() -> Self {
        Self::new("livecast")
    }
}

#[async_trait]
impl MediaSource for SampleSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream> {
        if !constraints.video && !constraints.audio {
            return Err(Error::MediaAccess(
                "At least one of video or audio must be requested".to_string(),
            ));
        }
        if self.in_use.swap(true, Ordering::SeqCst) {
            return Err(Error::MediaAccess(format!(
                "Media source {} is already in use",
                self.label
            )));
        }

        let stream_id = format!("{}-{}", self.label, nanoid::nanoid!(8));
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video, format!("{stream_id}-video"), &stream_id));
        }
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, format!("{stream_id}-audio"), &stream_id));
        }

        info!(stream_id = %stream_id, tracks = tracks.len(), "Local media acquired");

        Ok(LocalStream {
            id: stream_id,
            tracks,
            lease: Some(Arc::clone(&self.in_use)),
            released: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Inbound track
#[derive(Clone)]
pub struct RemoteTrack {
    id: String,
    stream_id: String,
    kind: TrackKind,
    inner: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            inner: None,
        }
    }

    #[must_use]
    pub fn from_rtc(track: Arc<TrackRemote>) -> Self {
        Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind: track.kind().into(),
            inner: Some(track),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Underlying track to read RTP from, when backed by a real connection
    #[must_use]
    pub fn rtc_track(&self) -> Option<Arc<TrackRemote>> {
        self.inner.clone()
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// All inbound tracks of a connection, aggregated as one stream
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Add a track; returns `false` if a track with the same id is present
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    #[must_use]
    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
