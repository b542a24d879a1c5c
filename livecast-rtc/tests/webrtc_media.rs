//! Broadcaster and viewer on real `webrtc` peer connections, signaling over
//! the in-memory store, with a video file played into the broadcast.
//!
//! Host candidates only: the machine needs a non-loopback interface.
//!
//! Run with: cargo test -p livecast-rtc --test webrtc_media

use livecast_core::{
    config::{LiveConfig, WebRTCConfig},
    models::{GoLiveRequest, UserId},
    service::LiveRegistry,
    store::{MemoryStore, RealtimeStore, StorePaths},
    Identity,
};
use livecast_rtc::{
    join_playback, play_ivf, watch_live, Broadcast, MediaConstraints, MediaFiles,
    PeerConnectionState, SampleSource, TrackKind, WebRtcTransport,
};
use parking_lot::Mutex;
use std::{io::Write, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

fn local_only() -> WebRTCConfig {
    WebRTCConfig {
        stun_servers: Vec::new(),
        turn: None,
    }
}

fn user(name: &str) -> Identity {
    Identity::authenticated(UserId::from(name))
}

/// IVF (VP8) file of `frames` tiny frames at 30 fps
fn ivf_bytes(frames: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"DKIF");
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&32u16.to_le_bytes());
    out.extend_from_slice(b"VP80");
    out.extend_from_slice(&320u16.to_le_bytes());
    out.extend_from_slice(&240u16.to_le_bytes());
    out.extend_from_slice(&30u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&frames.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    for n in 0..frames {
        out.extend_from_slice(&8u32.to_le_bytes());
        out.extend_from_slice(&u64::from(n).to_le_bytes());
        out.extend_from_slice(&[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x40, 0x01]);
    }
    out
}

/// Poll `check` until it holds, for up to fifteen seconds
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{what} not reached within 15s");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_viewer_receives_broadcast_video() {
    let store = Arc::new(MemoryStore::new());
    let registry = LiveRegistry::new(
        store as Arc<dyn RealtimeStore>,
        StorePaths::default(),
        LiveConfig::default(),
    );
    let source = SampleSource::new("file");

    let broadcast = Broadcast::go_live(
        registry.clone(),
        WebRtcTransport::new(&local_only()).await.unwrap(),
        &user("alice"),
        GoLiveRequest::public(),
        &source,
        &MediaConstraints {
            video: true,
            audio: false,
        },
    )
    .await
    .unwrap();
    let session_id = broadcast.session().id().clone();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&ivf_bytes(30)).unwrap();
    let media = MediaFiles::load(Some(file.path()), None).await.unwrap();
    let stream = broadcast.connection().local_stream().unwrap();
    let cancel = CancellationToken::new();
    let playback = media.spawn(&stream, true, &cancel);
    assert_eq!(playback.len(), 1);

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delivered);
    let viewer = watch_live(
        &registry,
        WebRtcTransport::new(&local_only()).await.unwrap(),
        &user("bob"),
        &session_id,
        move |stream| {
            sink.lock()
                .extend(stream.tracks().iter().map(|track| track.kind()));
        },
    )
    .await
    .unwrap();

    eventually("viewer connection", || {
        viewer.state() == PeerConnectionState::Connected
    })
    .await;
    eventually("inbound video", || viewer.remote_stream().len() == 1).await;

    let remote = viewer.remote_stream();
    assert_eq!(remote.tracks()[0].kind(), TrackKind::Video);
    assert!(delivered.lock().contains(&TrackKind::Video));

    cancel.cancel();
    let samples = join_playback(playback).await.unwrap();
    assert!(samples > 0);

    viewer.close_connection().await.unwrap();
    broadcast.stop_streaming().await.unwrap();
    assert!(registry.get(&session_id).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_playback_ends_when_broadcast_stops() {
    let store = Arc::new(MemoryStore::new());
    let registry = LiveRegistry::new(
        store as Arc<dyn RealtimeStore>,
        StorePaths::default(),
        LiveConfig::default(),
    );
    let source = SampleSource::new("file");

    let broadcast = Broadcast::go_live(
        registry,
        WebRtcTransport::new(&local_only()).await.unwrap(),
        &user("alice"),
        GoLiveRequest::public(),
        &source,
        &MediaConstraints {
            video: true,
            audio: false,
        },
    )
    .await
    .unwrap();

    let stream = broadcast.connection().local_stream().unwrap();
    let track = stream.track(TrackKind::Video).unwrap().clone();
    let data = ivf_bytes(5);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(async move { play_ivf(&data, &track, true, &cancel).await });

    // Stopping the broadcast stops the track, which ends repeating playback
    tokio::time::sleep(Duration::from_millis(300)).await;
    broadcast.stop_streaming().await.unwrap();
    let written = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(written > 0);
}
