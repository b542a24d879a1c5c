//! End-to-end broadcaster/viewer signaling over the in-memory store
//!
//! Uses a scripted in-process transport so negotiation is deterministic.
//!
//! Run with: cargo test -p livecast-rtc --test signaling_flow

use async_trait::async_trait;
use livecast_core::{
    config::LiveConfig,
    models::{GoLiveRequest, IceCandidate, SdpType, SessionDescription, SessionId, UserId},
    service::LiveRegistry,
    store::{MemoryStore, RealtimeStore, StorePaths},
    Error, Identity, Result,
};
use livecast_rtc::{
    watch_live, Broadcast, LiveConnection, LocalStream, LocalTrack, MediaConstraints, MediaSource,
    PeerConnectionState, PeerTransport, RemoteTrack, SampleSource, TrackKind, TransportEvent,
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

/// What a fake transport was asked to do
#[derive(Debug, Default)]
struct Recorded {
    tracks: Vec<(String, TrackKind)>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    rejected_candidates: usize,
    closed: bool,
}

/// Transport that scripts the events a real peer connection would raise:
/// two local candidates after the local description is set, and one
/// inbound track per `a=track` line of a remote offer.
struct FakeTransport {
    name: &'static str,
    recorded: Arc<Mutex<Recorded>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    fail_offer: bool,
}

impl FakeTransport {
    fn new(name: &'static str) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            name,
            recorded: Arc::new(Mutex::new(Recorded::default())),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            fail_offer: false,
        }
    }

    fn failing_offer(name: &'static str) -> Self {
        Self {
            fail_offer: true,
            ..Self::new(name)
        }
    }

    fn recorded(&self) -> Arc<Mutex<Recorded>> {
        Arc::clone(&self.recorded)
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.recorded
            .lock()
            .tracks
            .push((track.id().to_string(), track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.fail_offer {
            return Err(Error::Negotiation("scripted offer failure".to_string()));
        }
        let mut sdp = format!("v=0\r\no={}\r\n", self.name);
        for (id, kind) in &self.recorded.lock().tracks {
            sdp.push_str(&format!("a=track:{id} {kind}\r\n"));
        }
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("v=0\r\no={}\r\n", self.name)))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        let answering = {
            let mut recorded = self.recorded.lock();
            recorded.local = Some(description.clone());
            recorded.remote.is_some()
        };
        if !answering {
            let _ = self
                .events_tx
                .send(TransportEvent::StateChanged(PeerConnectionState::Connecting));
        }
        for n in 0..2 {
            let _ = self.events_tx.send(TransportEvent::IceCandidate(IceCandidate {
                candidate: format!("candidate:{}-{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host", self.name),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        self.recorded.lock().remote = Some(description.clone());
        if description.sdp_type == SdpType::Offer {
            for line in description.sdp.lines() {
                let Some(rest) = line.strip_prefix("a=track:") else {
                    continue;
                };
                let Some((id, kind)) = rest.split_once(' ') else {
                    continue;
                };
                let kind = if kind == "audio" { TrackKind::Audio } else { TrackKind::Video };
                let _ = self
                    .events_tx
                    .send(TransportEvent::Track(RemoteTrack::new(id, "remote", kind)));
            }
        }
        let _ = self
            .events_tx
            .send(TransportEvent::StateChanged(PeerConnectionState::Connected));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let mut recorded = self.recorded.lock();
        if recorded.remote.is_none() {
            recorded.rejected_candidates += 1;
            return Err(Error::Negotiation("remote description not set".to_string()));
        }
        recorded.candidates.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.recorded.lock().closed = true;
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}

struct FailingSource;

#[async_trait]
impl MediaSource for FailingSource {
    async fn acquire(&self, _constraints: &MediaConstraints) -> Result<LocalStream> {
        Err(Error::MediaAccess("camera permission denied".to_string()))
    }
}

fn setup() -> (Arc<MemoryStore>, LiveRegistry) {
    let store = Arc::new(MemoryStore::new());
    let registry = LiveRegistry::new(
        store.clone() as Arc<dyn RealtimeStore>,
        StorePaths::default(),
        LiveConfig::default(),
    );
    (store, registry)
}

fn user(name: &str) -> Identity {
    Identity::authenticated(UserId::from(name))
}

/// Poll `check` until it holds, for up to two seconds
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn test_broadcast_and_watch_full_flow() {
    let (store, registry) = setup();
    let source = SampleSource::new("cam");

    let broadcaster_transport = FakeTransport::new("alice");
    let alice_rec = broadcaster_transport.recorded();
    let broadcast = Broadcast::go_live(
        registry.clone(),
        broadcaster_transport,
        &user("alice"),
        GoLiveRequest::public().with_message("Going live"),
        &source,
        &MediaConstraints::default(),
    )
    .await
    .unwrap();
    let session_id = broadcast.session().id().clone();

    // Listing pages see the session
    let live = registry.list().await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id(), &session_id);
    assert_eq!(live[0].premium_amount, 0);
    assert_eq!(alice_rec.lock().tracks.len(), 2);

    let viewer_transport = FakeTransport::new("bob");
    let bob_rec = viewer_transport.recorded();
    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deliveries);
    let viewer = watch_live(
        &registry,
        viewer_transport,
        &user("bob"),
        &session_id,
        move |stream| sink.lock().push(stream.len()),
    )
    .await
    .unwrap();

    eventually(|| viewer.remote_stream().len() == 2).await;
    eventually(|| broadcast.connection().is_negotiated()).await;
    eventually(|| alice_rec.lock().candidates.len() == 2 && bob_rec.lock().candidates.len() == 2)
        .await;

    // One callback per track, each with the aggregated stream
    assert_eq!(*deliveries.lock(), vec![1, 2]);

    // Each side applied only the counterpart's candidates, once each
    {
        let bob = bob_rec.lock();
        assert!(bob.candidates.iter().all(|c| c.candidate.starts_with("candidate:alice")));
        assert_eq!(bob.rejected_candidates, 0);
        assert_eq!(bob.remote.as_ref().unwrap().sdp_type, SdpType::Offer);
        let alice = alice_rec.lock();
        assert!(alice.candidates.iter().all(|c| c.candidate.starts_with("candidate:bob")));
        assert_eq!(alice.rejected_candidates, 0);
        assert_eq!(alice.remote, bob.local);
    }
    assert_eq!(viewer.state(), PeerConnectionState::Connected);

    // A later candidate from bob reaches alice; bob does not re-apply alice's
    viewer
        .signaling()
        .publish_candidate(&IceCandidate::new("candidate:bob-late 1 udp 1 10.0.0.9 5000 typ host"))
        .await
        .unwrap();
    eventually(|| alice_rec.lock().candidates.len() == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bob_rec.lock().candidates.len(), 2);

    // Teardown removes every trace of the session
    broadcast.stop_streaming().await.unwrap();
    assert!(registry.get(&session_id).await.unwrap().is_none());
    let paths = StorePaths::default();
    assert!(store.get(&paths.stream(&session_id).unwrap()).await.unwrap().is_none());
    assert!(alice_rec.lock().closed);
    assert!(!source.is_in_use());

    broadcast.stop_streaming().await.unwrap();
    viewer.close_connection().await.unwrap();
    assert!(bob_rec.lock().closed);
}

#[tokio::test]
async fn test_media_failure_rolls_back_registration() {
    let (store, registry) = setup();
    let transport = FakeTransport::new("alice");
    let rec = transport.recorded();

    let err = Broadcast::go_live(
        registry.clone(),
        transport,
        &user("alice"),
        GoLiveRequest::public(),
        &FailingSource,
        &MediaConstraints::default(),
    )
    .await
    .err()
    .unwrap();

    assert!(matches!(err, Error::MediaAccess(_)));
    assert!(registry.list().await.unwrap().is_empty());
    assert!(store.get(&StorePaths::default().live_streams().unwrap()).await.unwrap().is_none());
    assert!(rec.lock().closed);
}

#[tokio::test]
async fn test_offer_failure_rolls_back_and_releases_media() {
    let (store, registry) = setup();
    let source = SampleSource::new("cam");

    let err = Broadcast::go_live(
        registry.clone(),
        FakeTransport::failing_offer("alice"),
        &user("alice"),
        GoLiveRequest::public(),
        &source,
        &MediaConstraints::default(),
    )
    .await
    .err()
    .unwrap();

    assert!(matches!(err, Error::Negotiation(_)));
    assert!(registry.list().await.unwrap().is_empty());
    assert!(store.get(&StorePaths::default().live_streams().unwrap()).await.unwrap().is_none());
    assert!(!source.is_in_use());
}

#[tokio::test]
async fn test_go_live_requires_identity() {
    let (_, registry) = setup();
    let source = SampleSource::new("cam");

    let err = Broadcast::go_live(
        registry,
        FakeTransport::new("anon"),
        &Identity::anonymous(),
        GoLiveRequest::public(),
        &source,
        &MediaConstraints::default(),
    )
    .await
    .err()
    .unwrap();

    assert!(matches!(err, Error::Unauthenticated(_)));
    assert!(!source.is_in_use());
}

#[tokio::test]
async fn test_close_without_start_is_idempotent() {
    let (_, registry) = setup();
    let session_id = SessionId::from("stream_1700000000000_abcdef");
    let transport = FakeTransport::new("alice");
    let rec = transport.recorded();
    let connection = LiveConnection::new(
        transport,
        registry.signaling_channel(&session_id, &UserId::from("alice")),
    );

    connection.close_connection().await.unwrap();
    connection.close_connection().await.unwrap();
    assert!(rec.lock().closed);
    assert_eq!(connection.state(), PeerConnectionState::Closed);

    // A closed connection cannot be started
    let err = connection.watch_stream(|_| {}).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_connection_plays_one_role() {
    let (_, registry) = setup();
    let session_id = SessionId::from("stream_1700000000000_abcdef");
    let connection = LiveConnection::new(
        FakeTransport::new("bob"),
        registry.signaling_channel(&session_id, &UserId::from("bob")),
    );

    connection.watch_stream(|_| {}).await.unwrap();
    let err = connection.watch_stream(|_| {}).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    let stream = SampleSource::new("cam")
        .acquire(&MediaConstraints::default())
        .await
        .unwrap();
    let err = connection.start_streaming(stream.clone()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert!(stream.is_stopped());

    connection.close_connection().await.unwrap();
}

#[tokio::test]
async fn test_watch_requires_live_session_and_user() {
    let (_, registry) = setup();
    let session_id = SessionId::from("stream_missing");

    let err = watch_live(&registry, FakeTransport::new("bob"), &user("bob"), &session_id, |_| {})
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::NotFound(_)));

    let err = watch_live(
        &registry,
        FakeTransport::new("anon"),
        &Identity::anonymous(),
        &session_id,
        |_| {},
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, Error::Unauthenticated(_)));
}
