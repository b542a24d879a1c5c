//! Peer connection wrapper
//!
//! A [`LiveConnection`] owns one transport and plays one role in one
//! session: the broadcaster streams local media and waits for an answer, the
//! viewer waits for the offer and answers it. Both sides publish their local
//! candidates and apply the counterpart's candidates once a remote
//! description is in place.

use livecast_core::{
    service::{CandidateFeed, DescriptionFeed, SignalingChannel},
    Error, Result,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    media::{LocalStream, RemoteStream},
    transport::{PeerConnectionState, PeerTransport, TransportEvent},
};

/// Callback invoked with the aggregated remote stream on every new track
pub type RemoteStreamCallback = Arc<dyn Fn(RemoteStream) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Broadcaster,
    Viewer,
}

pub struct LiveConnection<T: PeerTransport> {
    transport: Arc<T>,
    signaling: SignalingChannel,
    role: Mutex<Option<Role>>,
    local_stream: Mutex<Option<LocalStream>>,
    remote_stream: Arc<Mutex<RemoteStream>>,
    state: Arc<Mutex<PeerConnectionState>>,
    remote_ready: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<T: PeerTransport> LiveConnection<T> {
    pub fn new(transport: T, signaling: SignalingChannel) -> Self {
        let (remote_ready, _) = watch::channel(false);
        Self {
            transport: Arc::new(transport),
            signaling,
            role: Mutex::new(None),
            local_stream: Mutex::new(None),
            remote_stream: Arc::new(Mutex::new(RemoteStream::default())),
            state: Arc::new(Mutex::new(PeerConnectionState::New)),
            remote_ready: Arc::new(remote_ready),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn signaling(&self) -> &SignalingChannel {
        &self.signaling
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[must_use]
    pub fn state(&self) -> PeerConnectionState {
        *self.state.lock()
    }

    /// Stream being broadcast, until the connection is closed
    #[must_use]
    pub fn local_stream(&self) -> Option<LocalStream> {
        self.local_stream.lock().clone()
    }

    /// Tracks received so far
    #[must_use]
    pub fn remote_stream(&self) -> RemoteStream {
        self.remote_stream.lock().clone()
    }

    /// Whether the counterpart's description has been applied
    #[must_use]
    pub fn is_negotiated(&self) -> bool {
        *self.remote_ready.borrow()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn claim(&self, role: Role) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        if self.is_closed() {
            return Err(Error::InvalidState("Connection is closed".to_string()));
        }
        let mut current = self.role.lock();
        if let Some(existing) = *current {
            return Err(Error::InvalidState(format!(
                "Connection already started as {existing:?}"
            )));
        }
        let events = self
            .transport
            .take_events()
            .ok_or_else(|| Error::InvalidState("Transport events already taken".to_string()))?;
        *current = Some(role);
        Ok(events)
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.lock().push(tokio::spawn(task));
    }

    fn spawn_event_loop(
        &self,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        on_remote_stream: Option<RemoteStreamCallback>,
    ) {
        self.spawn(handle_events(
            events,
            self.signaling.clone(),
            Arc::clone(&self.remote_stream),
            Arc::clone(&self.state),
            on_remote_stream,
            self.cancel.clone(),
        ));
    }

    fn spawn_candidate_loop(&self, feed: CandidateFeed) {
        self.spawn(apply_remote_candidates(
            Arc::clone(&self.transport),
            feed,
            self.remote_ready.subscribe(),
            self.cancel.clone(),
            self.signaling.clone(),
        ));
    }

    /// Stream `local_stream` as the broadcaster of the session
    ///
    /// Attaches every track, publishes the offer, then applies the first
    /// valid answer and the viewer's candidates in the background.
    pub async fn start_streaming(&self, local_stream: LocalStream) -> Result<()> {
        let events = match self.claim(Role::Broadcaster) {
            Ok(events) => events,
            Err(e) => {
                local_stream.stop();
                return Err(e);
            }
        };
        let tracks = local_stream.tracks().to_vec();
        *self.local_stream.lock() = Some(local_stream);

        self.spawn_event_loop(events, None);
        for track in &tracks {
            self.transport.add_track(track).await?;
        }

        // Subscribe before publishing so an early answer is not missed
        let answers = self.signaling.watch_answer().await?;
        let candidates = self.signaling.watch_candidates().await?;

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(&offer).await?;
        self.signaling.publish_offer(&offer).await?;

        self.spawn(apply_answer(
            Arc::clone(&self.transport),
            answers,
            Arc::clone(&self.remote_ready),
            self.cancel.clone(),
            self.signaling.clone(),
        ));
        self.spawn_candidate_loop(candidates);

        info!(
            session_id = %self.signaling.session_id(),
            user_id = %self.signaling.user_id(),
            tracks = tracks.len(),
            "Streaming started"
        );
        Ok(())
    }

    /// Watch the session as a viewer
    ///
    /// `on_remote_stream` receives the aggregated remote stream each time a
    /// track arrives, so it may fire once per track.
    pub async fn watch_stream<F>(&self, on_remote_stream: F) -> Result<()>
    where
        F: Fn(RemoteStream) + Send + Sync + 'static,
    {
        let events = self.claim(Role::Viewer)?;
        let callback: RemoteStreamCallback = Arc::new(on_remote_stream);
        self.spawn_event_loop(events, Some(callback));

        let offers = self.signaling.watch_offer().await?;
        let candidates = self.signaling.watch_candidates().await?;

        self.spawn(answer_offer(
            Arc::clone(&self.transport),
            offers,
            Arc::clone(&self.remote_ready),
            self.cancel.clone(),
            self.signaling.clone(),
        ));
        self.spawn_candidate_loop(candidates);

        info!(
            session_id = %self.signaling.session_id(),
            user_id = %self.signaling.user_id(),
            "Watching stream"
        );
        Ok(())
    }

    /// Tear the connection down
    ///
    /// Stops background work, closes the transport, stops local tracks and
    /// removes the session's signaling data. Safe to call repeatedly and on a
    /// connection that never started; every step runs even if an earlier one
    /// fails, and the first failure is returned.
    pub async fn close_connection(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let mut first_error = None;
        if let Err(e) = self.transport.close().await {
            warn!(session_id = %self.signaling.session_id(), error = %e, "Failed to close transport");
            first_error.get_or_insert(e);
        }
        *self.state.lock() = PeerConnectionState::Closed;

        if let Some(stream) = self.local_stream.lock().take() {
            stream.stop();
        }

        if let Err(e) = self.signaling.clear().await {
            warn!(session_id = %self.signaling.session_id(), error = %e, "Failed to clear signaling data");
            first_error.get_or_insert(e);
        }

        info!(session_id = %self.signaling.session_id(), "Connection closed");
        first_error.map_or(Ok(()), Err)
    }
}

impl<T: PeerTransport> Drop for LiveConnection<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Publish local candidates, collect remote tracks and track the state
async fn handle_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    signaling: SignalingChannel,
    remote_stream: Arc<Mutex<RemoteStream>>,
    state: Arc<Mutex<PeerConnectionState>>,
    on_remote_stream: Option<RemoteStreamCallback>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            TransportEvent::IceCandidate(candidate) => {
                if let Err(e) = signaling.publish_candidate(&candidate).await {
                    warn!(
                        session_id = %signaling.session_id(),
                        error = %e,
                        "Failed to publish local candidate"
                    );
                }
            }
            TransportEvent::Track(track) => {
                let snapshot = {
                    let mut stream = remote_stream.lock();
                    if !stream.add_track(track.clone()) {
                        continue;
                    }
                    stream.clone()
                };
                info!(
                    session_id = %signaling.session_id(),
                    track_id = %track.id(),
                    kind = %track.kind(),
                    "Remote track received"
                );
                if let Some(callback) = &on_remote_stream {
                    callback(snapshot);
                }
            }
            TransportEvent::StateChanged(new_state) => {
                *state.lock() = new_state;
                if new_state.is_terminal() {
                    warn!(
                        session_id = %signaling.session_id(),
                        state = %new_state,
                        "Peer connection ended"
                    );
                } else {
                    info!(
                        session_id = %signaling.session_id(),
                        state = %new_state,
                        "Peer connection state changed"
                    );
                }
            }
        }
    }
    debug!(session_id = %signaling.session_id(), "Transport event loop stopped");
}

/// Broadcaster side: apply the first answer that the transport accepts
async fn apply_answer<T: PeerTransport>(
    transport: Arc<T>,
    mut answers: DescriptionFeed,
    remote_ready: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
    signaling: SignalingChannel,
) {
    loop {
        let answer = tokio::select! {
            () = cancel.cancelled() => return,
            answer = answers.next() => answer,
        };
        let Some(answer) = answer else { return };

        match transport.set_remote_description(&answer).await {
            Ok(()) => {
                info!(session_id = %signaling.session_id(), "Answer applied");
                remote_ready.send_replace(true);
                return;
            }
            Err(e) => error!(
                session_id = %signaling.session_id(),
                error = %e,
                "Failed to apply answer, waiting for another"
            ),
        }
    }
}

/// Viewer side: answer the first offer that negotiates successfully
async fn answer_offer<T: PeerTransport>(
    transport: Arc<T>,
    mut offers: DescriptionFeed,
    remote_ready: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
    signaling: SignalingChannel,
) {
    loop {
        let offer = tokio::select! {
            () = cancel.cancelled() => return,
            offer = offers.next() => offer,
        };
        let Some(offer) = offer else { return };

        let result = async {
            transport.set_remote_description(&offer).await?;
            let answer = transport.create_answer().await?;
            transport.set_local_description(&answer).await?;
            signaling.publish_answer(&answer).await
        }
        .await;

        match result {
            Ok(()) => {
                info!(session_id = %signaling.session_id(), "Offer answered");
                remote_ready.send_replace(true);
                return;
            }
            Err(e) => error!(
                session_id = %signaling.session_id(),
                error = %e,
                "Failed to answer offer, waiting for another"
            ),
        }
    }
}

/// Apply the counterpart's candidates once the remote description is set
///
/// Snapshots arriving earlier stay queued in the feed, and the cursor hands
/// out each candidate once.
async fn apply_remote_candidates<T: PeerTransport>(
    transport: Arc<T>,
    mut feed: CandidateFeed,
    mut remote_ready: watch::Receiver<bool>,
    cancel: CancellationToken,
    signaling: SignalingChannel,
) {
    let ready = tokio::select! {
        () = cancel.cancelled() => false,
        ready = async { remote_ready.wait_for(|ready| *ready).await.is_ok() } => ready,
    };
    if !ready {
        return;
    }

    loop {
        let batch = tokio::select! {
            () = cancel.cancelled() => return,
            batch = feed.next() => batch,
        };
        let Some(batch) = batch else { return };

        for remote in batch {
            match transport.add_ice_candidate(&remote.candidate).await {
                Ok(()) => debug!(
                    session_id = %signaling.session_id(),
                    from = %remote.from,
                    "Remote candidate applied"
                ),
                Err(e) => warn!(
                    session_id = %signaling.session_id(),
                    from = %remote.from,
                    error = %e,
                    "Failed to apply remote candidate"
                ),
            }
        }
    }
}
