//! Broadcast orchestration
//!
//! Ties the live session registry to a [`LiveConnection`]: going live
//! registers the session, acquires media and starts streaming; stopping
//! undoes all of it.

use livecast_core::{
    models::{GoLiveRequest, LiveSession, SessionId},
    service::LiveRegistry,
    Error, Identity, Result,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::{
    connection::LiveConnection,
    media::{MediaConstraints, MediaSource, RemoteStream},
    transport::PeerTransport,
};

/// A running broadcast
pub struct Broadcast<T: PeerTransport> {
    registry: LiveRegistry,
    session: LiveSession,
    connection: LiveConnection<T>,
    stopped: AtomicBool,
}

impl<T: PeerTransport> Broadcast<T> {
    /// Register a live session and start streaming to it
    ///
    /// When media cannot be acquired or the offer cannot be published, the
    /// registry entry and signaling data are removed before the error is
    /// returned.
    pub async fn go_live(
        registry: LiveRegistry,
        transport: T,
        identity: &Identity,
        request: GoLiveRequest,
        source: &dyn MediaSource,
        constraints: &MediaConstraints,
    ) -> Result<Self> {
        let session = registry.go_live(identity, request).await?;
        let signaling = registry.signaling_channel(session.id(), &session.user_id);
        let connection = LiveConnection::new(transport, signaling);

        let started = match source.acquire(constraints).await {
            Ok(stream) => connection.start_streaming(stream).await,
            Err(e) => Err(e),
        };

        if let Err(e) = started {
            warn!(session_id = %session.id(), error = %e, "Going live failed, rolling back");
            if let Err(cleanup) = connection.close_connection().await {
                warn!(session_id = %session.id(), error = %cleanup, "Failed to close connection during rollback");
            }
            if let Err(cleanup) = registry.end_live(session.id()).await {
                warn!(session_id = %session.id(), error = %cleanup, "Failed to remove live entry during rollback");
            }
            return Err(e);
        }

        info!(session_id = %session.id(), user_id = %session.user_id, "Broadcast live");

        Ok(Self {
            registry,
            session,
            connection,
            stopped: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn session(&self) -> &LiveSession {
        &self.session
    }

    #[must_use]
    pub const fn connection(&self) -> &LiveConnection<T> {
        &self.connection
    }

    /// Stop local media, close the connection and remove the live entry and
    /// signaling data; repeated calls are no-ops
    pub async fn stop_streaming(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let closed = self.connection.close_connection().await;
        let ended = self.registry.end_live(self.session.id()).await;

        info!(session_id = %self.session.id(), "Broadcast stopped");
        closed.and(ended)
    }
}

/// Join a live session as a viewer
///
/// Fails with `NotFound` when the session is not live.
pub async fn watch_live<T, F>(
    registry: &LiveRegistry,
    transport: T,
    identity: &Identity,
    session_id: &SessionId,
    on_remote_stream: F,
) -> Result<LiveConnection<T>>
where
    T: PeerTransport,
    F: Fn(RemoteStream) + Send + Sync + 'static,
{
    let user_id = identity.require_user()?;
    if registry.get(session_id).await?.is_none() {
        return Err(Error::NotFound(format!("Live session {session_id}")));
    }

    let connection = LiveConnection::new(
        transport,
        registry.signaling_channel(session_id, user_id),
    );
    connection.watch_stream(on_remote_stream).await?;
    Ok(connection)
}
