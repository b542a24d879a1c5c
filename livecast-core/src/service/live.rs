//! Live session registry.
//!
//! Advertises who is broadcasting under `liveStreams/{sessionId}` so listing
//! pages can discover sessions, and cleans up after sessions that ended or
//! were abandoned.

use chrono::Utc;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    config::LiveConfig,
    identity::Identity,
    models::{now_millis, GoLiveRequest, LiveSession, SessionId, UserId},
    service::{NotificationService, SignalingChannel},
    store::{RealtimeStore, RealtimeStoreExt, StorePaths, Subscription},
    Error, Result,
};

#[derive(Clone)]
pub struct LiveRegistry {
    store: Arc<dyn RealtimeStore>,
    paths: StorePaths,
    config: LiveConfig,
    notifications: NotificationService,
}

impl LiveRegistry {
    pub fn new(store: Arc<dyn RealtimeStore>, paths: StorePaths, config: LiveConfig) -> Self {
        let notifications = NotificationService::new(Arc::clone(&store), paths.clone());
        Self {
            store,
            paths,
            config,
            notifications,
        }
    }

    fn validate_premium(&self, amount: Option<u32>) -> Result<u32> {
        match amount {
            None => Ok(0),
            Some(0) => Err(Error::InvalidInput(
                "Premium sessions need a positive amount".to_string(),
            )),
            Some(amount) if self.config.premium_tiers.contains(&amount) => Ok(amount),
            Some(amount) => Err(Error::InvalidInput(format!(
                "Premium amount {amount} is not an offered tier"
            ))),
        }
    }

    /// Register a new live session for the authenticated user
    ///
    /// A non-blank message is also appended to the user's follower
    /// notifications. Failing to queue the notification does not undo the
    /// registration.
    pub async fn go_live(&self, identity: &Identity, request: GoLiveRequest) -> Result<LiveSession> {
        let user_id = match identity.require_user() {
            Ok(user) => user.clone(),
            Err(e) => {
                warn!("Go live refused: no authenticated user");
                return Err(e);
            }
        };
        let premium_amount = self.validate_premium(request.premium_amount)?;
        let message = request.message().map(str::to_string);

        let timestamp = now_millis();
        let session = LiveSession {
            user_id: user_id.clone(),
            stream_url: SessionId::generate(&self.config.session_id_prefix, timestamp),
            premium_amount,
            timestamp,
            notification_message: message.clone(),
        };

        let path = self.paths.live_stream(session.id())?;
        if !self
            .store
            .set_if_absent(&path, serde_json::to_value(&session)?)
            .await?
        {
            return Err(Error::AlreadyExists(format!(
                "Live session {} already exists",
                session.id()
            )));
        }

        info!(
            session_id = %session.id(),
            user_id = %user_id,
            premium_amount,
            "Live session registered"
        );

        if let Some(message) = message {
            if let Err(e) = self.notifications.notify_followers(&user_id, &message).await {
                warn!(
                    session_id = %session.id(),
                    user_id = %user_id,
                    error = %e,
                    "Failed to notify followers"
                );
            }
        }

        Ok(session)
    }

    /// Signaling endpoint of `user_id` in the session
    #[must_use]
    pub fn signaling_channel(&self, session_id: &SessionId, user_id: &UserId) -> SignalingChannel {
        SignalingChannel::new(
            Arc::clone(&self.store),
            self.paths.clone(),
            session_id.clone(),
            user_id.clone(),
            self.config.max_candidates_per_peer,
        )
    }

    /// Remove the live entry; ending an unknown session is a no-op
    pub async fn end_live(&self, session_id: &SessionId) -> Result<()> {
        self.store.remove(&self.paths.live_stream(session_id)?).await?;
        info!(session_id = %session_id, "Live session removed");
        Ok(())
    }

    pub async fn get(&self, session_id: &SessionId) -> Result<Option<LiveSession>> {
        self.store.get_as(&self.paths.live_stream(session_id)?).await
    }

    /// All live sessions, newest first
    pub async fn list(&self) -> Result<Vec<LiveSession>> {
        let value = self.store.get(&self.paths.live_streams()?).await?;
        Ok(decode_sessions(value.as_ref()))
    }

    /// Feed of the full session list, delivered on every change
    pub async fn watch(&self) -> Result<LiveListFeed> {
        let subscription = self.store.subscribe(&self.paths.live_streams()?).await?;
        Ok(LiveListFeed { subscription })
    }

    /// Feed of one session entry
    pub async fn watch_session(&self, session_id: &SessionId) -> Result<LiveSessionFeed> {
        let subscription = self
            .store
            .subscribe(&self.paths.live_stream(session_id)?)
            .await?;
        Ok(LiveSessionFeed { subscription })
    }

    /// Remove sessions older than `max_age` together with their signaling
    /// data; returns the removed ids
    pub async fn reap_stale(&self, max_age: Duration) -> Result<Vec<SessionId>> {
        let now = Utc::now();
        let mut reaped = Vec::new();

        for session in self.list().await? {
            if !session.is_older_than(max_age, now) {
                continue;
            }
            let id = session.id().clone();
            self.store.remove(&self.paths.live_stream(&id)?).await?;
            self.store.remove(&self.paths.stream(&id)?).await?;
            info!(
                session_id = %id,
                user_id = %session.user_id,
                started_at = ?session.created_at(),
                "Reaped stale live session"
            );
            reaped.push(id);
        }

        Ok(reaped)
    }
}

/// Decode `liveStreams`, skipping malformed entries, newest first
fn decode_sessions(value: Option<&Value>) -> Vec<LiveSession> {
    let Some(Value::Object(map)) = value else {
        return Vec::new();
    };
    let mut sessions: Vec<LiveSession> = map
        .iter()
        .filter_map(|(key, entry)| match serde_json::from_value::<LiveSession>(entry.clone()) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(session_id = %key, error = %e, "Skipping malformed live entry");
                None
            }
        })
        .collect();
    sessions.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.stream_url.cmp(&a.stream_url))
    });
    sessions
}

/// Live session list feed
pub struct LiveListFeed {
    subscription: Subscription,
}

impl LiveListFeed {
    /// Next list of live sessions (newest first); `None` when the store stops
    pub async fn next(&mut self) -> Option<Vec<LiveSession>> {
        let snapshot = self.subscription.next().await?;
        Some(decode_sessions(snapshot.value.as_ref()))
    }
}

/// Single live session feed
pub struct LiveSessionFeed {
    subscription: Subscription,
}

impl LiveSessionFeed {
    /// Next state of the session: `Some(None)` once it is gone or unreadable
    pub async fn next(&mut self) -> Option<Option<LiveSession>> {
        let snapshot = self.subscription.next().await?;
        match snapshot.decode::<LiveSession>() {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(path = %snapshot.path, error = %e, "Malformed live entry");
                Some(None)
            }
        }
    }
}
