//! Signaling exchange over the realtime store.
//!
//! The broadcaster publishes an offer at `streams/{id}/offer`, the viewer
//! answers at `streams/{id}/answer`, and both append ICE candidates under
//! `streams/{id}/candidates/{userId}`. Candidate snapshots are read through a
//! [`CandidateCursor`] so every candidate is applied exactly once.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::{debug, info, warn};

use crate::{
    models::{IceCandidate, SdpType, SessionDescription, SessionId, UserId},
    store::{RealtimeStore, RealtimeStoreExt, Snapshot, StorePath, StorePaths, Subscription},
    Error, Result,
};

/// Signaling endpoint of one participant in one session
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn RealtimeStore>,
    paths: StorePaths,
    session_id: SessionId,
    user_id: UserId,
    max_candidates: usize,
    published: Arc<AtomicUsize>,
    limit_logged: Arc<AtomicBool>,
}

impl SignalingChannel {
    pub fn new(
        store: Arc<dyn RealtimeStore>,
        paths: StorePaths,
        session_id: SessionId,
        user_id: UserId,
        max_candidates: usize,
    ) -> Self {
        Self {
            store,
            paths,
            session_id,
            user_id,
            max_candidates,
            published: Arc::new(AtomicUsize::new(0)),
            limit_logged: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn publish_description(
        &self,
        path: StorePath,
        expected: SdpType,
        description: &SessionDescription,
    ) -> Result<()> {
        if description.sdp_type != expected {
            return Err(Error::InvalidInput(format!(
                "Expected {expected} description, got {}",
                description.sdp_type
            )));
        }
        self.store.set_as(&path, description).await?;
        info!(
            session_id = %self.session_id,
            user_id = %self.user_id,
            sdp_type = %expected,
            "Session description published"
        );
        Ok(())
    }

    /// Overwrite the session offer
    pub async fn publish_offer(&self, offer: &SessionDescription) -> Result<()> {
        let path = self.paths.offer(&self.session_id)?;
        self.publish_description(path, SdpType::Offer, offer).await
    }

    /// Overwrite the session answer
    pub async fn publish_answer(&self, answer: &SessionDescription) -> Result<()> {
        let path = self.paths.answer(&self.session_id)?;
        self.publish_description(path, SdpType::Answer, answer).await
    }

    pub async fn offer(&self) -> Result<Option<SessionDescription>> {
        self.store.get_as(&self.paths.offer(&self.session_id)?).await
    }

    pub async fn answer(&self) -> Result<Option<SessionDescription>> {
        self.store.get_as(&self.paths.answer(&self.session_id)?).await
    }

    pub async fn watch_offer(&self) -> Result<DescriptionFeed> {
        let subscription = self.store.subscribe(&self.paths.offer(&self.session_id)?).await?;
        Ok(DescriptionFeed::new(subscription, SdpType::Offer))
    }

    pub async fn watch_answer(&self) -> Result<DescriptionFeed> {
        let subscription = self.store.subscribe(&self.paths.answer(&self.session_id)?).await?;
        Ok(DescriptionFeed::new(subscription, SdpType::Answer))
    }

    /// Append a local candidate under `candidates/{userId}`
    ///
    /// Returns `false` without writing once this participant has published
    /// the maximum number of candidates.
    pub async fn publish_candidate(&self, candidate: &IceCandidate) -> Result<bool> {
        let reserved = self
            .published
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_candidates).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            if !self.limit_logged.swap(true, Ordering::SeqCst) {
                warn!(
                    session_id = %self.session_id,
                    user_id = %self.user_id,
                    limit = self.max_candidates,
                    "Candidate limit reached, dropping further local candidates"
                );
            }
            return Ok(false);
        }

        let path = self.paths.candidates_of(&self.session_id, &self.user_id)?;
        if let Err(e) = self.store.push_as(&path, candidate).await {
            self.published.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }
        debug!(
            session_id = %self.session_id,
            user_id = %self.user_id,
            "ICE candidate published"
        );
        Ok(true)
    }

    /// Feed of candidates published by the other participants
    pub async fn watch_candidates(&self) -> Result<CandidateFeed> {
        let subscription = self
            .store
            .subscribe(&self.paths.candidates(&self.session_id)?)
            .await?;
        Ok(CandidateFeed {
            subscription,
            cursor: CandidateCursor::new(self.user_id.clone(), self.max_candidates),
        })
    }

    /// Remove the whole signaling subtree of the session
    pub async fn clear(&self) -> Result<()> {
        self.store.remove(&self.paths.stream(&self.session_id)?).await?;
        debug!(session_id = %self.session_id, "Signaling data cleared");
        Ok(())
    }
}

/// Feed of present, well-formed session descriptions of one type
pub struct DescriptionFeed {
    subscription: Subscription,
    expected: SdpType,
    last: Option<SessionDescription>,
}

impl DescriptionFeed {
    const fn new(subscription: Subscription, expected: SdpType) -> Self {
        Self {
            subscription,
            expected,
            last: None,
        }
    }

    /// Wait for the next description different from the previous one.
    /// Empty and malformed values are skipped.
    pub async fn next(&mut self) -> Option<SessionDescription> {
        loop {
            let snapshot = self.subscription.next().await?;
            let description = match snapshot.decode::<SessionDescription>() {
                Ok(Some(description)) => description,
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = %snapshot.path, error = %e, "Malformed session description");
                    continue;
                }
            };
            if description.sdp_type != self.expected || description.sdp.is_empty() {
                warn!(
                    path = %snapshot.path,
                    sdp_type = %description.sdp_type,
                    "Ignoring unexpected session description"
                );
                continue;
            }
            if self.last.as_ref() == Some(&description) {
                continue;
            }
            self.last = Some(description.clone());
            return Some(description);
        }
    }
}

/// Candidate published by another participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCandidate {
    pub from: UserId,
    /// Push key of the entry
    pub key: String,
    pub candidate: IceCandidate,
}

/// Tracks which candidate entries were already handed out
///
/// Entries of the local user are ignored, as is anything beyond `max_per_peer`
/// entries from one remote participant.
#[derive(Debug)]
pub struct CandidateCursor {
    local_user: UserId,
    max_per_peer: usize,
    seen: HashSet<(String, String)>,
    accepted: HashMap<String, usize>,
}

impl CandidateCursor {
    #[must_use]
    pub fn new(local_user: UserId, max_per_peer: usize) -> Self {
        Self {
            local_user,
            max_per_peer,
            seen: HashSet::new(),
            accepted: HashMap::new(),
        }
    }

    /// Candidates in `snapshot` (of `streams/{id}/candidates`) not returned before
    pub fn advance(&mut self, snapshot: &Snapshot) -> Vec<RemoteCandidate> {
        let mut fresh = Vec::new();

        for (user, entries) in snapshot.children() {
            if user == self.local_user.as_str() {
                continue;
            }
            let Some(map) = entries.as_object() else {
                continue;
            };
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            for key in keys {
                if !self.seen.insert((user.to_string(), key.clone())) {
                    continue;
                }
                let accepted = self.accepted.entry(user.to_string()).or_insert(0);
                if *accepted >= self.max_per_peer {
                    if *accepted == self.max_per_peer {
                        warn!(from = %user, "Remote candidate limit reached");
                        *accepted += 1;
                    }
                    continue;
                }
                match serde_json::from_value::<IceCandidate>(map[key.as_str()].clone()) {
                    Ok(candidate) => {
                        *accepted += 1;
                        fresh.push(RemoteCandidate {
                            from: UserId::from(user),
                            key: key.clone(),
                            candidate,
                        });
                    }
                    Err(e) => warn!(from = %user, key = %key, error = %e, "Malformed candidate"),
                }
            }
        }

        fresh
    }

    /// Number of distinct entries observed so far
    #[must_use]
    pub fn seen(&self) -> usize {
        self.seen.len()
    }
}

/// Feed of remote candidates not delivered before
pub struct CandidateFeed {
    subscription: Subscription,
    cursor: CandidateCursor,
}

impl CandidateFeed {
    /// Wait for at least one new remote candidate
    pub async fn next(&mut self) -> Option<Vec<RemoteCandidate>> {
        loop {
            let snapshot = self.subscription.next().await?;
            let fresh = self.cursor.advance(&snapshot);
            if !fresh.is_empty() {
                return Some(fresh);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn channel(store: &Arc<MemoryStore>, user: &str, max: usize) -> SignalingChannel {
        SignalingChannel::new(
            store.clone(),
            StorePaths::default(),
            SessionId::from("stream_1"),
            UserId::from(user),
            max,
        )
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_offer_answer_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = channel(&store, "alice", 8);
        let viewer = channel(&store, "bob", 8);

        let mut answers = broadcaster.watch_answer().await.unwrap();

        broadcaster
            .publish_offer(&SessionDescription::offer("v=0 offer"))
            .await
            .unwrap();
        let offer = viewer.watch_offer().await.unwrap().next().await.unwrap();
        assert_eq!(offer.sdp, "v=0 offer");

        viewer
            .publish_answer(&SessionDescription::answer("v=0 answer"))
            .await
            .unwrap();
        assert_eq!(answers.next().await.unwrap().sdp, "v=0 answer");
        assert_eq!(broadcaster.answer().await.unwrap().unwrap().sdp, "v=0 answer");
    }

    #[tokio::test]
    async fn test_wrong_description_type_rejected() {
        let store = Arc::new(MemoryStore::new());
        let err = channel(&store, "alice", 8)
            .publish_offer(&SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_description_feed_skips_garbage() {
        let store = Arc::new(MemoryStore::new());
        let viewer = channel(&store, "bob", 8);
        let mut offers = viewer.watch_offer().await.unwrap();

        let path = StorePaths::default().offer(viewer.session_id()).unwrap();
        store.set(&path, json!({"nonsense": true})).await.unwrap();
        store.set(&path, json!({"type": "offer", "sdp": ""})).await.unwrap();
        store.set(&path, json!({"type": "offer", "sdp": "v=0"})).await.unwrap();

        assert_eq!(offers.next().await.unwrap().sdp, "v=0");
    }

    #[tokio::test]
    async fn test_candidate_limit() {
        let store = Arc::new(MemoryStore::new());
        let alice = channel(&store, "alice", 2);

        assert!(alice.publish_candidate(&candidate(1)).await.unwrap());
        assert!(alice.publish_candidate(&candidate(2)).await.unwrap());
        assert!(!alice.publish_candidate(&candidate(3)).await.unwrap());

        let path = StorePaths::default()
            .candidates_of(alice.session_id(), alice.user_id())
            .unwrap();
        let stored = store.get(&path).await.unwrap().unwrap();
        assert_eq!(stored.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_candidates_delivered_once_and_own_skipped() {
        let store = Arc::new(MemoryStore::new());
        let alice = channel(&store, "alice", 8);
        let bob = channel(&store, "bob", 8);

        let mut feed = bob.watch_candidates().await.unwrap();

        alice.publish_candidate(&candidate(1)).await.unwrap();
        bob.publish_candidate(&candidate(9)).await.unwrap();
        alice.publish_candidate(&candidate(2)).await.unwrap();

        let first = feed.next().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].from.as_str(), "alice");
        assert_eq!(first[0].candidate, candidate(1));

        // Bob's own candidate produced a snapshot with nothing new for him
        let second = feed.next().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].candidate, candidate(2));
    }

    #[test]
    fn test_cursor_never_repeats() {
        let mut cursor = CandidateCursor::new(UserId::from("bob"), 8);
        let snapshot = Snapshot {
            path: StorePath::parse("streams/s/candidates").unwrap(),
            value: Some(json!({
                "alice": {
                    "0001": serde_json::to_value(candidate(1)).unwrap(),
                    "0002": serde_json::to_value(candidate(2)).unwrap()
                },
                "bob": {
                    "0003": serde_json::to_value(candidate(3)).unwrap()
                }
            })),
        };

        let first = cursor.advance(&snapshot);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].key, "0001");

        // Same snapshot again: nothing new
        assert!(cursor.advance(&snapshot).is_empty());
        assert_eq!(cursor.seen(), 2);
    }

    #[test]
    fn test_cursor_bounds_remote_peer() {
        let mut cursor = CandidateCursor::new(UserId::from("bob"), 1);
        let snapshot = Snapshot {
            path: StorePath::parse("streams/s/candidates").unwrap(),
            value: Some(json!({
                "alice": {
                    "0001": serde_json::to_value(candidate(1)).unwrap(),
                    "0002": serde_json::to_value(candidate(2)).unwrap(),
                    "0003": {"bogus": 1}
                }
            })),
        };

        let fresh = cursor.advance(&snapshot);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].candidate, candidate(1));
    }

    #[tokio::test]
    async fn test_clear_removes_subtree() {
        let store = Arc::new(MemoryStore::new());
        let alice = channel(&store, "alice", 8);

        alice.publish_offer(&SessionDescription::offer("v=0")).await.unwrap();
        alice.publish_candidate(&candidate(1)).await.unwrap();
        alice.clear().await.unwrap();

        let path = StorePaths::default().stream(alice.session_id()).unwrap();
        assert!(store.get(&path).await.unwrap().is_none());
        // Clearing twice is fine
        alice.clear().await.unwrap();
    }
}
