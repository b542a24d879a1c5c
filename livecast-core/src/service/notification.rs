//! Follower notifications.
//!
//! Entries are appended under `notifications/{userId}/followers`. Delivery to
//! devices is handled elsewhere; this service only writes and reads the list.

use std::sync::Arc;
use tracing::debug;

use crate::{
    models::{now_millis, FollowerNotification, UserId},
    store::{RealtimeStore, RealtimeStoreExt, StorePaths},
    Error, Result,
};

#[derive(Clone)]
pub struct NotificationService {
    store: Arc<dyn RealtimeStore>,
    paths: StorePaths,
}

impl NotificationService {
    pub fn new(store: Arc<dyn RealtimeStore>, paths: StorePaths) -> Self {
        Self { store, paths }
    }

    /// Append `{message, timestamp}` to the user's follower list; returns the entry key
    pub async fn notify_followers(&self, user_id: &UserId, message: &str) -> Result<String> {
        let message = message.trim();
        if message.is_empty() {
            return Err(Error::InvalidInput(
                "Notification message cannot be empty".to_string(),
            ));
        }

        let entry = FollowerNotification {
            message: message.to_string(),
            timestamp: now_millis(),
        };
        let path = self.paths.follower_notifications(user_id)?;
        let key = self.store.push_as(&path, &entry).await?;

        debug!(user_id = %user_id, key = %key, "Follower notification queued");
        Ok(key)
    }

    /// Notifications of a user, oldest first
    pub async fn list_follower_notifications(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<FollowerNotification>> {
        let path = self.paths.follower_notifications(user_id)?;
        let Some(value) = self.store.get(&path).await? else {
            return Ok(Vec::new());
        };

        let mut entries: Vec<(String, serde_json::Value)> = match value {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => return Ok(Vec::new()),
        };
        // Push keys sort in creation order
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        entries
            .into_iter()
            .map(|(_, v)| serde_json::from_value(v).map_err(Error::from))
            .collect()
    }
}
