use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{SessionId, UserId};

/// Live session entry stored at `liveStreams/{sessionId}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSession {
    /// Broadcaster
    pub user_id: UserId,
    /// Session id the viewer joins (signaling lives under `streams/{streamUrl}`)
    pub stream_url: SessionId,
    /// Price of a premium session, 0 for public ones
    #[serde(default)]
    pub premium_amount: u32,
    /// Creation time, unix milliseconds
    pub timestamp: i64,
    /// Stored as `""` when absent, so every entry has the same fields
    #[serde(default, with = "empty_as_none")]
    pub notification_message: Option<String>,
}

mod empty_as_none {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value.as_deref().unwrap_or_default())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.filter(|s| !s.is_empty()))
    }
}

impl LiveSession {
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.stream_url
    }

    #[must_use]
    pub const fn is_premium(&self) -> bool {
        self.premium_amount > 0
    }

    #[must_use]
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    /// Whether the entry was created more than `max_age` before `now`
    #[must_use]
    pub fn is_older_than(&self, max_age: std::time::Duration, now: DateTime<Utc>) -> bool {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        now.timestamp_millis().saturating_sub(self.timestamp) > max_age_ms
    }
}

/// Parameters of a go-live request
#[derive(Debug, Clone, Default)]
pub struct GoLiveRequest {
    /// `Some(amount)` makes the session premium; the amount must be a configured tier
    pub premium_amount: Option<u32>,
    /// Message announced to followers; blank means no announcement
    pub notification_message: Option<String>,
}

impl GoLiveRequest {
    #[must_use]
    pub fn public() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn premium(amount: u32) -> Self {
        Self {
            premium_amount: Some(amount),
            notification_message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.notification_message = Some(message.into());
        self
    }

    /// The announcement text, if it has any non-whitespace content
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.notification_message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
    }
}
