use serde::{Deserialize, Serialize};

/// Entry appended to `notifications/{userId}/followers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerNotification {
    pub message: String,
    /// Unix milliseconds
    pub timestamp: i64,
}
