pub mod id;
pub mod live;
pub mod notification;
pub mod signal;

pub use id::{generate_id, SessionId, UserId};
pub use live::{GoLiveRequest, LiveSession};
pub use notification::FollowerNotification;
pub use signal::{IceCandidate, SdpType, SessionDescription};

/// Current time as unix milliseconds
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
