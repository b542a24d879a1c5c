pub mod live;
pub mod notification;
pub mod signaling;

pub use live::{LiveListFeed, LiveRegistry, LiveSessionFeed};
pub use notification::NotificationService;
pub use signaling::{
    CandidateCursor, CandidateFeed, DescriptionFeed, RemoteCandidate, SignalingChannel,
};
