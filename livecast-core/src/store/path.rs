//! Store paths and the builder for every path the application uses.
//!
//! A path is a `/`-separated list of non-empty segments. Segments may not
//! contain `.`, `#`, `$`, `[`, `]` or `/`, which keeps them safe to use as
//! JSON object keys and as parts of Redis key names.

use crate::{
    models::{SessionId, UserId},
    Error, Result,
};

const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']', '/'];

/// Validated location in the realtime tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath(String);

impl StorePath {
    /// Parse a path, ignoring leading and trailing slashes
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Err(Error::InvalidPath("Path cannot be empty".to_string()));
        }
        for segment in trimmed.split('/') {
            validate_segment(segment)?;
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Append one segment
    pub fn child(&self, segment: &str) -> Result<Self> {
        validate_segment(segment)?;
        Ok(Self(format!("{}/{segment}", self.0)))
    }

    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| Self(parent.to_string()))
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// All strict ancestors, nearest first
    #[must_use]
    pub fn ancestors(&self) -> Vec<Self> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(path) = current {
            current = path.parent();
            out.push(path);
        }
        out
    }

    /// Strict ancestor test (`a` is an ancestor of `a/b`, not of `a` or `ab`)
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Whether a write at `other` can change the value seen at `self`
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self == other || self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }

    /// Segments of `self` below `ancestor`; empty when equal, `None` when unrelated
    #[must_use]
    pub fn relative_to<'a>(&'a self, ancestor: &Self) -> Option<Vec<&'a str>> {
        if self == ancestor {
            Some(Vec::new())
        } else if ancestor.is_ancestor_of(self) {
            Some(self.0[ancestor.0.len() + 1..].split('/').collect())
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for StorePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::InvalidPath("Path segment cannot be empty".to_string()));
    }
    if let Some(c) = segment.chars().find(|c| FORBIDDEN.contains(c) || c.is_control()) {
        return Err(Error::InvalidPath(format!(
            "Path segment '{segment}' contains forbidden character '{c}'"
        )));
    }
    Ok(())
}

/// Builder for every path of the realtime tree
///
/// All paths live under an optional namespace segment so several
/// environments can share one store.
#[derive(Debug, Clone, Default)]
pub struct StorePaths {
    namespace: Option<String>,
}

impl StorePaths {
    /// Create a builder; an empty namespace means paths start at the root
    pub fn new(namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Ok(Self { namespace: None });
        }
        validate_segment(&namespace)?;
        Ok(Self {
            namespace: Some(namespace),
        })
    }

    fn join(&self, segments: &[&str]) -> Result<StorePath> {
        for segment in segments {
            validate_segment(segment)?;
        }
        let joined = segments.join("/");
        Ok(match &self.namespace {
            Some(ns) => StorePath(format!("{ns}/{joined}")),
            None => StorePath(joined),
        })
    }

    /// Registry of live sessions
    ///
    /// Shape: map of session id to `LiveSession`
    pub fn live_streams(&self) -> Result<StorePath> {
        self.join(&["liveStreams"])
    }

    /// One live session entry
    ///
    /// Shape: `{userId, streamUrl, premiumAmount, timestamp, notificationMessage}`
    pub fn live_stream(&self, session_id: &SessionId) -> Result<StorePath> {
        self.join(&["liveStreams", session_id.as_str()])
    }

    /// Signaling subtree of a session (offer, answer, candidates)
    pub fn stream(&self, session_id: &SessionId) -> Result<StorePath> {
        self.join(&["streams", session_id.as_str()])
    }

    /// Shape: `{type: "offer", sdp}`; written by the broadcaster
    pub fn offer(&self, session_id: &SessionId) -> Result<StorePath> {
        self.join(&["streams", session_id.as_str(), "offer"])
    }

    /// Shape: `{type: "answer", sdp}`; written by the viewer
    pub fn answer(&self, session_id: &SessionId) -> Result<StorePath> {
        self.join(&["streams", session_id.as_str(), "answer"])
    }

    /// Shape: map of user id to (map of push key to `IceCandidate`)
    pub fn candidates(&self, session_id: &SessionId) -> Result<StorePath> {
        self.join(&["streams", session_id.as_str(), "candidates"])
    }

    /// Candidates published by one participant
    pub fn candidates_of(&self, session_id: &SessionId, user_id: &UserId) -> Result<StorePath> {
        self.join(&["streams", session_id.as_str(), "candidates", user_id.as_str()])
    }

    /// Shape: map of push key to `{message, timestamp}`
    pub fn follower_notifications(&self, user_id: &UserId) -> Result<StorePath> {
        self.join(&["notifications", user_id.as_str(), "followers"])
    }
}
