//! Caller identity, passed explicitly to every operation that needs a user.

use crate::{models::UserId, Error, Result};

/// Authentication context of the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    user: Option<UserId>,
}

impl Identity {
    #[must_use]
    pub const fn authenticated(user: UserId) -> Self {
        Self { user: Some(user) }
    }

    #[must_use]
    pub const fn anonymous() -> Self {
        Self { user: None }
    }

    #[must_use]
    pub const fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    /// Get the authenticated user or fail with `Unauthenticated`
    pub fn require_user(&self) -> Result<&UserId> {
        self.user
            .as_ref()
            .ok_or_else(|| Error::Unauthenticated("No authenticated user".to_string()))
    }
}

impl From<UserId> for Identity {
    fn from(user: UserId) -> Self {
        Self::authenticated(user)
    }
}
