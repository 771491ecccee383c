//! Identity contract: a stable current-user id plus async profile lookup,
//! used to decorate call and chat participants.

use crate::error::{Error, Result};
use crate::models::UserProfile;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The id of the local signed-in user. Stable for the process lifetime.
    fn user_id(&self) -> String;

    async fn profile(&self, user_id: &str) -> Result<UserProfile>;
}

/// In-process identity provider backed by a profile map. Used by tests and
/// by embeddings that already hold profile data.
pub struct StaticIdentity {
    current: String,
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl StaticIdentity {
    pub fn new(current_user_id: &str) -> Self {
        Self {
            current: current_user_id.to_string(),
            profiles: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, profile: UserProfile) {
        self.profiles.write().insert(profile.user_id.clone(), profile);
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    fn user_id(&self) -> String {
        self.current.clone()
    }

    async fn profile(&self, user_id: &str) -> Result<UserProfile> {
        self.profiles
            .read()
            .get(user_id)
            .cloned()
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_and_miss() {
        let identity = StaticIdentity::new("alice");
        identity.insert(UserProfile {
            user_id: "bob".to_string(),
            display_name: Some("Bob".to_string()),
            avatar_url: None,
            trust_score: None,
        });

        assert_eq!(identity.user_id(), "alice");
        assert_eq!(
            identity.profile("bob").await.unwrap().display_name.as_deref(),
            Some("Bob")
        );
        assert!(matches!(
            identity.profile("nobody").await,
            Err(Error::UserNotFound(_))
        ));
    }
}
