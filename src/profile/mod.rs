//! Profiles: isolated device identities with their own storage subtree.

mod context;
mod controller;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::ProfileError;

pub use context::{ProfileContext, ProfileGuard, ProfileState};
pub use controller::ProfileController;

const MAX_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            created_at: Utc::now(),
        }
    }
}

/// Fresh, sortable profile id.
pub fn new_profile_id() -> String {
    Ulid::new().to_string()
}

/// Ids become directory names, so only `[A-Za-z0-9_-]` is allowed.
pub fn validate_profile_id(id: &str) -> Result<(), ProfileError> {
    let valid = !id.is_empty()
        && id.chars().count() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ProfileError::InvalidId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_ids() {
        assert!(validate_profile_id("p1").is_ok());
        assert!(validate_profile_id("work_phone-2").is_ok());
        assert!(validate_profile_id(&new_profile_id()).is_ok());
        assert!(validate_profile_id(&"a".repeat(64)).is_ok());

        let too_long = "a".repeat(65);
        for bad in ["", "..", "a/b", "a.b", "with space", too_long.as_str()] {
            assert!(
                matches!(validate_profile_id(bad), Err(ProfileError::InvalidId(_))),
                "accepted '{bad}'"
            );
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(new_profile_id(), new_profile_id());
    }
}
