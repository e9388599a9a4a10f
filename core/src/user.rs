//! User entities and their identity scheme.
//!
//! A [`UserId`] is a UUIDv7: 48 bits of Unix milliseconds followed by random
//! bits. Ids therefore sort in creation order, and the creation timestamp of a
//! user is read back from its id instead of being stored separately.
//!
//! `username` is the natural key used by upstream identity events; `id` is the
//! key every other service uses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Minimum username length in characters.
pub const USERNAME_MIN_LEN: usize = 3;
/// Maximum username length in characters.
pub const USERNAME_MAX_LEN: usize = 50;
/// Maximum display name length in characters.
pub const DISPLAY_NAME_MAX_LEN: usize = 50;
/// Maximum image URL length in characters.
pub const IMAGE_URL_MAX_LEN: usize = 255;
/// Maximum status text length in characters.
pub const STATUS_TEXT_MAX_LEN: usize = 200;

/// Globally unique, time-ordered user identifier.
///
/// Immutable once assigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    /// Generate a new id stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID (as loaded from storage).
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Creation time encoded in the id.
    ///
    /// Returns `None` for ids that do not carry a timestamp.
    #[must_use]
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Error parsing a [`UserId`] from its string form.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UserIdError {
    /// Not a UUID at all.
    #[error("invalid id: {0}")]
    Malformed(String),

    /// A UUID, but not a time-ordered one.
    #[error("invalid id: {0} is not a time-ordered id")]
    NotTimeOrdered(String),
}

impl FromStr for UserId {
    type Err = UserIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(|_| UserIdError::Malformed(s.to_string()))?;
        if uuid.get_version_num() != 7 {
            return Err(UserIdError::NotTimeOrdered(s.to_string()));
        }
        Ok(Self(uuid))
    }
}

/// Full user record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Internal identifier.
    pub id: UserId,
    /// Unique natural key (3–50 chars).
    pub username: String,
    /// Public display name (1–50 chars).
    pub display_name: String,
    /// Avatar URL (≤255 chars).
    pub image_url: Option<String>,
    /// Free-form status (≤200 chars).
    pub status_text: Option<String>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// A freshly registered user: display name defaults to the username.
    #[must_use]
    pub fn registered(username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            id: UserId::new(),
            display_name: username.clone(),
            username,
            image_url: None,
            status_text: None,
            updated_at: Utc::now(),
        }
    }

    /// Creation time, derived from the id.
    #[must_use]
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.id.created_at()
    }

    /// The public short projection of this user.
    #[must_use]
    pub fn short_projection(&self) -> UserShortProjection {
        UserShortProjection {
            id: self.id,
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            image_url: self.image_url.clone(),
            status_text: self.status_text.clone(),
        }
    }

    /// Check field-level constraints.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let username_len = self.username.chars().count();
        if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&username_len) {
            return Err(ValidationError::Username(username_len));
        }

        let display_name_len = self.display_name.chars().count();
        if display_name_len == 0 || display_name_len > DISPLAY_NAME_MAX_LEN {
            return Err(ValidationError::DisplayName(display_name_len));
        }

        if let Some(image_url) = &self.image_url {
            validate_image_url(image_url)?;
        }

        if let Some(status_text) = &self.status_text {
            let len = status_text.chars().count();
            if len > STATUS_TEXT_MAX_LEN {
                return Err(ValidationError::StatusText(len));
            }
        }

        Ok(())
    }
}

fn validate_image_url(image_url: &str) -> Result<(), ValidationError> {
    if image_url.chars().count() > IMAGE_URL_MAX_LEN {
        return Err(ValidationError::ImageUrlTooLong);
    }
    match url::Url::parse(image_url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(ValidationError::ImageUrl(image_url.to_string())),
    }
}

/// Field-level validation failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Username length out of range.
    #[error("username must be {USERNAME_MIN_LEN}-{USERNAME_MAX_LEN} characters, got {0}")]
    Username(usize),

    /// Display name length out of range.
    #[error("display name must be 1-{DISPLAY_NAME_MAX_LEN} characters, got {0}")]
    DisplayName(usize),

    /// Image URL longer than allowed.
    #[error("image url must be at most {IMAGE_URL_MAX_LEN} characters")]
    ImageUrlTooLong,

    /// Image URL is not an absolute http(s) URL.
    #[error("image url is not a valid url: {0}")]
    ImageUrl(String),

    /// Status text longer than allowed.
    #[error("status text must be at most {STATUS_TEXT_MAX_LEN} characters, got {0}")]
    StatusText(usize),
}

/// Short public projection of a user, the externally served read model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserShortProjection {
    /// Internal identifier.
    pub id: UserId,
    /// Unique natural key.
    pub username: String,
    /// Public display name.
    pub display_name: String,
    /// Avatar URL.
    pub image_url: Option<String>,
    /// Free-form status.
    pub status_text: Option<String>,
}

impl From<&User> for UserShortProjection {
    fn from(user: &User) -> Self {
        user.short_projection()
    }
}
