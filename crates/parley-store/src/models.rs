//! Records persisted in the SQLite database.
//!
//! Messages are stored as [`parley_shared::ChatMessage`] so the same value
//! flows from the store to the HTTP API and the live connections without
//! conversion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::UserId;

pub use parley_shared::ChatMessage;

/// A registered user as shown in contact lists.
///
/// Credentials live with the account service; only the public profile is
/// kept here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub full_name: String,
    pub bio: String,
    /// URL of the profile picture, if one was uploaded.
    pub profile_pic: Option<String>,
    pub created_at: DateTime<Utc>,
}
