use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, UserId};

/// Events pushed from the server over a live connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Full set of identities holding a live connection. Clients replace
    /// their previous view with the latest snapshot they receive.
    OnlineUsers { users: Vec<UserId> },

    /// A message addressed to the connected user.
    NewMessage { message: ChatMessage },
}

/// Frames a client may send after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// The conversation thread currently open in the client, if any.
    Viewing {
        #[serde(default)]
        peer: Option<UserId>,
    },
}

impl ClientEvent {
    pub fn from_json(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
