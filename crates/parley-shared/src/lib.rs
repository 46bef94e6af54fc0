//! # parley-shared
//!
//! Types shared by the Parley store and server: user and message
//! identities, the chat message record, the JSON protocol spoken over live
//! connections, and the signed session-token format.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod token;
pub mod types;

pub use error::{MessageError, TokenError};
pub use types::{ChatMessage, MessageId, UserId};
