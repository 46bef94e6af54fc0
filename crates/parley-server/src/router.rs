//! Routes freshly persisted messages to their recipient.
//!
//! A recipient with a live connection gets the message pushed immediately;
//! one without gets their unseen count for the sender bumped instead.

use tracing::{debug, warn};

use parley_shared::protocol::ServerEvent;
use parley_shared::ChatMessage;

use crate::presence::{PresenceRegistry, PushError};
use crate::store::MessageStore;
use crate::unseen::UnseenCounters;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Pushed to a recipient who has the sender's thread open.
    DeliveredSeen,
    /// Pushed to a recipient looking elsewhere; the client shows it as unread.
    DeliveredUnseen,
    /// Recipient offline; their unseen count for the sender is now `unseen`.
    Queued { unseen: u32 },
    /// The push failed (connection gone or its queue full). Not retried and
    /// not counted.
    Dropped(PushError),
}

#[derive(Clone)]
pub struct MessageRouter {
    presence: PresenceRegistry,
    unseen: UnseenCounters,
    store: MessageStore,
}

impl MessageRouter {
    pub fn new(presence: PresenceRegistry, unseen: UnseenCounters, store: MessageStore) -> Self {
        Self {
            presence,
            unseen,
            store,
        }
    }

    /// Route a message that has already been written to the store. On the
    /// seen path `message.seen` is set to `true`.
    pub async fn route(&self, message: &mut ChatMessage) -> RouteOutcome {
        let Some(conn) = self.presence.lookup(&message.receiver_id).await else {
            let unseen = self
                .unseen
                .increment(&message.receiver_id, &message.sender_id)
                .await;
            debug!(
                message = %message.id,
                recipient = %message.receiver_id,
                unseen,
                "Recipient offline, message queued"
            );
            return RouteOutcome::Queued { unseen };
        };

        let viewing_sender = conn.viewing() == Some(&message.sender_id);
        if viewing_sender {
            message.seen = true;
        }

        let event = ServerEvent::NewMessage {
            message: message.clone(),
        };
        if let Err(e) = conn.push(event) {
            warn!(
                message = %message.id,
                recipient = %message.receiver_id,
                connection = %conn.id,
                reason = ?e,
                "Live delivery failed, dropping push"
            );
            message.seen = false;
            return RouteOutcome::Dropped(e);
        }

        if !viewing_sender {
            debug!(message = %message.id, recipient = %message.receiver_id, "Delivered unseen");
            return RouteOutcome::DeliveredUnseen;
        }

        // Already on screen; a failed write is repaired by the next thread fetch.
        match self.store.mark_seen(message.id).await {
            Ok(true) => {}
            Ok(false) => warn!(message = %message.id, "Delivered message missing from store"),
            Err(e) => warn!(message = %message.id, error = %e, "Failed to persist seen flag"),
        }
        debug!(message = %message.id, recipient = %message.receiver_id, "Delivered seen");
        RouteOutcome::DeliveredSeen
    }
}
