//! Presence registry: which users hold a live connection right now.
//!
//! The registry maps each [`UserId`] to at most one [`LiveConnection`].
//! Mutations never perform I/O. They hand back a [`PresenceBroadcast`]
//! describing who must be told about the new online set, and the caller
//! dispatches it after the lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_shared::protocol::ServerEvent;
use parley_shared::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Live connection handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The connection task has exited; its queue is gone.
    Closed,
    /// The peer is not draining its queue fast enough.
    Full,
}

/// Registry-side handle to one client connection.
///
/// Cloning is cheap. The connection task owns the matching
/// [`ConnectionEndpoint`] and is the only reader of the outbound queue.
#[derive(Debug, Clone)]
pub struct LiveConnection {
    pub id: ConnectionId,
    pub user: UserId,
    pub connected_since: DateTime<Utc>,
    outbound: mpsc::Sender<ServerEvent>,
    close: Arc<Notify>,
    viewing: Option<UserId>,
}

/// The connection task's half: queued events plus the close signal.
pub struct ConnectionEndpoint {
    pub events: mpsc::Receiver<ServerEvent>,
    pub close: CloseSignal,
}

pub struct CloseSignal(Arc<Notify>);

impl CloseSignal {
    /// Resolves once the registry asks this connection to shut down.
    pub async fn requested(&self) {
        self.0.notified().await
    }
}

impl LiveConnection {
    pub fn new(user: UserId, queue_capacity: usize) -> (Self, ConnectionEndpoint) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let close = Arc::new(Notify::new());

        let conn = Self {
            id: ConnectionId(Uuid::new_v4()),
            user,
            connected_since: Utc::now(),
            outbound: tx,
            close: close.clone(),
            viewing: None,
        };
        let endpoint = ConnectionEndpoint {
            events: rx,
            close: CloseSignal(close),
        };
        (conn, endpoint)
    }

    /// Queue an event without waiting. A stalled peer only fills its own
    /// queue.
    pub fn push(&self, event: ServerEvent) -> Result<(), PushError> {
        self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Ask the connection task to close its transport.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// The peer whose thread this client reports having open.
    pub fn viewing(&self) -> Option<&UserId> {
        self.viewing.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

/// A presence snapshot and the connections it must be sent to.
#[derive(Debug)]
pub struct PresenceBroadcast {
    online: Vec<UserId>,
    targets: Vec<LiveConnection>,
}

impl PresenceBroadcast {
    pub fn online(&self) -> &[UserId] {
        &self.online
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Send the snapshot to every target. Returns how many accepted it.
    pub fn dispatch(self) -> usize {
        let mut delivered = 0;
        for conn in &self.targets {
            let event = ServerEvent::OnlineUsers {
                users: self.online.clone(),
            };
            match conn.push(event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        user = %conn.user,
                        connection = %conn.id,
                        reason = ?e,
                        "Dropping presence update"
                    );
                }
            }
        }

        debug!(
            online = self.online.len(),
            delivered,
            targets = self.targets.len(),
            "Presence broadcast dispatched"
        );
        delivered
    }
}

/// Outcome of [`PresenceRegistry::register`].
#[derive(Debug)]
pub struct Registration {
    /// The previous connection for the same user, already told to close.
    pub displaced: Option<LiveConnection>,
    pub broadcast: PresenceBroadcast,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct PresenceRegistry {
    entries: Arc<RwLock<HashMap<UserId, LiveConnection>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `conn` as the user's live connection. Last connection wins:
    /// an existing entry is closed and replaced.
    pub async fn register(&self, conn: LiveConnection) -> Registration {
        let mut entries = self.entries.write().await;

        let displaced = entries.remove(&conn.user);
        if let Some(old) = &displaced {
            old.close();
            info!(
                user = %old.user,
                old_connection = %old.id,
                new_connection = %conn.id,
                "Replacing existing live connection"
            );
        }

        info!(
            user = %conn.user,
            connection = %conn.id,
            online = entries.len() + 1,
            "User online"
        );
        entries.insert(conn.user.clone(), conn);

        Registration {
            displaced,
            broadcast: broadcast_for(&entries),
        }
    }

    /// Remove the user's entry, whichever connection it belongs to, and
    /// tell that connection to close (explicit logout). Returns `None` if
    /// the user was not registered.
    pub async fn deregister(&self, user: &UserId) -> Option<PresenceBroadcast> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(user)?;
        removed.close();

        info!(
            user = %user,
            connection = %removed.id,
            online = entries.len(),
            "User offline"
        );
        Some(broadcast_for(&entries))
    }

    /// Remove the user's entry only if it still belongs to `id`. A
    /// connection that was replaced must not evict its successor when it
    /// finally closes.
    pub async fn deregister_connection(
        &self,
        user: &UserId,
        id: ConnectionId,
    ) -> Option<PresenceBroadcast> {
        let mut entries = self.entries.write().await;
        if entries.get(user).map(|c| c.id) != Some(id) {
            debug!(user = %user, connection = %id, "Stale connection closed; entry untouched");
            return None;
        }

        entries.remove(user);
        info!(
            user = %user,
            connection = %id,
            online = entries.len(),
            "User offline"
        );
        Some(broadcast_for(&entries))
    }

    pub async fn lookup(&self, user: &UserId) -> Option<LiveConnection> {
        self.entries.read().await.get(user).cloned()
    }

    /// Every online user, sorted.
    pub async fn snapshot(&self) -> Vec<UserId> {
        let entries = self.entries.read().await;
        sorted_users(&entries)
    }

    /// Record which thread the client on connection `id` has open.
    /// Returns `false` if that connection is no longer the user's entry.
    pub async fn set_viewing(
        &self,
        user: &UserId,
        id: ConnectionId,
        peer: Option<UserId>,
    ) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(user) {
            Some(conn) if conn.id == id => {
                conn.viewing = peer;
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Signal every live connection to close (process shutdown). Entries are
    /// removed by each connection's own exit path.
    pub async fn close_all(&self) -> usize {
        let entries = self.entries.read().await;
        for conn in entries.values() {
            conn.close();
        }
        entries.len()
    }
}

fn sorted_users(entries: &HashMap<UserId, LiveConnection>) -> Vec<UserId> {
    let mut users: Vec<UserId> = entries.keys().cloned().collect();
    users.sort();
    users
}

fn broadcast_for(entries: &HashMap<UserId, LiveConnection>) -> PresenceBroadcast {
    PresenceBroadcast {
        online: sorted_users(entries),
        targets: entries.values().cloned().collect(),
    }
}
