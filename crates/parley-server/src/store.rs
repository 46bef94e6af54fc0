//! Async handle over the SQLite store.
//!
//! `rusqlite` is synchronous, so every call hops onto tokio's blocking pool
//! and takes the connection mutex there. No presence or counter lock is ever
//! held across these calls.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use parley_shared::{ChatMessage, MessageId, UserId};
use parley_store::{Database, StoreError, User};

#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Mutex<Database>>,
}

impl MessageStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open_at(path)?))
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| StoreError::Io(std::io::Error::other("database mutex poisoned")))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?
    }

    #[cfg(test)]
    pub async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        self.with_db(move |db| db.insert_user(&user)).await
    }

    pub async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        self.with_db(move |db| db.get_user(&id)).await
    }

    /// Apply `edit` to the stored profile and write it back in one step.
    /// Returns `None` if the user does not exist.
    pub async fn update_user<F>(&self, id: UserId, edit: F) -> Result<Option<User>, StoreError>
    where
        F: FnOnce(&mut User) + Send + 'static,
    {
        self.with_db(move |db| {
            let Some(mut user) = db.get_user(&id)? else {
                return Ok(None);
            };
            edit(&mut user);
            db.insert_user(&user)?;
            Ok(Some(user))
        })
        .await
    }

    pub async fn user_exists(&self, id: UserId) -> Result<bool, StoreError> {
        self.with_db(move |db| db.user_exists(&id)).await
    }

    pub async fn contacts(&self, viewer: UserId) -> Result<Vec<User>, StoreError> {
        self.with_db(move |db| db.list_users_except(&viewer)).await
    }

    pub async fn insert_message(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        self.with_db(move |db| {
            db.insert_message(&message)?;
            Ok(message)
        })
        .await
    }

    pub async fn get_message(&self, id: MessageId) -> Result<Option<ChatMessage>, StoreError> {
        self.with_db(move |db| db.get_message(id)).await
    }

    pub async fn conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.with_db(move |db| db.get_conversation(&a, &b)).await
    }

    pub async fn mark_seen(&self, id: MessageId) -> Result<bool, StoreError> {
        self.with_db(move |db| db.mark_seen(id)).await
    }

    pub async fn mark_conversation_seen(
        &self,
        viewer: UserId,
        sender: UserId,
    ) -> Result<usize, StoreError> {
        self.with_db(move |db| db.mark_conversation_seen(&viewer, &sender))
            .await
    }

    pub async fn unseen_by_sender(
        &self,
        viewer: UserId,
    ) -> Result<HashMap<UserId, u32>, StoreError> {
        self.with_db(move |db| db.count_unseen_by_sender(&viewer)).await
    }
}
