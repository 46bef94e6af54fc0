//! Per-viewer counts of messages that arrived while the viewer was away.
//!
//! Counts live only in memory and are bumped by the router between contact
//! fetches. Every fetch replaces a viewer's counts with a fresh reading of
//! unseen messages from the store (see [`UnseenCounters::reconcile`]), which
//! also covers live pushes the viewer never looked at and pushes that were
//! dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use parley_shared::UserId;

/// viewer -> sender -> count. Zero counts are never stored.
type CountMap = HashMap<UserId, HashMap<UserId, u32>>;

#[derive(Clone, Default)]
pub struct UnseenCounters {
    counts: Arc<RwLock<CountMap>>,
}

impl UnseenCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new count for the pair.
    pub async fn increment(&self, viewer: &UserId, sender: &UserId) -> u32 {
        let mut counts = self.counts.write().await;
        let count = counts
            .entry(viewer.clone())
            .or_default()
            .entry(sender.clone())
            .or_insert(0);
        *count = count.saturating_add(1);
        debug!(viewer = %viewer, sender = %sender, count = *count, "Unseen count incremented");
        *count
    }

    pub async fn reset(&self, viewer: &UserId, sender: &UserId) {
        let mut counts = self.counts.write().await;
        if let Some(per_sender) = counts.get_mut(viewer) {
            if per_sender.remove(sender).is_some() {
                debug!(viewer = %viewer, sender = %sender, "Unseen count reset");
            }
            if per_sender.is_empty() {
                counts.remove(viewer);
            }
        }
    }

    #[cfg(test)]
    pub async fn get(&self, viewer: &UserId, sender: &UserId) -> u32 {
        let counts = self.counts.read().await;
        counts
            .get(viewer)
            .and_then(|m| m.get(sender))
            .copied()
            .unwrap_or(0)
    }

    /// All non-zero counts for `viewer`, keyed by sender.
    pub async fn get_all(&self, viewer: &UserId) -> HashMap<UserId, u32> {
        let counts = self.counts.read().await;
        counts.get(viewer).cloned().unwrap_or_default()
    }

    /// Replace `viewer`'s counts with `stored`, a reading of their unseen
    /// messages from the store, and return what was installed.
    ///
    /// Every routed message is persisted before it is routed, so the store
    /// reading already includes anything an in-flight increment is about to
    /// add. The reading is what the caller reports; an increment that lands
    /// after it is corrected by the next reconcile.
    pub async fn reconcile(
        &self,
        viewer: &UserId,
        stored: HashMap<UserId, u32>,
    ) -> HashMap<UserId, u32> {
        let stored: HashMap<UserId, u32> = stored.into_iter().filter(|(_, n)| *n > 0).collect();

        let mut counts = self.counts.write().await;
        if stored.is_empty() {
            counts.remove(viewer);
        } else {
            counts.insert(viewer.clone(), stored.clone());
        }
        debug!(viewer = %viewer, senders = stored.len(), "Unseen counts reconciled with store");
        stored
    }
}
