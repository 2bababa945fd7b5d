use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::MessageRef;

/// An in-progress interactive persona pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSelection {
    pub persona_id: String,
    /// The prompt message the user is expected to reply to.
    pub awaiting: MessageRef,
    created_at: Instant,
}

/// Per-user pending selections with lazy expiry and a size bound.
///
/// Lives only in process memory. An expired entry is never honored, whether
/// or not it has been swept yet.
pub struct PendingSelections {
    entries: Mutex<HashMap<i64, PendingSelection>>,
    ttl: Duration,
    capacity: usize,
}

impl PendingSelections {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    fn is_live(&self, entry: &PendingSelection, now: Instant) -> bool {
        now.duration_since(entry.created_at) < self.ttl
    }

    /// Record (or replace) the user's pending pick.
    pub fn insert(&self, user_id: i64, persona_id: String, awaiting: MessageRef) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if !entries.contains_key(&user_id) && entries.len() >= self.capacity {
            entries.retain(|_, e| self.is_live(e, now));
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.created_at)
                    .map(|(user, _)| *user);
                if let Some(user) = oldest {
                    entries.remove(&user);
                }
            }
        }

        entries.insert(
            user_id,
            PendingSelection {
                persona_id,
                awaiting,
                created_at: now,
            },
        );
    }

    /// Consume the user's pending pick if the message replies to the awaited
    /// prompt. A non-matching message leaves a live entry in place.
    pub fn take_matching(
        &self,
        user_id: i64,
        chat_id: i64,
        reply_to: Option<i64>,
    ) -> Option<PendingSelection> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let entry = entries.get(&user_id)?;
        if !self.is_live(entry, now) {
            entries.remove(&user_id);
            return None;
        }

        let awaited = entry.awaiting;
        if reply_to == Some(awaited.message_id) && chat_id == awaited.chat_id {
            entries.remove(&user_id)
        } else {
            None
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| self.is_live(e, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
