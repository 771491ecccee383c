//! Optimistic local mutations.
//!
//! One reusable discipline for every "show it now, confirm it later" flow:
//! stage an entity under a temporary id, replace it with the confirmed row
//! on success, remove it on failure. The push listener uses the same set to
//! recognize its own inserts instead of duplicating them.

use uuid::Uuid;
use std::collections::HashSet;

const TEMP_PREFIX: &str = "temp-";

/// Anything that can be staged optimistically inside a display list.
pub trait PendingEntity {
    fn entity_id(&self) -> &str;
}

impl PendingEntity for crate::models::Message {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

#[derive(Default)]
pub struct PendingOps {
    open: HashSet<String>,
}

impl PendingOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh temporary id and records it as outstanding.
    pub fn stage(&mut self) -> String {
        let id = format!("{TEMP_PREFIX}{}", Uuid::new_v4());
        self.open.insert(id.clone());
        id
    }

    pub fn is_temp(id: &str) -> bool {
        id.starts_with(TEMP_PREFIX)
    }

    pub fn has_open(&self) -> bool {
        !self.open.is_empty()
    }

    /// Resolves a staged entry with the server-confirmed row. If the push
    /// listener already delivered the confirmed row, the temp entry is
    /// dropped instead of replaced, so exactly one copy remains either way.
    pub fn confirm<T: PendingEntity>(&mut self, items: &mut Vec<T>, temp_id: &str, confirmed: T) -> bool {
        if !self.open.remove(temp_id) {
            return false;
        }
        if items.iter().any(|m| m.entity_id() == confirmed.entity_id()) {
            items.retain(|m| m.entity_id() != temp_id);
        } else if let Some(pos) = items.iter().position(|m| m.entity_id() == temp_id) {
            items[pos] = confirmed;
        } else {
            items.push(confirmed);
        }
        true
    }

    /// Rolls a failed operation back; nothing remains for that attempt.
    pub fn rollback<T: PendingEntity>(&mut self, items: &mut Vec<T>, temp_id: &str) -> bool {
        if !self.open.remove(temp_id) {
            return false;
        }
        items.retain(|m| m.entity_id() != temp_id);
        true
    }
}
