//! # Typing Indicators
//!
//! One `typing_status` row per (conversation, user). The local user's
//! keystrokes go through an `OutboundReporter` fed by `report`, so a burst of
//! keystrokes costs at most one write per interval. The indicator disappears
//! once the row is cleared or stops being refreshed inside the typing window.

use serde::{Deserialize, Serialize};

use crate::core::entity::EntityPayload;
use crate::core::store::EntitySnapshotStore;

/// Backing table of typing indicators.
pub const TYPING_TABLE: &str = "typing_status";

/// Row key of `user_id`'s indicator in `conversation_id`.
pub fn typing_key(conversation_id: &str, user_id: &str) -> String {
    format!("{}:{}", conversation_id, user_id)
}

/// Whether one user is typing in one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingState {
    /// Conversation the indicator belongs to.
    pub conversation_id: String,
    /// The typist.
    pub user_id: String,
    /// Live bit.
    #[serde(default)]
    pub is_typing: bool,
}

impl TypingState {
    /// Indicator for `user_id` in `conversation_id`.
    pub fn new(conversation_id: impl Into<String>, user_id: impl Into<String>, is_typing: bool) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            is_typing,
        }
    }
}

impl EntityPayload for TypingState {
    fn live_flag(&self) -> Option<bool> {
        Some(self.is_typing)
    }

    fn set_live_flag(&mut self, live: bool) {
        self.is_typing = live;
    }

    fn enrichment_key<'a>(&'a self, _entity_id: &'a str) -> Option<&'a str> {
        Some(&self.user_id)
    }
}

/// Users typing right now, excluding `local_user`, sorted.
pub fn active_typists(
    store: &EntitySnapshotStore<TypingState>,
    local_user: &str,
    now_millis: i64,
    window_millis: i64,
) -> Vec<String> {
    let mut users: Vec<String> = store
        .live_view(now_millis, window_millis)
        .into_iter()
        .map(|entity| entity.payload.user_id)
        .filter(|user| user != local_user)
        .collect();
    users.sort();
    users.dedup();
    users
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::PresenceConfig;

    #[test]
    fn test_active_typists_excludes_self_and_stale() {
        let store = EntitySnapshotStore::new("c1");
        store.apply(&typing_key("c1", "me"), TypingState::new("c1", "me", true), 9_000);
        store.apply(&typing_key("c1", "ana"), TypingState::new("c1", "ana", true), 9_000);
        store.apply(&typing_key("c1", "bo"), TypingState::new("c1", "bo", true), 1_000);
        store.apply(&typing_key("c1", "cy"), TypingState::new("c1", "cy", false), 9_500);

        let window = PresenceConfig::default().typing_window_millis();
        assert_eq!(active_typists(&store, "me", 10_000, window), vec!["ana".to_string()]);
    }

    #[test]
    fn test_enrichment_keyed_by_user() {
        let state = TypingState::new("c1", "ana", true);
        assert_eq!(state.enrichment_key("c1:ana"), Some("ana"));
        assert_eq!(typing_key("c1", "ana"), "c1:ana");
    }
}
