//! Direct-message rows of one conversation, merged from the `messages`
//! channel filtered by `conversation_id`.

use serde::{Deserialize, Serialize};

use crate::core::entity::EntityPayload;
use crate::core::merger::ChangeStreamMerger;
use crate::domain::profile::RiderProfile;

/// Backing table of chat messages.
pub const MESSAGES_TABLE: &str = "messages";

/// One chat message. Messages have no live bit; they stay until deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// Author, also the enrichment key.
    pub sender_id: String,
    /// Message text.
    #[serde(default)]
    pub content: String,
    /// Read receipt.
    #[serde(default)]
    pub is_read: bool,
}

impl EntityPayload for ChatMessage {
    fn enrichment_key<'a>(&'a self, _entity_id: &'a str) -> Option<&'a str> {
        Some(&self.sender_id)
    }
}

/// Merger behind an open conversation.
pub type Conversation = ChangeStreamMerger<ChatMessage, RiderProfile>;

/// Messages not yet read by `reader` (their own messages excluded).
pub fn unread_count(conversation: &Conversation, reader: &str) -> usize {
    conversation
        .store()
        .get_all()
        .values()
        .filter(|m| m.payload.sender_id != reader && !m.payload.is_read)
        .count()
}
