//! # Domain Payloads
//!
//! The concrete state the riders app keeps in sync through the generic core:
//!
//! - **`location`**: live rider map (`rider_locations`).
//! - **`typing`**: typing indicators per conversation (`typing_status`).
//! - **`message`**: direct messages per conversation (`messages`).
//! - **`profile`**: rider profiles, the enrichment record of all of the above.
//! - **`likes`**: optimistic like/unlike of feed posts (`post_likes`).

/// Live rider positions.
pub mod location;
/// Optimistic like toggles.
pub mod likes;
/// Conversation messages.
pub mod message;
/// Rider profiles and their persistence-backed source.
pub mod profile;
/// Typing indicators.
pub mod typing;

pub use likes::{LikeState, PostLikes};
pub use location::{LocationMap, RiderLocation};
pub use message::{ChatMessage, Conversation};
pub use profile::{PersistedProfiles, RiderProfile};
pub use typing::TypingState;
