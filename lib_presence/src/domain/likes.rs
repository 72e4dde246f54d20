//! # Post Likes
//!
//! Like/unlike of feed posts on top of the `OptimisticMutationCoordinator`.
//! A like is a `post_likes` row keyed `"{post}:{user}"`; unliking deletes it.
//! The heart and the counter flip at once and roll back together when the
//! write fails.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;

use crate::core::collab::{Filter, Persistence};
use crate::core::optimistic::{MutationNotice, MutationOutcome, OptimisticMutationCoordinator};
use crate::error::SyncError;

/// Backing table of likes.
pub const LIKES_TABLE: &str = "post_likes";

/// Row key of `user_id`'s like on `post_id`.
pub fn like_key(post_id: &str, user_id: &str) -> String {
    format!("{}:{}", post_id, user_id)
}

/// What the like button shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LikeState {
    /// The local user likes the post.
    pub liked: bool,
    /// Total likes on the post.
    pub count: u64,
}

impl LikeState {
    /// The state after pressing the button.
    pub fn toggled(&self) -> Self {
        if self.liked {
            Self {
                liked: false,
                count: self.count.saturating_sub(1),
            }
        } else {
            Self {
                liked: true,
                count: self.count + 1,
            }
        }
    }
}

/// Like service for one local user.
pub struct PostLikes {
    user_id: String,
    persistence: Arc<dyn Persistence>,
    coordinator: OptimisticMutationCoordinator<String, LikeState>,
}

impl PostLikes {
    /// Service acting as `user_id`.
    pub fn new(user_id: impl Into<String>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            user_id: user_id.into(),
            persistence,
            coordinator: OptimisticMutationCoordinator::new(),
        }
    }

    /// Reads the authoritative count and like bit of `post_id`.
    pub async fn refresh(&self, post_id: &str) -> Result<LikeState, SyncError> {
        let on_post = Filter::all().eq("post_id", post_id);
        let count = self.persistence.count(LIKES_TABLE, &on_post).await?;
        let mine = self
            .persistence
            .query(LIKES_TABLE, &on_post.eq("user_id", self.user_id.as_str()))
            .await?;
        let state = LikeState {
            liked: !mine.is_empty(),
            count,
        };
        self.coordinator.seed(post_id.to_string(), state);
        Ok(state)
    }

    /// Flips the like on `post_id` optimistically and writes it.
    pub async fn toggle(&self, post_id: &str) -> Result<MutationOutcome<LikeState>, SyncError> {
        let key = like_key(post_id, &self.user_id);
        let row = json!({ "post_id": post_id, "user_id": self.user_id });
        let persistence = Arc::clone(&self.persistence);

        self.coordinator
            .invoke(post_id.to_string(), LikeState::toggled, move |next| async move {
                if next.liked {
                    persistence.upsert(LIKES_TABLE, &key, row).await
                } else {
                    persistence.delete(LIKES_TABLE, &key).await
                }
            })
            .await
    }

    /// What the button shows for `post_id` right now.
    pub fn state(&self, post_id: &str) -> LikeState {
        self.coordinator.value(&post_id.to_string())
    }

    /// Display changes of every post.
    pub fn subscribe(&self) -> broadcast::Receiver<MutationNotice<String, LikeState>> {
        self.coordinator.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;

    fn like_row(post: &str, user: &str) -> serde_json::Value {
        json!({ "post_id": post, "user_id": user })
    }

    #[tokio::test]
    async fn test_refresh_reads_count_and_own_like() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(LIKES_TABLE, "p1:ana", like_row("p1", "ana"), 1);
        backend.seed(LIKES_TABLE, "p1:me", like_row("p1", "me"), 1);
        backend.seed(LIKES_TABLE, "p2:bo", like_row("p2", "bo"), 1);
        let likes = PostLikes::new("me", backend);

        let state = likes.refresh("p1").await.expect("reads ok");
        assert_eq!(state, LikeState { liked: true, count: 2 });
        assert_eq!(likes.state("p1"), state);
    }

    #[tokio::test]
    async fn test_toggle_writes_and_unwrites_row() {
        let backend = Arc::new(MemoryBackend::new());
        let likes = PostLikes::new("me", backend.clone());
        likes.refresh("p1").await.expect("reads ok");

        let liked = likes.toggle("p1").await.expect("like written");
        assert_eq!(liked, MutationOutcome::Committed(LikeState { liked: true, count: 1 }));
        assert_eq!(backend.row(LIKES_TABLE, "p1:me").map(|r| r.payload), Some(like_row("p1", "me")));

        likes.toggle("p1").await.expect("unlike written");
        assert!(backend.row(LIKES_TABLE, "p1:me").is_none());
        assert_eq!(likes.state("p1"), LikeState::default());
    }

    #[tokio::test]
    async fn test_failed_toggle_rolls_back_heart_and_count() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(LIKES_TABLE, "p1:ana", like_row("p1", "ana"), 1);
        let likes = PostLikes::new("me", backend.clone());
        likes.refresh("p1").await.expect("reads ok");

        backend.fail_next_writes(1);
        let result = likes.toggle("p1").await;

        assert!(matches!(result, Err(SyncError::WriteFailed(_))));
        assert_eq!(likes.state("p1"), LikeState { liked: false, count: 1 });
    }
}
