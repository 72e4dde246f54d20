//! # Sync Session
//!
//! Scope object for one signed-in user. It owns the collaborators, the timing
//! configuration and a root `CancellationToken`, and builds every store,
//! merger, reporter and like service the app needs. Each of those is bound to
//! a child token, so one `teardown` reaches all of them.
//!
//! Each logical channel gets one merger per session: asking for the same map,
//! conversation or typing channel again returns the running instance. Profile
//! enrichment is memoized once for the whole session and shared by every
//! scope.
//!
//! - **`teardown`**: cancels everything immediately. In-flight fetches and
//!   writes may finish, but their results are discarded.
//! - **`shutdown`**: publishes the offline state of every reporter first,
//!   then tears down and waits for the merger tasks to exit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configs::PresenceConfig;
use crate::core::collab::{ChannelSpec, DeviceSensor, Filter, Persistence, PubSub};
use crate::core::enrichment::{EnrichmentCache, EnrichmentSource};
use crate::core::entity::EntityPayload;
use crate::core::merger::ChangeStreamMerger;
use crate::core::reporter::OutboundReporter;
use crate::core::store::EntitySnapshotStore;
use crate::domain::likes::PostLikes;
use crate::domain::location::{LocationMap, RiderLocation, LOCATIONS_TABLE};
use crate::domain::message::{Conversation, MESSAGES_TABLE};
use crate::domain::profile::{PersistedProfiles, RiderProfile};
use crate::domain::typing::{typing_key, TypingState, TYPING_TABLE};

/// Merger behind a conversation's typing indicators.
pub type TypingIndicators = ChangeStreamMerger<TypingState, RiderProfile>;

#[derive(Default)]
struct SessionScopes {
    tasks: Vec<JoinHandle<()>>,
    location_map: Option<Arc<LocationMap>>,
    conversations: HashMap<String, Arc<Conversation>>,
    typing_indicators: HashMap<String, Arc<TypingIndicators>>,
    location_reporters: Vec<Arc<OutboundReporter<RiderLocation>>>,
    typing_reporters: Vec<Arc<OutboundReporter<TypingState>>>,
}

/// Owner of every sync scope of one user session.
pub struct SyncSession {
    user_id: String,
    config: PresenceConfig,
    persistence: Arc<dyn Persistence>,
    pubsub: Arc<dyn PubSub>,
    profiles: Arc<EnrichmentCache<RiderProfile>>,
    root: CancellationToken,
    scopes: Mutex<SessionScopes>,
}

impl SyncSession {
    /// Session for `user_id`. Profiles are resolved from `persistence`.
    pub fn new(
        user_id: impl Into<String>,
        config: PresenceConfig,
        persistence: Arc<dyn Persistence>,
        pubsub: Arc<dyn PubSub>,
    ) -> Self {
        let root = CancellationToken::new();
        let source: Arc<dyn EnrichmentSource<RiderProfile>> =
            Arc::new(PersistedProfiles::new(Arc::clone(&persistence)));
        Self {
            user_id: user_id.into(),
            config,
            persistence,
            pubsub,
            profiles: Arc::new(EnrichmentCache::new(source, root.clone())),
            root,
            scopes: Mutex::new(SessionScopes::default()),
        }
    }

    /// Replaces the profile source. Call before opening any scope.
    pub fn with_profiles(mut self, source: Arc<dyn EnrichmentSource<RiderProfile>>) -> Self {
        self.profiles = Arc::new(EnrichmentCache::new(source, self.root.clone()));
        self
    }

    /// Session-wide profile memo shared by every scope.
    pub fn profiles(&self) -> &Arc<EnrichmentCache<RiderProfile>> {
        &self.profiles
    }

    /// The signed-in user.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Timing configuration in effect.
    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// True once `teardown` or `shutdown` ran.
    pub fn is_torn_down(&self) -> bool {
        self.root.is_cancelled()
    }

    fn scopes(&self) -> MutexGuard<'_, SessionScopes> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_merger<P>(
        &self,
        scopes: &mut SessionScopes,
        name: &str,
        channel: ChannelSpec,
    ) -> Arc<ChangeStreamMerger<P, RiderProfile>>
    where
        P: EntityPayload + DeserializeOwned,
    {
        let merger = Arc::new(
            ChangeStreamMerger::new(
                channel,
                Arc::new(EntitySnapshotStore::new(name)),
                Arc::clone(&self.persistence),
                Arc::clone(&self.pubsub),
                self.root.child_token(),
            )
            .with_enrichment(Arc::clone(&self.profiles))
            .with_options(self.config.merger_options()),
        );
        scopes.tasks.push(Arc::clone(&merger).spawn());
        merger
    }

    /// Live rider map over every rider's location row. Started on first use.
    pub fn location_map(&self) -> Arc<LocationMap> {
        let mut scopes = self.scopes();
        if let Some(map) = &scopes.location_map {
            return Arc::clone(map);
        }
        let map = self.start_merger(&mut scopes, "location_map", ChannelSpec::table(LOCATIONS_TABLE));
        scopes.location_map = Some(Arc::clone(&map));
        map
    }

    /// Messages of one conversation.
    pub fn conversation(&self, conversation_id: &str) -> Arc<Conversation> {
        let mut scopes = self.scopes();
        if let Some(open) = scopes.conversations.get(conversation_id) {
            return Arc::clone(open);
        }
        let merger = self.start_merger(
            &mut scopes,
            &format!("conversation:{}", conversation_id),
            ChannelSpec::table(MESSAGES_TABLE)
                .with_filter(Filter::all().eq("conversation_id", conversation_id)),
        );
        scopes
            .conversations
            .insert(conversation_id.to_string(), Arc::clone(&merger));
        merger
    }

    /// Typing indicators of one conversation.
    pub fn typing_indicators(&self, conversation_id: &str) -> Arc<TypingIndicators> {
        let mut scopes = self.scopes();
        if let Some(open) = scopes.typing_indicators.get(conversation_id) {
            return Arc::clone(open);
        }
        let merger = self.start_merger(
            &mut scopes,
            &format!("typing:{}", conversation_id),
            ChannelSpec::table(TYPING_TABLE)
                .with_filter(Filter::all().eq("conversation_id", conversation_id)),
        );
        scopes
            .typing_indicators
            .insert(conversation_id.to_string(), Arc::clone(&merger));
        merger
    }

    /// Publishes the user's own position from `sensor`. Every accepted write
    /// is mirrored into the location map, so the user sees their own marker
    /// without waiting for the echo.
    pub fn location_reporter(
        &self,
        sensor: Arc<dyn DeviceSensor<RiderLocation>>,
    ) -> Arc<OutboundReporter<RiderLocation>> {
        let map = self.location_map();
        let reporter = Arc::new(OutboundReporter::start_with_store(
            self.user_id.as_str(),
            LOCATIONS_TABLE,
            Arc::clone(&self.persistence),
            Some(Arc::clone(map.store())),
            self.config.location_reporter_options(),
            self.root.child_token(),
        ));
        reporter.attach_sensor(sensor);
        self.scopes().location_reporters.push(Arc::clone(&reporter));
        reporter
    }

    /// Publishes the user's typing bit in one conversation. Feed it with
    /// `report(TypingState::new(conversation, user, true))` on keystrokes.
    pub fn typing_reporter(&self, conversation_id: &str) -> Arc<OutboundReporter<TypingState>> {
        let reporter = Arc::new(OutboundReporter::start(
            typing_key(conversation_id, &self.user_id),
            TYPING_TABLE,
            Arc::clone(&self.persistence),
            self.config.typing_reporter_options(),
            self.root.child_token(),
        ));
        self.scopes().typing_reporters.push(Arc::clone(&reporter));
        reporter
    }

    /// Like service acting as the session user.
    pub fn likes(&self) -> PostLikes {
        PostLikes::new(self.user_id.as_str(), Arc::clone(&self.persistence))
    }

    /// Cancels every scope built from this session.
    pub fn teardown(&self) {
        if !self.root.is_cancelled() {
            tracing::info!(user = %self.user_id, "tearing down sync session");
        }
        self.root.cancel();
    }

    /// Goes offline on every reporter, tears down, and waits for the merger
    /// tasks. Offline publish failures are logged and do not stop teardown.
    pub async fn shutdown(&self) {
        let (tasks, locations, typists) = {
            let mut scopes = self.scopes();
            (
                std::mem::take(&mut scopes.tasks),
                std::mem::take(&mut scopes.location_reporters),
                std::mem::take(&mut scopes.typing_reporters),
            )
        };

        for reporter in &locations {
            if let Err(e) = reporter.go_offline().await {
                tracing::warn!(actor = %reporter.actor_id(), error = %e, "location offline publish failed");
            }
        }
        for reporter in &typists {
            if let Err(e) = reporter.go_offline().await {
                tracing::warn!(actor = %reporter.actor_id(), error = %e, "typing offline publish failed");
            }
        }

        self.teardown();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "merger task ended abnormally");
            }
        }
        tracing::info!(user = %self.user_id, "sync session shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryBackend, ScriptedSensor};
    use crate::core::enrichment::Enrichment;
    use crate::core::merger::MergerState;
    use crate::core::now_millis;
    use crate::domain::profile::PROFILES_TABLE;
    use serde_json::json;
    use std::time::Duration;

    fn quick_config() -> PresenceConfig {
        PresenceConfig {
            location_min_interval_ms: 20,
            typing_min_interval_ms: 20,
            reconnect_base_delay_ms: 5,
            reconnect_max_delay_ms: 20,
            ..PresenceConfig::default()
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    #[tokio::test]
    async fn test_reporter_echo_reaches_map_with_profile() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(
            PROFILES_TABLE,
            "me",
            json!({ "id": "me", "display_name": "Me", "level": 3 }),
            1,
        );
        let session = SyncSession::new("me", quick_config(), backend.clone(), backend.clone());
        let map = session.location_map();
        let mut state = map.state();
        state
            .wait_for(|s| *s == MergerState::Live)
            .await
            .expect("merger running");

        let sensor = Arc::new(ScriptedSensor::<RiderLocation>::new());
        let reporter = session.location_reporter(sensor.clone());
        sensor.push(Ok(RiderLocation::online(37.98, 23.72)));

        eventually(|| {
            map.view()
                .first()
                .map(|e| matches!(e.enrichment, Enrichment::Resolved(_)))
                .unwrap_or(false)
        })
        .await;
        let entry = &map.live_view(now_millis(), session.config().staleness_window_millis())[0];
        assert_eq!(entry.entity.entity_id, "me");
        assert_eq!(entry.enrichment.value_or_default().display_name, "Me");
        assert!(reporter.last_published().is_some());

        session.shutdown().await;
        let last = backend.row(LOCATIONS_TABLE, "me").expect("row kept");
        assert_eq!(last.payload["is_online"], false);
        assert!(session.is_torn_down());
        assert!(map.store().is_empty());
    }

    #[tokio::test]
    async fn test_typing_round_trip_between_two_sessions() {
        let backend = Arc::new(MemoryBackend::new());
        let ana = SyncSession::new("ana", quick_config(), backend.clone(), backend.clone());
        let me = SyncSession::new("me", quick_config(), backend.clone(), backend.clone());

        let indicators = me.typing_indicators("c1");
        let mut state = indicators.state();
        state
            .wait_for(|s| *s == MergerState::Live)
            .await
            .expect("merger running");

        let typing = ana.typing_reporter("c1");
        typing.report(TypingState::new("c1", "ana", true));
        eventually(|| indicators.store().get("c1:ana").is_some()).await;

        ana.shutdown().await;
        eventually(|| indicators.store().get("c1:ana").is_none()).await;
        assert!(indicators.store().retained("c1:ana").is_some());

        me.teardown();
    }

    #[tokio::test]
    async fn test_profile_fetched_once_across_scopes() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(
            PROFILES_TABLE,
            "ana",
            json!({ "id": "ana", "display_name": "Ana", "level": 2 }),
            1,
        );
        backend.seed(
            LOCATIONS_TABLE,
            "ana",
            json!({ "latitude": 1.0, "longitude": 2.0, "is_online": true }),
            now_millis(),
        );
        backend.seed(
            MESSAGES_TABLE,
            "m1",
            json!({ "conversation_id": "c1", "sender_id": "ana", "content": "hi", "is_read": false }),
            now_millis(),
        );
        let session = SyncSession::new("me", quick_config(), backend.clone(), backend.clone());

        let map = session.location_map();
        eventually(|| {
            map.view()
                .first()
                .map(|e| matches!(e.enrichment, Enrichment::Resolved(_)))
                .unwrap_or(false)
        })
        .await;

        let chat = session.conversation("c1");
        eventually(|| {
            chat.view()
                .first()
                .map(|e| matches!(e.enrichment, Enrichment::Resolved(_)))
                .unwrap_or(false)
        })
        .await;

        assert_eq!(backend.query_calls(PROFILES_TABLE), 1);
        assert_eq!(session.profiles().len(), 1);
        session.teardown();
    }

    #[tokio::test]
    async fn test_reopening_a_channel_reuses_the_running_merger() {
        let backend = Arc::new(MemoryBackend::new());
        let session = SyncSession::new("me", quick_config(), backend.clone(), backend.clone());

        let chat = session.conversation("c1");
        let typing = session.typing_indicators("c1");
        let map = session.location_map();
        assert!(Arc::ptr_eq(&chat, &session.conversation("c1")));
        assert!(Arc::ptr_eq(&typing, &session.typing_indicators("c1")));
        assert!(Arc::ptr_eq(&map, &session.location_map()));

        for mut rx in [chat.state(), map.state()] {
            rx.wait_for(|s| *s == MergerState::Live).await.expect("live");
        }
        let mut typing_state = typing.state();
        typing_state.wait_for(|s| *s == MergerState::Live).await.expect("live");
        assert_eq!(backend.subscriber_count(), 3);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_own_position_visible_before_echo() {
        // Writes land in `store` but the bus never echoes them.
        let store = Arc::new(MemoryBackend::new());
        let bus = Arc::new(MemoryBackend::new());
        let session = SyncSession::new("me", quick_config(), store.clone(), bus.clone());
        let map = session.location_map();
        let mut state = map.state();
        state
            .wait_for(|s| *s == MergerState::Live)
            .await
            .expect("merger running");

        let sensor = Arc::new(ScriptedSensor::<RiderLocation>::new());
        let _reporter = session.location_reporter(sensor.clone());
        sensor.push(Ok(RiderLocation::online(37.98, 23.72)));

        eventually(|| map.store().get("me").is_some()).await;
        assert!(store.row(LOCATIONS_TABLE, "me").is_some());
        assert_eq!(map.live_view(now_millis(), 10_000).len(), 1);
        session.teardown();
    }

    #[tokio::test]
    async fn test_teardown_stops_every_scope() {
        let backend = Arc::new(MemoryBackend::new());
        let session = SyncSession::new("me", quick_config(), backend.clone(), backend.clone());
        let map = session.location_map();
        let chat = session.conversation("c1");
        let mut map_state = map.state();
        let mut chat_state = chat.state();
        map_state.wait_for(|s| *s == MergerState::Live).await.expect("live");
        chat_state.wait_for(|s| *s == MergerState::Live).await.expect("live");
        assert_eq!(backend.subscriber_count(), 2);

        session.shutdown().await;
        assert_eq!(*map.state().borrow(), MergerState::Stopped);
        assert_eq!(*chat.state().borrow(), MergerState::Stopped);
        assert_eq!(backend.subscriber_count(), 0);
    }
}
