//! Liveness of a cached entity.
//!
//! Liveness decays with wall-clock time even when no event arrives, so the
//! result is never cached: callers evaluate it on every read (render tick,
//! poll, monitor interval).

use crate::core::entity::TrackedEntity;

/// Staleness window used for the live rider map.
pub const LOCATION_PRESENCE_WINDOW_MS: i64 = 10_000;

/// `live_flag == Some(true)` and the last update is strictly younger than
/// `window_millis`.
pub fn is_live<P>(entity: &TrackedEntity<P>, now_millis: i64, window_millis: i64) -> bool {
    entity.live_flag == Some(true) && now_millis.saturating_sub(entity.updated_at) < window_millis
}

/// Filters an iterator of entities down to the live ones.
pub fn live_entities<'a, P: 'a>(
    entities: impl IntoIterator<Item = &'a TrackedEntity<P>>,
    now_millis: i64,
    window_millis: i64,
) -> impl Iterator<Item = &'a TrackedEntity<P>> {
    entities
        .into_iter()
        .filter(move |entity| is_live(*entity, now_millis, window_millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(flag: Option<bool>, updated_at: i64) -> TrackedEntity<serde_json::Value> {
        TrackedEntity {
            entity_id: "r".to_string(),
            payload: json!({}),
            updated_at,
            live_flag: flag,
        }
    }

    #[test]
    fn test_is_live_boundary_at_window() {
        let e = entity(Some(true), 1_000);
        let window = LOCATION_PRESENCE_WINDOW_MS;

        assert!(is_live(&e, 1_000, window));
        assert!(is_live(&e, 1_000 + window - 1, window));
        assert!(!is_live(&e, 1_000 + window, window));
        assert!(!is_live(&e, 1_000 + window + 1, window));
    }

    #[test]
    fn test_is_live_requires_explicit_flag() {
        assert!(!is_live(&entity(Some(false), 1_000), 1_000, 10_000));
        assert!(!is_live(&entity(None, 1_000), 1_000, 10_000));
    }

    #[test]
    fn test_live_entities_filters_stale() {
        let fresh = entity(Some(true), 9_000);
        let stale = entity(Some(true), 0);
        let live: Vec<_> = live_entities([&fresh, &stale], 10_000, 5_000).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].updated_at, 9_000);
    }
}
