//! # Rider Locations
//!
//! Payload of the live rider map. One row per rider in `rider_locations`,
//! keyed by user id and written by that rider's own `OutboundReporter`.
//! A rider is shown while `is_online` is set and the last fix is younger than
//! the presence window.

use serde::{Deserialize, Serialize};

use crate::core::entity::EntityPayload;
use crate::core::merger::{ChangeStreamMerger, MergedEntry};
use crate::domain::profile::RiderProfile;

/// Backing table of rider positions.
pub const LOCATIONS_TABLE: &str = "rider_locations";

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Last known position of one rider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiderLocation {
    /// Degrees, WGS84.
    pub latitude: f64,
    /// Degrees, WGS84.
    pub longitude: f64,
    /// Ground speed, when the sensor reports it.
    #[serde(default)]
    pub speed_kmh: Option<f64>,
    /// Course over ground in degrees, when the sensor reports it.
    #[serde(default)]
    pub heading: Option<f64>,
    /// Explicit online bit. Cleared by the rider's final offline publish.
    #[serde(default)]
    pub is_online: bool,
}

impl RiderLocation {
    /// An online fix without speed or heading.
    pub fn online(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            speed_kmh: None,
            heading: None,
            is_online: true,
        }
    }

    /// Great-circle distance in kilometres (haversine).
    pub fn distance_km(&self, other: &RiderLocation) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

impl EntityPayload for RiderLocation {
    fn live_flag(&self) -> Option<bool> {
        Some(self.is_online)
    }

    fn set_live_flag(&mut self, live: bool) {
        self.is_online = live;
    }
}

/// Merger behind the live rider map.
pub type LocationMap = ChangeStreamMerger<RiderLocation, RiderProfile>;

/// Live riders within `radius_km` of `center`, nearest first.
pub fn nearby(
    map: &LocationMap,
    center: &RiderLocation,
    radius_km: f64,
    now_millis: i64,
    window_millis: i64,
) -> Vec<(MergedEntry<RiderLocation, RiderProfile>, f64)> {
    let mut riders: Vec<_> = map
        .live_view(now_millis, window_millis)
        .into_iter()
        .map(|entry| {
            let distance = center.distance_km(&entry.entity.payload);
            (entry, distance)
        })
        .filter(|(_, distance)| *distance <= radius_km)
        .collect();
    riders.sort_by(|a, b| a.1.total_cmp(&b.1));
    riders
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;
    use crate::core::collab::ChannelSpec;
    use crate::core::entity::{ChangeEvent, Operation};
    use crate::core::store::EntitySnapshotStore;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_distance_km_between_known_points() {
        let athens = RiderLocation::online(37.9838, 23.7275);
        let thessaloniki = RiderLocation::online(40.6401, 22.9444);
        let d = athens.distance_km(&thessaloniki);
        assert!((d - 302.0).abs() < 5.0, "got {d}");
        assert_eq!(athens.distance_km(&athens), 0.0);
    }

    #[test]
    fn test_missing_optional_fields_decode() {
        let raw = serde_json::json!({ "latitude": 1.0, "longitude": 2.0 });
        let loc: RiderLocation = serde_json::from_value(raw).expect("decodes");
        assert!(!loc.is_online);
        assert_eq!(loc.live_flag(), Some(false));
    }

    #[tokio::test]
    async fn test_nearby_filters_and_sorts() {
        let backend = Arc::new(MemoryBackend::new());
        let map: LocationMap = ChangeStreamMerger::new(
            ChannelSpec::table(LOCATIONS_TABLE),
            Arc::new(EntitySnapshotStore::new("map")),
            backend.clone(),
            backend,
            CancellationToken::new(),
        );
        let fixes = [
            ("near", RiderLocation::online(37.99, 23.73)),
            ("nearer", RiderLocation::online(37.984, 23.728)),
            ("far", RiderLocation::online(40.64, 22.94)),
        ];
        for (id, fix) in fixes {
            map.apply_event(ChangeEvent {
                entity_id: id.into(),
                operation: Operation::Insert,
                payload: Some(fix),
                timestamp: 1_000,
            });
        }

        let center = RiderLocation::online(37.9838, 23.7275);
        let ids: Vec<String> = nearby(&map, &center, 50.0, 2_000, 10_000)
            .into_iter()
            .map(|(entry, _)| entry.entity.entity_id)
            .collect();
        assert_eq!(ids, vec!["nearer".to_string(), "near".to_string()]);
    }
}
