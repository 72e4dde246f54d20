use crate::presence_logic::config::Config;
use lib_presence::core::now_millis;
use lib_presence::domain::location::{RiderLocation, nearby};
use lib_presence::domain::LocationMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;

pub async fn run(config: Config, map: Arc<LocationMap>, window_millis: i64, mut shutdown: broadcast::Receiver<()>) {
    let mut check_interval = interval(Duration::from_secs(config.monitor_interval_seconds.unwrap_or(5).max(1)));
    let center = RiderLocation::online(
        config.center_latitude.unwrap_or(37.9838),
        config.center_longitude.unwrap_or(23.7275),
    );
    let radius_km = config.radius_km.unwrap_or(5.0);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                let now = now_millis();
                let known = map.store().len();
                let live = map.live_view(now, window_millis).len();
                let near = nearby(&map, &center, radius_km, now, window_millis);
                let state = *map.state().borrow();

                tracing::info!(?state, known, live, nearby = near.len(), radius_km, "rider map");
                for (entry, distance_km) in near.iter().take(5) {
                    let profile = entry.enrichment.value_or_default();
                    tracing::debug!(
                        rider = %entry.entity.entity_id,
                        name = %profile.display_name,
                        level = profile.level,
                        distance_km = *distance_km,
                        speed_kmh = entry.entity.payload.speed_kmh.unwrap_or(0.0),
                        "nearby rider"
                    );
                }
                if known > 0 && live == 0 {
                    tracing::warn!(known, "no live riders on the map");
                }
            }
        }
    }
}
