use crate::presence_logic::config::Config;
use lib_presence::backends::{MemoryBackend, ScriptedSensor};
use lib_presence::core::OutboundReporter;
use lib_presence::domain::LocationMap;
use lib_presence::domain::location::RiderLocation;
use lib_presence::domain::profile::PROFILES_TABLE;
use lib_presence::{PresenceConfig, SourceError, SyncSession};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// One simulated rider: its own session, sensor and reporter.
pub struct SimRider {
    pub session: SyncSession,
    pub sensor: Arc<ScriptedSensor<RiderLocation>>,
    pub reporter: Arc<OutboundReporter<RiderLocation>>,
    pub position: RiderLocation,
}

/// The whole simulated world on one in-memory backend.
pub struct Simulation {
    pub backend: Arc<MemoryBackend>,
    pub observer: SyncSession,
    pub map: Arc<LocationMap>,
    pub riders: Vec<SimRider>,
}

fn jitter(scale: f64) -> f64 {
    (rand::random::<f64>() - 0.5) * scale
}

impl Simulation {
    pub fn start(config: &Config, presence: PresenceConfig) -> Simulation {
        let backend = Arc::new(MemoryBackend::new());
        let center_lat = config.center_latitude.unwrap_or(37.9838);
        let center_lon = config.center_longitude.unwrap_or(23.7275);
        let count = config.riders.unwrap_or(12);

        let observer = SyncSession::new("observer", presence, backend.clone(), backend.clone());
        let map = observer.location_map();

        let mut riders = Vec::with_capacity(count);
        for i in 0..count {
            let user_id = format!("rider-{:03}", i);
            backend.seed(
                PROFILES_TABLE,
                &user_id,
                json!({
                    "id": user_id,
                    "display_name": format!("Rider {}", i),
                    "level": 1 + (rand::random::<u32>() % 20),
                }),
                lib_presence::core::now_millis(),
            );

            let session = SyncSession::new(user_id.as_str(), presence, backend.clone(), backend.clone());
            let sensor = Arc::new(ScriptedSensor::new());
            let reporter = session.location_reporter(sensor.clone());
            let position = RiderLocation::online(center_lat + jitter(0.1), center_lon + jitter(0.1));
            riders.push(SimRider {
                session,
                sensor,
                reporter,
                position,
            });
        }
        tracing::info!(riders = count, "simulation started");

        Simulation {
            backend,
            observer,
            map,
            riders,
        }
    }

    /// Spawns one movement task per rider. Each task owns its rider.
    pub fn spawn_drivers(&mut self, config: &Config, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<SimRider>> {
        self.riders
            .drain(..)
            .map(|rider| tokio::spawn(drive_rider(rider, config.clone(), shutdown.subscribe())))
            .collect()
    }

    /// Shuts down every rider session, then the observer.
    pub async fn shutdown(self, riders: Vec<SimRider>) {
        for rider in riders.iter().chain(self.riders.iter()) {
            rider.session.shutdown().await;
        }
        self.observer.shutdown().await;
        tracing::info!(writes = self.backend.writes(lib_presence::domain::location::LOCATIONS_TABLE).len(), "simulation stopped");
    }
}

/// Random walk with occasional sensor errors and a rare permanent dropout.
pub async fn drive_rider(mut rider: SimRider, config: Config, mut shutdown: broadcast::Receiver<()>) -> SimRider {
    let mut ticker = interval(Duration::from_millis(config.sample_interval_ms.unwrap_or(400)));
    let dropout = config.dropout_probability.unwrap_or(0.0);
    let sensor_errors = config.sensor_error_probability.unwrap_or(0.0);
    let user = rider.session.user_id().to_string();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(%user, "rider driver received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                if rand::random::<f64>() < dropout {
                    tracing::info!(%user, "rider going offline");
                    if let Err(e) = rider.reporter.go_offline().await {
                        tracing::warn!(%user, error = %e, "offline publish failed");
                    }
                    break;
                }
                if rand::random::<f64>() < sensor_errors {
                    rider.sensor.push(Err(SourceError::Timeout));
                    continue;
                }

                let position = &mut rider.position;
                position.latitude += jitter(0.001);
                position.longitude += jitter(0.001);
                position.speed_kmh = Some(rand::random::<f64>() * 90.0);
                position.heading = Some(rand::random::<f64>() * 360.0);
                rider.sensor.set_current(Ok(position.clone()));
                rider.sensor.push(Ok(position.clone()));
            }
        }
    }
    rider
}
