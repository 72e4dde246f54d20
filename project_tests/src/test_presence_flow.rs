//! # Presence Flow Scenario Runner
//!
//! Drives the sync core end to end over the in-memory backend and prints a
//! PASS/FAIL line per scenario. Exits with status 1 if any scenario fails.

use anyhow::{Result, anyhow, ensure};
use clap::Parser;
use lib_presence::backends::{MemoryBackend, ScriptedSensor};
use lib_presence::core::{MergerState, now_millis};
use lib_presence::domain::location::{LOCATIONS_TABLE, RiderLocation};
use lib_presence::domain::typing::{TYPING_TABLE, TypingState, active_typists};
use lib_presence::domain::LikeState;
use lib_presence::loggers::{self, LogOptions};
use lib_presence::{PresenceConfig, SyncSession};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Log level for the library while scenarios run
    #[clap(short, long, default_value = "warn")]
    log_level: String,
}

fn quick_config() -> PresenceConfig {
    PresenceConfig {
        location_min_interval_ms: 50,
        typing_min_interval_ms: 50,
        reconnect_base_delay_ms: 10,
        reconnect_max_delay_ms: 100,
        ..PresenceConfig::default()
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for {}", what))
}

/// Two riders share the map; one drops offline and disappears for the other.
async fn scenario_rider_map() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let config = quick_config();
    let ana = SyncSession::new("ana", config, backend.clone(), backend.clone());
    let bo = SyncSession::new("bo", config, backend.clone(), backend.clone());

    let map = bo.location_map();
    let mut state = map.state();
    state.wait_for(|s| *s == MergerState::Live).await?;

    let sensor = Arc::new(ScriptedSensor::<RiderLocation>::new());
    let reporter = ana.location_reporter(sensor.clone());
    sensor.push(Ok(RiderLocation::online(37.98, 23.72)));
    eventually("ana on bo's map", || {
        !map.live_view(now_millis(), config.staleness_window_millis()).is_empty()
    })
    .await?;

    reporter.go_offline().await?;
    eventually("ana off bo's map", || {
        map.live_view(now_millis(), config.staleness_window_millis()).is_empty()
    })
    .await?;
    ensure!(map.store().retained("ana").is_some(), "offline record should be retained");

    ana.shutdown().await;
    bo.shutdown().await;
    Ok(())
}

/// The map resnapshots after a transport drop and catches up on missed rows.
async fn scenario_reconnect() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let config = quick_config();
    let session = SyncSession::new("me", config, backend.clone(), backend.clone());
    let map = session.location_map();
    let mut state = map.state();
    state.wait_for(|s| *s == MergerState::Live).await?;

    backend.disconnect_all("scenario outage");
    backend.seed(
        LOCATIONS_TABLE,
        "ghost",
        json!({ "latitude": 1.0, "longitude": 2.0, "is_online": true }),
        now_millis(),
    );
    eventually("missed row after resnapshot", || map.store().get("ghost").is_some()).await?;
    ensure!(backend.subscriber_count() == 1, "exactly one live subscription expected");

    session.shutdown().await;
    Ok(())
}

/// Keystroke bursts are coalesced and the indicator clears on offline.
async fn scenario_typing() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let config = quick_config();
    let ana = SyncSession::new("ana", config, backend.clone(), backend.clone());
    let me = SyncSession::new("me", config, backend.clone(), backend.clone());

    let indicators = me.typing_indicators("c1");
    let mut state = indicators.state();
    state.wait_for(|s| *s == MergerState::Live).await?;

    let typing = ana.typing_reporter("c1");
    for _ in 0..20 {
        typing.report(TypingState::new("c1", "ana", true));
    }
    eventually("ana typing", || {
        active_typists(indicators.store(), "me", now_millis(), config.typing_window_millis())
            == vec!["ana".to_string()]
    })
    .await?;
    let writes = backend.writes(TYPING_TABLE).len();
    ensure!(writes <= 2, "burst should coalesce, saw {} writes", writes);

    ana.shutdown().await;
    eventually("ana stopped typing", || {
        active_typists(indicators.store(), "me", now_millis(), config.typing_window_millis()).is_empty()
    })
    .await?;
    me.shutdown().await;
    Ok(())
}

/// A failed like rolls back; a retry commits.
async fn scenario_likes() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let session = SyncSession::new("me", quick_config(), backend.clone(), backend.clone());
    let likes = session.likes();
    likes.refresh("p1").await?;

    backend.fail_next_writes(1);
    ensure!(likes.toggle("p1").await.is_err(), "first toggle should fail");
    ensure!(likes.state("p1") == LikeState::default(), "failed toggle should roll back");

    likes.toggle("p1").await?;
    ensure!(
        likes.refresh("p1").await? == LikeState { liked: true, count: 1 },
        "retry should persist the like"
    );
    session.teardown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = loggers::init_tracing(&LogOptions {
        level: args.log_level.clone(),
        ..LogOptions::new("test_presence_flow")
    })?;

    println!("[*] Running presence flow scenarios...");
    let results = vec![
        ("rider map", scenario_rider_map().await),
        ("reconnect", scenario_reconnect().await),
        ("typing", scenario_typing().await),
        ("likes", scenario_likes().await),
    ];

    let mut failed = 0;
    for (name, result) in &results {
        match result {
            Ok(()) => println!("[PASS] {}", name),
            Err(e) => {
                failed += 1;
                eprintln!("[FAIL] {}: {}", name, e);
            }
        }
    }
    println!("-----------------------------------------------");
    println!("{} passed, {} failed", results.len() - failed, failed);

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
