use anyhow::Result;
use futures_util::future::join_all;
use lib_presence::PresenceConfig;
use lib_presence::loggers;
use std::time::Duration;
use tokio::signal;

mod presence_logic;
use presence_logic::{config, monitor, simulation};

async fn wait_for_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        tracing::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "SIGTERM handler unavailable");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    let _log_guard = loggers::init_tracing(&config.log_options())?;
    let presence = PresenceConfig::load(config.presence_config_path.as_deref())?;
    tracing::info!(?presence, "presence configuration loaded");

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let mut sim = simulation::Simulation::start(&config, presence);

    let monitor_handle = tokio::spawn(monitor::run(
        config.clone(),
        sim.map.clone(),
        presence.staleness_window_millis(),
        shutdown_tx.subscribe(),
    ));
    let driver_handles = sim.spawn_drivers(&config, &shutdown_tx);

    // Wait for a shutdown signal or the configured run time
    match config.run_seconds.unwrap_or(0) {
        0 => wait_for_signal().await,
        secs => {
            tokio::select! {
                _ = wait_for_signal() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    tracing::info!(secs, "run time elapsed, initiating shutdown.");
                }
            }
        }
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    let mut riders = Vec::new();
    for joined in join_all(driver_handles).await {
        match joined {
            Ok(rider) => riders.push(rider),
            Err(e) => tracing::error!(error = %e, "rider driver panicked"),
        }
    }
    if let Err(e) = monitor_handle.await {
        tracing::error!(error = %e, "monitor task panicked");
    }

    sim.shutdown(riders).await;
    tracing::info!("Shutdown complete.");
    Ok(())
}
