use clap::Parser;
use lib_presence::loggers::LogOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Rider presence simulation over the in-memory backend", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PRESENCE_SERVER_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PRESENCE_CONFIG_PATH", help = "Path to the JSON file with the sync timing configuration.")]
    pub presence_config_path: Option<PathBuf>,

    #[clap(long, env = "PRESENCE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PRESENCE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PRESENCE_LOG_JSON", help = "Write stdout logs as JSON lines.")]
    pub log_json: Option<bool>,

    #[clap(long, env = "PRESENCE_RIDERS", help = "Number of simulated riders.")]
    pub riders: Option<usize>,

    #[clap(long, env = "PRESENCE_SAMPLE_INTERVAL_MS", help = "Milliseconds between two sensor samples of one rider.")]
    pub sample_interval_ms: Option<u64>,

    #[clap(long, env = "PRESENCE_MONITOR_INTERVAL_SECONDS", help = "Seconds between two rider map reports.")]
    pub monitor_interval_seconds: Option<u64>,

    #[clap(long, env = "PRESENCE_RUN_SECONDS", help = "Stop after this many seconds (0 runs until Ctrl-C).")]
    pub run_seconds: Option<u64>,

    #[clap(long, env = "PRESENCE_CENTER_LATITUDE", help = "Latitude the riders start around.")]
    pub center_latitude: Option<f64>,

    #[clap(long, env = "PRESENCE_CENTER_LONGITUDE", help = "Longitude the riders start around.")]
    pub center_longitude: Option<f64>,

    #[clap(long, env = "PRESENCE_RADIUS_KM", help = "Radius of the 'nearby riders' query.")]
    pub radius_km: Option<f64>,

    #[clap(long, env = "PRESENCE_DROPOUT_PROBABILITY", help = "Chance per sample that a rider goes offline for good.")]
    pub dropout_probability: Option<f64>,

    #[clap(long, env = "PRESENCE_SENSOR_ERROR_PROBABILITY", help = "Chance per sample that the sensor reports a timeout instead.")]
    pub sensor_error_probability: Option<f64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            presence_config_path: other.presence_config_path.or(self.presence_config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_json: other.log_json.or(self.log_json),
            riders: other.riders.or(self.riders),
            sample_interval_ms: other.sample_interval_ms.or(self.sample_interval_ms),
            monitor_interval_seconds: other.monitor_interval_seconds.or(self.monitor_interval_seconds),
            run_seconds: other.run_seconds.or(self.run_seconds),
            center_latitude: other.center_latitude.or(self.center_latitude),
            center_longitude: other.center_longitude.or(self.center_longitude),
            radius_km: other.radius_km.or(self.radius_km),
            dropout_probability: other.dropout_probability.or(self.dropout_probability),
            sensor_error_probability: other.sensor_error_probability.or(self.sensor_error_probability),
        }
    }

    pub fn defaults() -> Config {
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            log_json: Some(false),
            riders: Some(12),
            sample_interval_ms: Some(400),
            monitor_interval_seconds: Some(5),
            run_seconds: Some(0),
            center_latitude: Some(37.9838),
            center_longitude: Some(23.7275),
            radius_km: Some(5.0),
            dropout_probability: Some(0.002),
            sensor_error_probability: Some(0.01),
            ..Default::default()
        }
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            app_name: "server_presence".to_string(),
            level: self.log_level.clone().unwrap_or_else(|| "info".to_string()),
            log_dir: self.log_dir.clone(),
            json: self.log_json.unwrap_or(false),
        }
    }
}

/// Defaults, then the JSON file, then CLI arguments and environment.
pub fn load_config() -> Config {
    resolve_config(Config::parse())
}

pub fn resolve_config(cli_args: Config) -> Config {
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_presence.conf"));

    let mut current_config = Config::defaults();

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => eprintln!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => eprintln!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    }

    // clap already folded the environment into the CLI values
    current_config.merge(cli_args)
}
