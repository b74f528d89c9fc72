use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

const DEFAULT_CONFIG_PATH: &str = "./session_config.json";
const DEFAULT_DEVICE_ID_PATH: &str = "./device_id.txt";
const DEFAULT_STAGING_URL: &str = "http://localhost:8000/ingest";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_sleep_interval")]
    pub sleep_interval: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_imu_rate")]
    pub imu_rate_per_second: u32,
    #[serde(default)]
    pub camera: bool,
    #[serde(default)]
    pub flow_meter: bool,
    #[serde(default = "default_true")]
    pub imu: bool,
    #[serde(default)]
    pub production: bool,
    #[serde(default)]
    pub wifi_download_only: bool,
    // Spelling preserved from the device fleet's existing config files.
    #[serde(default = "default_pulses_per_litter")]
    pub flow_meter_pulses_per_litter: u32,
    #[serde(default = "default_staging_url")]
    pub ingest_url_staging: String,
    #[serde(default)]
    pub ingest_url_production: Option<String>,
    /// Ticks between camera captures; defaults to sleep_interval / 5.
    #[serde(default)]
    pub camera_interval: Option<u64>,
    #[serde(default = "default_offline_dir")]
    pub offline_dir: PathBuf,
    #[serde(default = "default_offline_replay_secs")]
    pub offline_replay_secs: u64,
    #[serde(default = "default_offline_file_retry_cap")]
    pub offline_file_retry_cap: u32,
    #[serde(default = "default_health_check_every")]
    pub health_check_every_ticks: u64,
}

fn default_sleep_interval() -> u64 {
    60
}
fn default_batch_size() -> usize {
    10
}
fn default_imu_rate() -> u32 {
    10
}
fn default_true() -> bool {
    true
}
fn default_pulses_per_litter() -> u32 {
    450
}
fn default_staging_url() -> String {
    DEFAULT_STAGING_URL.to_string()
}
fn default_offline_dir() -> PathBuf {
    PathBuf::from("./offline_data")
}
fn default_offline_replay_secs() -> u64 {
    600
}
fn default_offline_file_retry_cap() -> u32 {
    5
}
fn default_health_check_every() -> u64 {
    10
}

impl Config {
    /// Load the config file. A missing or malformed file is fatal: the
    /// device must not run on guessed settings.
    pub fn load() -> Result<Self> {
        let path = env::var("SCOUT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("configuration file {path} not found"))?;
        let mut config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("configuration file {path} is not valid JSON"))?;

        if config.sleep_interval == 0 {
            bail!("sleep_interval must be at least 1 second");
        }
        if config.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if config.camera_interval.is_none() {
            config.camera_interval = Some((config.sleep_interval / 5).max(1));
        }
        Ok(config)
    }

    /// The ingest endpoint selected by the `production` flag.
    pub fn ingest_url(&self) -> Result<String> {
        if self.production {
            self.ingest_url_production
                .clone()
                .context("production=true but ingest_url_production is not set")
        } else {
            Ok(self.ingest_url_staging.clone())
        }
    }

    pub fn camera_interval_ticks(&self) -> u64 {
        self.camera_interval
            .unwrap_or((self.sleep_interval / 5).max(1))
    }
}

/// Read the persisted device identity. Running without one is not allowed;
/// the backend keys everything on this UUID.
pub fn load_device_id() -> Result<String> {
    let path =
        env::var("SCOUT_DEVICE_ID_FILE").unwrap_or_else(|_| DEFAULT_DEVICE_ID_PATH.to_string());
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("device identity file {path} not found"))?;
    let id = raw.trim();
    if id.is_empty() {
        bail!("device identity file {path} is empty");
    }
    Uuid::parse_str(id).with_context(|| format!("device identity in {path} is not a UUID"))?;
    Ok(id.to_string())
}
