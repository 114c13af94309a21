//! Viewer configuration loaded from `tour-viewer.toml` and the environment.

use crate::assets::DEFAULT_CONCURRENCY;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Runtime settings for the viewer.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Base URL of the tour backend.
    pub backend_url: String,
    /// Optional device identifier sent with data requests.
    pub device_id: Option<String>,
    /// House to load on startup.
    pub initial_house: u32,
    /// Directory for the on-disk asset cache.
    pub cache_dir: PathBuf,
    /// Maximum disk cache size in gigabytes.
    pub cache_max_gb: u64,
    /// How many assets to warm simultaneously.
    pub preload_concurrency: usize,
    /// Delay before retrying a rejected play, in milliseconds.
    pub play_retry_delay_ms: u64,
}

impl Settings {
    /// Load settings from `tour-viewer.toml` (optional) with `TOUR_*`
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("backend_url", "http://localhost:8090")?
            .set_default("initial_house", 1_i64)?
            .set_default("cache_dir", default_cache_dir())?
            .set_default("cache_max_gb", 8_i64)?
            .set_default("preload_concurrency", DEFAULT_CONCURRENCY as i64)?
            .set_default("play_retry_delay_ms", 500_i64)?
            .add_source(config::File::with_name("tour-viewer").required(false))
            .add_source(config::Environment::with_prefix("TOUR"))
            .build()
            .context("Failed to build configuration")?;

        settings
            .try_deserialize()
            .context("Failed to parse configuration")
    }
}

fn default_cache_dir() -> String {
    std::env::var("HOME")
        .map(|home| format!("{}/.cache/tour-viewer", home))
        .unwrap_or_else(|_| "./cache".to_string())
}
