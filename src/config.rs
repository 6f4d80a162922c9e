//! Environment-driven runtime configuration.

use anyhow::{Context, Result};
use std::path::PathBuf;

const DEFAULT_OVERPASS_URL: &str = "https://maps.mail.ru/osm/tools/overpass/api/interpreter";
const DEFAULT_USER_AGENT: &str = "boundaryd/0.1.0";
const DEFAULT_HTTP_TIMEOUT_SEC: u64 = 180;
const DEFAULT_DOWNLOAD_TIMEOUT_SEC: u64 = 1800;
const DEFAULT_LAND_POLYGONS_URL: &str =
    "https://osmdata.openstreetmap.de/download/land-polygons-split-4326.zip";

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub overpass_url: String,
    pub http_user_agent: String,
    pub http_timeout_sec: u64,
    pub download_timeout_sec: u64,
    pub land_polygons_urls: Vec<String>,
}

impl Config {
    /// Build configuration from environment variables, failing fast on a
    /// missing `DATA_DIR` or an unparsable numeric override.
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("DATA_DIR")
            .context("DATA_DIR is required")?
            .into();

        let overpass_url = std::env::var("OVERPASS_URL")
            .unwrap_or_else(|_| DEFAULT_OVERPASS_URL.to_string());

        let http_user_agent =
            std::env::var("HTTP_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string());

        let http_timeout_sec = parse_env_u64("HTTP_TIMEOUT_SEC", DEFAULT_HTTP_TIMEOUT_SEC)?;
        let download_timeout_sec =
            parse_env_u64("DOWNLOAD_TIMEOUT_SEC", DEFAULT_DOWNLOAD_TIMEOUT_SEC)?;

        let land_polygons_urls = match std::env::var("OSM_LAND_POLYGONS_URLS") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => vec![DEFAULT_LAND_POLYGONS_URL.to_string()],
        };

        Ok(Self {
            data_dir,
            overpass_url,
            http_user_agent,
            http_timeout_sec,
            download_timeout_sec,
            land_polygons_urls,
        })
    }

    pub fn geojson_dir(&self) -> PathBuf {
        self.data_dir.join("geojson")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn land_polygons_zip_path(&self) -> PathBuf {
        self.cache_dir().join("land-polygons-split-4326.zip")
    }
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{name} must be a positive integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_u64_falls_back_to_default_when_unset() {
        std::env::remove_var("BOUNDARYD_TEST_TIMEOUT");
        let v = parse_env_u64("BOUNDARYD_TEST_TIMEOUT", 42).unwrap();
        assert_eq!(v, 42);
    }
}
