use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::reconcile::ReconcileConfig;

pub const CONFIG_FILE: &str = "converse_config.json";
pub const DEFAULT_API_URL: &str = "https://backend-prod.converse.xyz";
const API_URL_ENV: &str = "CONVERSE_API_URL";

/// Optional overrides read from `converse_config.json` in the data dir.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub guard_timeout_ms: Option<u64>,
    #[serde(default)]
    pub pass_timeout_ms: Option<u64>,
    #[serde(default)]
    pub disable_network: Option<bool>,
}

impl AppConfig {
    /// Push API base. The environment wins over the file.
    pub fn api_url(&self) -> String {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            let url = url.trim();
            if !url.is_empty() {
                return url.to_string();
            }
        }
        self.api_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_API_URL)
            .to_string()
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        let defaults = ReconcileConfig::default();
        ReconcileConfig {
            guard_timeout: self
                .guard_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.guard_timeout),
            pass_timeout: self
                .pass_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.pass_timeout),
        }
    }

    pub fn network_disabled(&self) -> bool {
        self.disable_network.unwrap_or(false)
    }
}

pub fn load_app_config(data_dir: &Path) -> AppConfig {
    let path = data_dir.join(CONFIG_FILE);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return AppConfig::default(),
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "config: unreadable, using defaults");
            return AppConfig::default();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "config: invalid json, using defaults");
            AppConfig::default()
        }
    }
}
