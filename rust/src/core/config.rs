use std::path::Path;

use serde::{Deserialize, Serialize};

use super::AppCore;

pub(super) const DEFAULT_RELAY_URL: &str = "wss://relay.bargain.market/ws";
pub(super) const DEFAULT_STORE_URL: &str = "https://api.bargain.market";
// "Popular ones" so calls traverse NAT out of the box; keep small for MVP.
const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];
const DEFAULT_ROOM_POLL_SECS: u64 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(super) struct AppConfig {
    pub(super) disable_network: Option<bool>,
    pub(super) relay_url: Option<String>,
    pub(super) store_url: Option<String>,
    pub(super) room_poll_secs: Option<u64>,
    pub(super) call_audio_backend: Option<String>,
    pub(super) stun_servers: Option<Vec<String>>,
}

pub(super) fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join("bargain_config.json");
    let Ok(bytes) = std::fs::read(&path) else {
        return AppConfig::default();
    };
    serde_json::from_slice::<AppConfig>(&bytes).unwrap_or_default()
}

/// Default `bargain_config.json` payload used when no config file exists.
pub(crate) fn default_app_config_json() -> String {
    let defaults = AppConfig {
        disable_network: Some(false),
        relay_url: Some(DEFAULT_RELAY_URL.to_string()),
        store_url: Some(DEFAULT_STORE_URL.to_string()),
        room_poll_secs: Some(DEFAULT_ROOM_POLL_SECS),
        call_audio_backend: Some("synthetic".to_string()),
        stun_servers: Some(DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()),
    };
    serde_json::to_string_pretty(&defaults).unwrap_or_else(|_| "{}".to_string())
}

impl AppCore {
    pub(super) fn network_enabled(&self) -> bool {
        // Used to keep Rust tests deterministic and offline.
        if let Some(disable) = self.config.disable_network {
            return !disable;
        }
        std::env::var("BARGAIN_DISABLE_NETWORK").ok().as_deref() != Some("1")
    }

    pub(super) fn relay_url(&self) -> String {
        match self.config.relay_url.as_deref() {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => DEFAULT_RELAY_URL.to_string(),
        }
    }

    pub(super) fn store_url(&self) -> String {
        match self.config.store_url.as_deref() {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => DEFAULT_STORE_URL.to_string(),
        }
    }

    pub(super) fn room_poll_secs(&self) -> u64 {
        self.config
            .room_poll_secs
            .unwrap_or(DEFAULT_ROOM_POLL_SECS)
            .max(1)
    }

    pub(super) fn stun_servers(&self) -> Vec<String> {
        if let Some(servers) = &self.config.stun_servers {
            let cleaned: Vec<String> = servers
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !cleaned.is_empty() {
                return cleaned;
            }
        }
        DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
    }
}
