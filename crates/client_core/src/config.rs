use std::{fs, path::Path, str::FromStr};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

/// Settings shared by the collection and channel controllers.
///
/// Layered as defaults, then an optional TOML file, then `APP__<FIELD>`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub api_url: String,
    pub ws_url: String,
    pub collection_url: Option<String>,
    pub channel_id: String,
    pub user_id: String,
    pub page_size: usize,
    /// Zero disables search debouncing.
    pub search_debounce_ms: u64,
    pub min_search_length: usize,
    pub history_limit: u32,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub auto_connect: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8443".into(),
            ws_url: "ws://127.0.0.1:8443/ws".into(),
            collection_url: None,
            channel_id: "general".into(),
            user_id: "anonymous".into(),
            page_size: 10,
            search_debounce_ms: 0,
            min_search_length: 0,
            history_limit: 50,
            reconnect_interval_ms: 3000,
            max_reconnect_attempts: 5,
            auto_connect: true,
        }
    }
}

pub fn load_settings(path: Option<&Path>) -> anyhow::Result<SyncSettings> {
    let settings = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read settings file {}", path.display()))?;
            parse_settings(&raw)
                .with_context(|| format!("invalid settings file {}", path.display()))?
        }
        None => SyncSettings::default(),
    };
    Ok(apply_env_overrides(settings, |key| std::env::var(key).ok()))
}

pub fn parse_settings(raw: &str) -> anyhow::Result<SyncSettings> {
    Ok(toml::from_str(raw)?)
}

/// Applies `APP__*` overrides read through `lookup`. Values that fail to
/// parse are logged and ignored.
pub fn apply_env_overrides<F>(mut settings: SyncSettings, lookup: F) -> SyncSettings
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("APP__API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = lookup("APP__WS_URL") {
        settings.ws_url = v;
    }
    if let Some(v) = lookup("APP__COLLECTION_URL") {
        settings.collection_url = Some(v);
    }
    if let Some(v) = lookup("APP__CHANNEL_ID") {
        settings.channel_id = v;
    }
    if let Some(v) = lookup("APP__USER_ID") {
        settings.user_id = v;
    }
    override_parsed(&lookup, "APP__PAGE_SIZE", &mut settings.page_size);
    override_parsed(&lookup, "APP__SEARCH_DEBOUNCE_MS", &mut settings.search_debounce_ms);
    override_parsed(&lookup, "APP__MIN_SEARCH_LENGTH", &mut settings.min_search_length);
    override_parsed(&lookup, "APP__HISTORY_LIMIT", &mut settings.history_limit);
    override_parsed(
        &lookup,
        "APP__RECONNECT_INTERVAL_MS",
        &mut settings.reconnect_interval_ms,
    );
    override_parsed(
        &lookup,
        "APP__MAX_RECONNECT_ATTEMPTS",
        &mut settings.max_reconnect_attempts,
    );
    override_parsed(&lookup, "APP__AUTO_CONNECT", &mut settings.auto_connect);
    settings
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "ignoring unparsable setting override"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
