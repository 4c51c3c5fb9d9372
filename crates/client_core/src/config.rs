use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use shared::{domain::DeliveryMode, protocol::SOCKET_IO_PATH};
use tracing::warn;
use url::Url;

pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub delivery_mode: DeliveryMode,
    pub request_timeout_secs: Option<u64>,
    pub ws_path: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            delivery_mode: DeliveryMode::Descriptor,
            request_timeout_secs: None,
            ws_path: SOCKET_IO_PATH.into(),
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Server root with any trailing slash removed, validated as an http(s) URL.
    pub fn base_url(&self) -> Result<Url> {
        let trimmed = self.server_url.trim().trim_end_matches('/');
        let url = Url::parse(trimmed)
            .with_context(|| format!("invalid server url '{}'", self.server_url))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(anyhow!(
                "server url must start with http:// or https://, got scheme '{other}'"
            )),
        }
    }

    /// Applies the recognised keys of `client.toml`; a mistyped key is skipped on its own.
    fn apply_table(&mut self, table: &toml::Table) {
        if let Some(v) = string_key(table, "server_url") {
            self.server_url = v.to_string();
        }
        if let Some(mode) = string_key(table, "delivery_mode").and_then(DeliveryMode::parse) {
            self.delivery_mode = mode;
        }
        match table.get("request_timeout_secs") {
            Some(toml::Value::Integer(secs)) if *secs >= 0 => {
                self.request_timeout_secs = Some(*secs as u64)
            }
            Some(toml::Value::String(raw)) if raw.trim().parse::<u64>().is_ok() => {
                self.request_timeout_secs = raw.trim().parse().ok()
            }
            Some(other) => warn!(value = %other, "ignoring request_timeout_secs"),
            None => {}
        }
        if let Some(v) = string_key(table, "ws_path") {
            self.ws_path = v.to_string();
        }
    }
}

fn string_key<'a>(table: &'a toml::Table, key: &str) -> Option<&'a str> {
    let value = table.get(key)?;
    let text = value.as_str();
    if text.is_none() {
        warn!(key, value = %value, "ignoring non-string setting");
    }
    text
}

/// Defaults, then `client.toml` in the working directory, then the environment.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match raw.parse::<toml::Table>() {
            Ok(table) => settings.apply_table(&table),
            Err(err) => warn!(path = %path.display(), "ignoring unreadable settings file: {err}"),
        }
    }

    if let Some(v) = env("COMMUTE_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(mode) = env("APP__DELIVERY_MODE").and_then(|v| DeliveryMode::parse(&v)) {
        settings.delivery_mode = mode;
    }

    if let Some(v) = env("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = Some(parsed);
        }
    }

    if let Some(v) = env("APP__WS_PATH") {
        settings.ws_path = v;
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
