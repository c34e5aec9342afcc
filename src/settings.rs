//! Client-side proxy settings and the observable store interceptors read from.

use crate::bypass::BypassMatcher;
use crate::patterns::{normalise_bypass_list, split_bypass_text};
use crate::rewrite;
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use url::Url;

pub const DEFAULT_PROTOCOL: &str = "http";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: &str = "8787";

/// Missing fields take their default; a host stored as an empty string stays
/// empty and keeps proxying disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxySettings {
    pub protocol: String,
    pub host: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: String,
    #[serde(alias = "bypassPatterns", deserialize_with = "deserialize_bypass_list")]
    pub bypass_list: Vec<String>,
}

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT.to_string(),
            bypass_list: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Text(String),
    Number(u64),
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<PortValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(PortValue::Text(text)) => text,
        Some(PortValue::Number(number)) => number.to_string(),
        None => String::new(),
    })
}

/// The bypass list has been stored both as a list and as one
/// newline/comma-separated string; both read into the list form.
#[derive(Deserialize)]
#[serde(untagged)]
enum BypassValue {
    List(Vec<String>),
    Text(String),
}

fn deserialize_bypass_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<BypassValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(BypassValue::List(list)) => normalise_bypass_list(list),
        Some(BypassValue::Text(text)) => normalise_bypass_list(split_bypass_text(&text)),
        None => Vec::new(),
    })
}

impl ProxySettings {
    pub fn new(protocol: &str, host: &str, port: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
            port: port.to_string(),
            bypass_list: Vec::new(),
        }
        .normalised()
    }

    pub fn with_bypass_list<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.bypass_list = normalise_bypass_list(patterns);
        self
    }

    /// Proxying is disabled whenever no host is configured.
    pub fn is_enabled(&self) -> bool {
        !self.host.trim().is_empty()
    }

    pub fn normalised(self) -> Self {
        Self {
            protocol: normalise_protocol(&self.protocol),
            host: self.host.trim().to_string(),
            port: self.port.chars().filter(|c| c.is_ascii_digit()).collect(),
            bypass_list: normalise_bypass_list(self.bypass_list),
        }
    }

    /// Parses stored settings, falling back to defaults when the value is unreadable.
    pub fn from_json(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<ProxySettings>(raw) {
            Ok(settings) => settings.normalised(),
            Err(e) => {
                warn!("[path-proxy] Unable to parse stored settings, falling back to defaults: {}", e);
                Self::default()
            }
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.clone().normalised())
    }
}

fn normalise_protocol(protocol: &str) -> String {
    let trimmed = protocol.trim().trim_end_matches(':').trim_end();
    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
        .collect::<String>()
        .to_lowercase();
    if cleaned.is_empty() {
        default_protocol()
    } else {
        cleaned
    }
}

/// An immutable view of the settings at one point in time, with the bypass
/// rules compiled once for it.
#[derive(Debug, Clone)]
pub struct SettingsSnapshot {
    settings: ProxySettings,
    bypass: BypassMatcher,
}

impl SettingsSnapshot {
    pub fn new(settings: ProxySettings) -> Self {
        let settings = settings.normalised();
        let bypass = BypassMatcher::new(&settings.bypass_list);
        Self { settings, bypass }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn bypass(&self) -> &BypassMatcher {
        &self.bypass
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.is_enabled()
    }

    pub fn proxy_base(&self) -> Option<String> {
        rewrite::proxy_base(&self.settings)
    }

    pub fn rewrite(&self, url: &str, location: Option<&Url>) -> String {
        rewrite::rewrite_with(url, &self.settings, &self.bypass, location)
    }
}

/// The one shared settings object. Writers publish through the store; readers
/// hold a [`SettingsAccessor`] and see the latest snapshot on every read.
pub struct SettingsStore {
    tx: watch::Sender<Arc<SettingsSnapshot>>,
}

impl SettingsStore {
    pub fn new(settings: ProxySettings) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(SettingsSnapshot::new(settings)));
        Self { tx }
    }

    pub fn from_json(raw: &str) -> Self {
        Self::new(ProxySettings::from_json(raw))
    }

    pub fn update(&self, settings: ProxySettings) {
        self.tx.send_replace(Arc::new(SettingsSnapshot::new(settings)));
    }

    pub fn modify<F>(&self, f: F)
    where
        F: FnOnce(&mut ProxySettings),
    {
        let mut settings = self.current().settings().clone();
        f(&mut settings);
        self.update(settings);
    }

    pub fn reset(&self) {
        self.update(ProxySettings::default());
    }

    pub fn current(&self) -> Arc<SettingsSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn accessor(&self) -> SettingsAccessor {
        SettingsAccessor {
            rx: self.tx.subscribe(),
        }
    }

    /// Change notifications for observers such as a settings UI.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SettingsSnapshot>> {
        self.tx.subscribe()
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(ProxySettings::default())
    }
}

#[derive(Clone)]
pub struct SettingsAccessor {
    rx: watch::Receiver<Arc<SettingsSnapshot>>,
}

impl SettingsAccessor {
    pub fn snapshot(&self) -> Arc<SettingsSnapshot> {
        self.rx.borrow().clone()
    }
}
