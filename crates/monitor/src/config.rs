//! TOML configuration: backend location, polling cadence, startup crop and
//! the status endpoint.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::model::Id;
use crate::poller::{PollSettings, TimeRange};

/// Upper bound for `polling.history_limit`.
const MAX_HISTORY_LIMIT: u32 = 1000;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub backend: BackendConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub min_spacing_ms: u64,
    pub history_limit: u32,
    pub time_range: TimeRange,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub crop_id: Option<Id>,
    pub auto_start: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_timeout_sec() -> u64 {
    10
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            min_spacing_ms: 5_000,
            history_limit: 100,
            time_range: TimeRange::default(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

impl PollingConfig {
    pub fn settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.interval_ms),
            min_spacing: Duration::from_millis(self.min_spacing_ms),
            history_limit: self.history_limit,
            time_range: self.time_range,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `BACKEND_URL` and `WEB_PORT`.  `lookup` is `std::env::var` in
    /// production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("BACKEND_URL") {
            self.backend.base_url = url;
        }
        if let Some(port) = lookup("WEB_PORT") {
            self.web.port = port
                .trim()
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {port:?}"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section.  Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_backend(&mut errors);
        self.validate_polling(&mut errors);
        self.validate_monitor(&mut errors);
        self.validate_web(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_backend(&self, errors: &mut Vec<String>) {
        let url = self.backend.base_url.trim();
        if url.is_empty() {
            errors.push("backend.base_url is empty".to_string());
        } else if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!("backend.base_url {url:?} must start with http:// or https://"));
        }
        if self.backend.timeout_sec == 0 {
            errors.push("backend.timeout_sec must be positive".to_string());
        }
    }

    fn validate_polling(&self, errors: &mut Vec<String>) {
        let p = &self.polling;
        if p.interval_ms == 0 {
            errors.push("polling.interval_ms must be positive".to_string());
        } else if p.interval_ms < p.min_spacing_ms {
            errors.push(format!(
                "polling.interval_ms ({}) is below polling.min_spacing_ms ({}); every tick would be rate limited",
                p.interval_ms, p.min_spacing_ms
            ));
        }
        if !(1..=MAX_HISTORY_LIMIT).contains(&p.history_limit) {
            errors.push(format!(
                "polling.history_limit {} out of range [1, {MAX_HISTORY_LIMIT}]",
                p.history_limit
            ));
        }
    }

    fn validate_monitor(&self, errors: &mut Vec<String>) {
        if self.monitor.auto_start && self.monitor.crop_id.is_none() {
            errors.push("monitor.auto_start requires monitor.crop_id".to_string());
        }
    }

    fn validate_web(&self, errors: &mut Vec<String>) {
        if self.web.enabled && self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse a config document, apply environment overrides and validate.
pub fn parse<F>(contents: &str, lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.apply_env(lookup)?;
    config.validate()?;
    Ok(config)
}

/// Read, parse, override from the environment and validate a config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents, |key| std::env::var(key).ok()).with_context(|| format!("invalid config: {path}"))
}

// ===========================================================================
// Tests
// ===========================================================================
