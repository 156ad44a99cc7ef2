//! Pipeline configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`PipelineConfig::default()`]
//! 2. If the config file exists, deep-merge its values over the defaults
//! 3. Apply `BEACON_*` environment variable overrides (highest priority)

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use beacon_core::Feature;
use beacon_transport::HttpTransportConfig;

use crate::error::{PipelineError, Result};

pub const MIN_TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub server_url: String,
    pub app_key: String,
    pub sdk_name: String,
    pub sdk_version: String,
    /// Background drain interval; values under one second are raised to it.
    pub tick_interval_secs: u64,
    /// Test-only override that bypasses the one second floor. Zero is
    /// raised to one millisecond.
    pub test_tick_interval_ms: Option<u64>,
    pub request_queue_capacity: usize,
    pub event_queue_capacity: usize,
    /// Buffered events that trigger a batch flush. Clamped to the capacity.
    pub event_flush_threshold: usize,
    /// Requests older than this are dropped unsent.
    pub max_request_age_hours: Option<u64>,
    pub age_sweep_interval_secs: u64,
    pub session_update_interval_secs: u64,
    /// Query strings at least this long go out as POST.
    pub post_threshold: usize,
    pub force_post: bool,
    #[serde(skip_serializing, deserialize_with = "deserialize_salt")]
    pub salt: Option<SecretString>,
    pub limits: LimitsConfig,
    pub crawler: CrawlerConfig,
    pub backoff: BackoffConfig,
    pub consent: ConsentConfig,
    pub health_check_enabled: bool,
    pub start_in_temporary_id_mode: bool,
    /// Developer-supplied device id used when none is persisted yet.
    pub device_id: Option<String>,
    pub http: HttpConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            app_key: String::new(),
            sdk_name: "beacon-rust".into(),
            sdk_version: env!("CARGO_PKG_VERSION").into(),
            tick_interval_secs: 60,
            test_tick_interval_ms: None,
            request_queue_capacity: 1000,
            event_queue_capacity: 100,
            event_flush_threshold: 100,
            max_request_age_hours: None,
            age_sweep_interval_secs: 60,
            session_update_interval_secs: 60,
            post_threshold: 2000,
            force_post: false,
            salt: None,
            limits: LimitsConfig::default(),
            crawler: CrawlerConfig::default(),
            backoff: BackoffConfig::default(),
            consent: ConsentConfig::default(),
            health_check_enabled: true,
            start_in_temporary_id_mode: false,
            device_id: None,
            http: HttpConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
    pub max_key_length: usize,
    pub max_value_size: usize,
    pub max_segmentation_values: usize,
    pub max_breadcrumb_count: usize,
    pub max_stack_trace_lines: usize,
    pub max_stack_trace_line_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_key_length: 128,
            max_value_size: 256,
            max_segmentation_values: 100,
            max_breadcrumb_count: 100,
            max_stack_trace_lines: 30,
            max_stack_trace_line_length: 200,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlerConfig {
    pub ignore_crawlers: bool,
    /// Device names reported by known app crawlers.
    pub crawler_names: Vec<String>,
    /// Regex matched against `user_agent`.
    pub user_agent_pattern: Option<String>,
    pub device_name: Option<String>,
    pub user_agent: Option<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            ignore_crawlers: true,
            crawler_names: vec!["Calypso AppCrawler".into()],
            user_agent_pattern: None,
            device_name: None,
            user_agent: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Extra random delay, as a fraction of the computed delay.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 300_000,
            jitter_factor: 0.0,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsentConfig {
    pub required: bool,
    /// Features granted at startup when nothing is persisted.
    pub granted: Vec<Feature>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            request_timeout_secs: 30,
        }
    }
}

fn deserialize_salt<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(d)?
        .filter(|s| !s.is_empty())
        .map(SecretString::from))
}

impl PipelineConfig {
    pub fn tick_interval(&self) -> Duration {
        match self.test_tick_interval_ms {
            Some(ms) => Duration::from_millis(ms.max(1)),
            None => Duration::from_secs(self.tick_interval_secs).max(MIN_TICK_INTERVAL),
        }
    }

    pub fn flush_threshold(&self) -> usize {
        self.event_flush_threshold.clamp(1, self.event_queue_capacity.max(1))
    }

    pub fn max_request_age(&self) -> Option<Duration> {
        self.max_request_age_hours
            .map(|h| Duration::from_secs(h.saturating_mul(3600)))
    }

    pub fn session_update_interval(&self) -> Duration {
        Duration::from_secs(self.session_update_interval_secs.max(1))
    }

    pub fn age_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.age_sweep_interval_secs)
    }

    pub fn transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            server_url: self.server_url.clone(),
            post_threshold: self.post_threshold,
            force_post: self.force_post,
            salt: self.salt.clone(),
            connect_timeout: Duration::from_secs(self.http.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.http.request_timeout_secs),
            user_agent: self.crawler.user_agent.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_key.trim().is_empty() {
            return Err(PipelineError::Config("appKey must not be empty".into()));
        }
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(PipelineError::Config(format!(
                "serverUrl must be an http(s) URL, got {:?}",
                self.server_url
            )));
        }
        if self.request_queue_capacity == 0 || self.event_queue_capacity == 0 {
            return Err(PipelineError::Config("queue capacities must be positive".into()));
        }
        Ok(())
    }
}

/// Load config from a file (if present) with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<PipelineConfig> {
    let defaults = serde_json::to_value(PipelineConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: PipelineConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Objects merge per key, arrays and primitives are replaced, nulls skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Invalid values are ignored with a warning.
pub fn apply_env_overrides(config: &mut PipelineConfig) {
    if let Some(v) = read_env_string("BEACON_SERVER_URL") {
        config.server_url = v;
    }
    if let Some(v) = read_env_string("BEACON_APP_KEY") {
        config.app_key = v;
    }
    if let Some(v) = read_env_string("BEACON_DEVICE_ID") {
        config.device_id = Some(v);
    }
    if let Some(v) = read_env_string("BEACON_SALT") {
        config.salt = Some(SecretString::from(v));
    }
    if let Some(v) = read_env_u64("BEACON_TICK_INTERVAL_SECS", 1, 86_400) {
        config.tick_interval_secs = v;
    }
    if let Some(v) = read_env_usize("BEACON_REQUEST_QUEUE_CAPACITY", 1, 1_000_000) {
        config.request_queue_capacity = v;
    }
    if let Some(v) = read_env_usize("BEACON_EVENT_QUEUE_CAPACITY", 1, 100_000) {
        config.event_queue_capacity = v;
    }
    if let Some(v) = read_env_u64("BEACON_MAX_REQUEST_AGE_HOURS", 1, 24 * 365) {
        config.max_request_age_hours = Some(v);
    }
    if let Some(v) = read_env_bool("BEACON_FORCE_POST") {
        config.force_post = v;
    }
    if let Some(v) = read_env_bool("BEACON_CONSENT_REQUIRED") {
        config.consent.required = v;
    }
    if let Some(v) = read_env_bool("BEACON_HEALTH_CHECK") {
        config.health_check_enabled = v;
    }
    if let Some(v) = read_env_bool("BEACON_TEMPORARY_ID") {
        config.start_in_temporary_id_mode = v;
    }
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    read_env_u64(name, min as u64, max as u64).map(|v| v as usize)
}
