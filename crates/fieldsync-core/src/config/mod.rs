//! Engine configuration.
//!
//! A `SyncConfig` is built in code, loaded from `FIELDSYNC_*` environment
//! variables, or deserialized from a config file shipped with the app.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::queue::QueuePolicy;
use crate::util::{is_http_url, normalize_text_option};
use crate::{Error, Result};

const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 20;

pub const ENV_BASE_URL: &str = "FIELDSYNC_BASE_URL";
pub const ENV_REFRESH_INTERVAL_SECS: &str = "FIELDSYNC_REFRESH_INTERVAL_SECS";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "FIELDSYNC_HTTP_TIMEOUT_SECS";
pub const ENV_PROBE_URL: &str = "FIELDSYNC_PROBE_URL";
pub const ENV_PROBE_INTERVAL_SECS: &str = "FIELDSYNC_PROBE_INTERVAL_SECS";
pub const ENV_QUEUE_MAX_LEN: &str = "FIELDSYNC_QUEUE_MAX_LEN";
pub const ENV_MAX_REJECTIONS: &str = "FIELDSYNC_MAX_REJECTIONS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Server root every endpoint path is appended to.
    pub base_url: String,
    /// How often pending counts are re-read from storage.
    #[serde(default = "default_refresh_interval", with = "secs")]
    pub refresh_interval: Duration,
    #[serde(default = "default_http_timeout", with = "secs")]
    pub http_timeout: Duration,
    /// Health URL polled to drive connectivity; `None` leaves connectivity
    /// to the platform hook.
    #[serde(default)]
    pub probe_url: Option<String>,
    #[serde(default = "default_probe_interval", with = "secs")]
    pub probe_interval: Duration,
    #[serde(default)]
    pub queue_policy: QueuePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            refresh_interval: default_refresh_interval(),
            http_timeout: default_http_timeout(),
            probe_url: None,
            probe_interval: default_probe_interval(),
            queue_policy: QueuePolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: normalize_required_http_url(base_url, ENV_BASE_URL)?,
            ..Self::default()
        })
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from any variable source. Only the base URL is required.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |name: &str| normalize_text_option(lookup(name));

        let base_url = read(ENV_BASE_URL)
            .ok_or_else(|| Error::InvalidConfiguration(format!("{ENV_BASE_URL} is required")))?;
        let mut config = Self::new(&base_url)?;

        if let Some(raw) = read(ENV_REFRESH_INTERVAL_SECS) {
            config.refresh_interval = parse_secs(&raw, ENV_REFRESH_INTERVAL_SECS)?;
        }
        if let Some(raw) = read(ENV_HTTP_TIMEOUT_SECS) {
            config.http_timeout = parse_secs(&raw, ENV_HTTP_TIMEOUT_SECS)?;
        }
        if let Some(raw) = read(ENV_PROBE_URL) {
            config.probe_url = Some(normalize_required_http_url(&raw, ENV_PROBE_URL)?);
        }
        if let Some(raw) = read(ENV_PROBE_INTERVAL_SECS) {
            config.probe_interval = parse_secs(&raw, ENV_PROBE_INTERVAL_SECS)?;
        }
        if let Some(raw) = read(ENV_QUEUE_MAX_LEN) {
            config.queue_policy.max_len = Some(parse_positive(&raw, ENV_QUEUE_MAX_LEN)?);
        }
        if let Some(raw) = read(ENV_MAX_REJECTIONS) {
            config.queue_policy.max_rejections = Some(parse_positive(&raw, ENV_MAX_REJECTIONS)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialization alone cannot.
    pub fn validate(&self) -> Result<()> {
        normalize_required_http_url(&self.base_url, "base_url")?;
        if let Some(probe_url) = &self.probe_url {
            normalize_required_http_url(probe_url, "probe_url")?;
        }
        for (field, value) in [
            ("refresh_interval", self.refresh_interval),
            ("http_timeout", self.http_timeout),
            ("probe_interval", self.probe_interval),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidConfiguration(format!("{field} must be positive")));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Private
// ---------------------------------------------------------------------------

const fn default_refresh_interval() -> Duration {
    Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS)
}

const fn default_http_timeout() -> Duration {
    Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)
}

const fn default_probe_interval() -> Duration {
    Duration::from_secs(DEFAULT_PROBE_INTERVAL_SECS)
}

fn normalize_required_http_url(raw: &str, field: &str) -> Result<String> {
    let value = normalize_text_option(Some(raw.to_string()))
        .ok_or_else(|| Error::InvalidConfiguration(format!("{field} is required")))?;
    if is_http_url(&value) {
        Ok(value.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidConfiguration(format!(
            "{field} must include http:// or https://"
        )))
    }
}

fn parse_secs(raw: &str, field: &str) -> Result<Duration> {
    Ok(Duration::from_secs(parse_positive(raw, field)?))
}

fn parse_positive<N>(raw: &str, field: &str) -> Result<N>
where
    N: std::str::FromStr + PartialEq + Default,
{
    match raw.parse::<N>() {
        Ok(value) if value != N::default() => Ok(value),
        _ => Err(Error::InvalidConfiguration(format!(
            "{field} must be a positive integer, got '{raw}'"
        ))),
    }
}

mod secs {
    use super::{Deserialize, Deserializer, Duration, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
