//! Exporter configuration
//!
//! [`ExporterConfig`] carries everything an exporter needs besides its
//! endpoint and storage: request timeout, header sets, file key override,
//! payload compression, reconciliation cadence, transfer session QoS flags and
//! the retry policy. It deserializes from JSON with every field optional.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spool_retry::RetryPolicy;

use crate::signal::SignalKind;
use crate::{Result, SpoolError};

/// Environment variable holding extra OTLP headers as `k=v,k2=v2`
pub const OTLP_HEADERS_ENV: &str = "OTEL_EXPORTER_OTLP_HEADERS";

/// Compression applied to payloads before they are staged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadCompression {
    #[default]
    None,
    Gzip,
}

/// Network conditions the background transfer session may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionQos {
    pub allows_cellular_access: bool,
    pub allows_constrained_network_access: bool,
    pub allows_expensive_network_access: bool,
}

impl Default for SessionQos {
    fn default() -> Self {
        Self {
            allows_cellular_access: true,
            allows_constrained_network_access: true,
            allows_expensive_network_access: true,
        }
    }
}

/// Configuration shared by all signal exporters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Upper bound of a single upload request; also the stall threshold
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Headers added to every request, overriding `env_var_headers`
    pub headers: BTreeMap<String, String>,
    /// Headers taken from `OTEL_EXPORTER_OTLP_HEADERS`
    pub env_var_headers: BTreeMap<String, String>,
    /// Overrides the signal's default file key type
    pub file_type: Option<String>,
    pub compression: PayloadCompression,
    #[serde(with = "duration_secs")]
    pub stall_check_interval: Duration,
    /// Run the reconciliation watchdog
    pub perform_stalled_upload_check: bool,
    /// Minimum age of a staged file without a task before it is resubmitted
    #[serde(with = "duration_secs")]
    pub orphan_grace: Duration,
    pub qos: SessionQos,
    pub retry: RetryPolicy,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            headers: BTreeMap::new(),
            env_var_headers: BTreeMap::new(),
            file_type: None,
            compression: PayloadCompression::None,
            stall_check_interval: Duration::from_secs(10),
            perform_stalled_upload_check: true,
            orphan_grace: Duration::from_secs(10),
            qos: SessionQos::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ExporterConfig {
    /// Load a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            SpoolError::validation(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Fill `env_var_headers` from the process environment
    pub fn with_env_headers(mut self) -> Self {
        if let Ok(value) = std::env::var(OTLP_HEADERS_ENV) {
            self.env_var_headers = parse_env_headers(&value);
        }
        self
    }

    /// Staging directory name used for `kind`
    pub fn file_key_type(&self, kind: SignalKind) -> String {
        self.file_type
            .clone()
            .unwrap_or_else(|| kind.file_key_type().to_string())
    }

    /// Headers sent with every request of this exporter
    pub fn merged_headers(&self) -> BTreeMap<String, String> {
        let mut merged = self.env_var_headers.clone();
        merged.extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(SpoolError::validation("timeout must be greater than zero"));
        }
        if self.stall_check_interval.is_zero() {
            return Err(SpoolError::validation(
                "stall_check_interval must be greater than zero",
            ));
        }
        if let Some(file_type) = &self.file_type {
            if file_type.is_empty() || file_type.contains(['/', '\\']) || file_type.starts_with('.') {
                return Err(SpoolError::validation(format!(
                    "file_type {file_type:?} is not a valid key component"
                )));
            }
        }
        self.retry
            .validate()
            .map_err(|e| SpoolError::validation(format!("invalid retry policy: {e}")))
    }
}

/// Parse `k=v,k2=v2`; malformed pairs are skipped
pub fn parse_env_headers(value: &str) -> BTreeMap<String, String> {
    value
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Serialize a `Duration` as fractional seconds
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
