/*!
Request descriptor: the persisted identity of one staged upload.

A descriptor travels as the opaque description of a background transfer task,
which lets completions and reconciliation passes find the staged file, the
attempt count and the headers of an upload even after a process restart.
*/

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use spool_retry::RetryPolicy;
use url::Url;
use uuid::Uuid;

use crate::config::duration_secs;
use crate::storage::KeyBuilder;
use crate::transport::UploadRequest;
use crate::{Result, SpoolError};

/// Newest descriptor schema this library reads and writes
pub const DESCRIPTOR_VERSION: u8 = 1;

/// Content type of OTLP/HTTP protobuf requests
pub const OTLP_PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

static USER_AGENT: Lazy<String> =
    Lazy::new(|| format!("spool-core/{}", env!("CARGO_PKG_VERSION")));

fn current_version() -> u8 {
    DESCRIPTOR_VERSION
}

/// Describes a staged payload and how to upload it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDescriptor {
    #[serde(default = "current_version")]
    pub version: u8,
    /// Stable across every retry of the same payload; names the staged file
    pub id: Uuid,
    pub endpoint: Url,
    #[serde(with = "duration_secs")]
    pub explicit_timeout: Duration,
    /// Number of submissions made before this one
    #[serde(default)]
    pub sent_count: u32,
    pub file_key_type: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl RequestDescriptor {
    /// Descriptor of a payload that has never been submitted
    pub fn new<S: Into<String>>(
        id: Uuid,
        endpoint: Url,
        explicit_timeout: Duration,
        file_key_type: S,
    ) -> Self {
        Self {
            version: DESCRIPTOR_VERSION,
            id,
            endpoint,
            explicit_timeout,
            sent_count: 0,
            file_key_type: file_key_type.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_sent_count(mut self, sent_count: u32) -> Self {
        self.sent_count = sent_count;
        self
    }

    /// Storage key of the staged payload: `uploadFiles/<fileKeyType>/<id>`
    pub fn file_key(&self) -> KeyBuilder {
        KeyBuilder::uploads()
            .append(self.file_key_type.as_str())
            .append(self.id.to_string())
    }

    /// Whether another attempt is allowed
    pub fn should_send(&self, policy: &RetryPolicy) -> bool {
        policy.should_send(self.sent_count)
    }

    /// Earliest time the next attempt may start
    pub fn scheduled(&self, policy: &RetryPolicy) -> DateTime<Utc> {
        self.scheduled_from(policy, Utc::now())
    }

    pub fn scheduled_from(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = policy.delay_for(self.sent_count);
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Copy of this descriptor recording one more submission
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.sent_count = next.sent_count.saturating_add(1);
        next
    }

    /// Build the outbound OTLP/HTTP request
    ///
    /// Descriptor headers are applied last and replace defaults with the same
    /// name regardless of case.
    pub fn create_request(&self) -> UploadRequest {
        let mut headers = vec![
            ("Content-Type".to_string(), OTLP_PROTOBUF_CONTENT_TYPE.to_string()),
            ("User-Agent".to_string(), USER_AGENT.clone()),
        ];
        for (name, value) in &self.headers {
            headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
            headers.push((name.clone(), value.clone()));
        }

        UploadRequest {
            method: "POST".to_string(),
            url: self.endpoint.clone(),
            headers,
            timeout: self.explicit_timeout,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a task description, rejecting schemas newer than this library
    pub fn from_json(description: &str) -> Result<Self> {
        let descriptor: Self = serde_json::from_str(description)
            .map_err(|e| SpoolError::invalid_descriptor(e.to_string()))?;
        if descriptor.version > DESCRIPTOR_VERSION {
            return Err(SpoolError::invalid_descriptor(format!(
                "unsupported descriptor version {}",
                descriptor.version
            )));
        }
        Ok(descriptor)
    }
}

/// Effective request timeout: the smaller of the caller's and the configured one
pub fn resolve_timeout(explicit: Option<Duration>, config_timeout: Duration) -> Duration {
    match explicit {
        Some(explicit) => explicit.min(config_timeout),
        None => config_timeout,
    }
}
