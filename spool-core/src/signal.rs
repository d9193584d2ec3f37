/*!
Signal kinds and payload encoders.

Every signal is exported by the same [`BackgroundExporter`]; the signal only
decides the staging directory, the default OTLP/HTTP path and how records are
turned into a request body.
*/

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::client::BackgroundHttpClient;
use crate::config::ExporterConfig;
use crate::exporter::BackgroundExporter;
use crate::storage::LocalDiskStorage;
use crate::transport::HttpTransport;
use crate::{Result, SpoolError};

/// Directory below the storage root holding transfer session journals
pub const SESSIONS_DIR: &str = "sessions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Trace,
    Logs,
    /// Logs exported as pre-encoded protobuf
    LogsBinary,
    Metric,
}

impl SignalKind {
    pub const ALL: [SignalKind; 4] = [
        SignalKind::Trace,
        SignalKind::Logs,
        SignalKind::LogsBinary,
        SignalKind::Metric,
    ];

    /// Staging directory name of the signal
    pub fn file_key_type(&self) -> &'static str {
        match self {
            SignalKind::Trace => "trace",
            SignalKind::Logs => "logs",
            SignalKind::LogsBinary => "logs_binary",
            SignalKind::Metric => "metric",
        }
    }

    /// OTLP/HTTP path of the signal
    pub fn default_path(&self) -> &'static str {
        match self {
            SignalKind::Trace => "/v1/traces",
            SignalKind::Logs | SignalKind::LogsBinary => "/v1/logs",
            SignalKind::Metric => "/v1/metrics",
        }
    }

    /// Signal endpoint below a collector base URL
    pub fn endpoint_for(&self, base: &Url) -> Result<Url> {
        base.join(self.default_path())
            .map_err(|e| SpoolError::validation(format!("Invalid endpoint {base}: {e}")))
    }
}

/// Transfer session identifier of the exporter staging under `file_key_type`
///
/// Sessions follow the staging directory, so exporters sharing a directory
/// also share a session and see each other's tasks.
pub fn session_identifier(file_key_type: &str) -> String {
    format!("spool.{file_key_type}")
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_key_type())
    }
}

impl FromStr for SignalKind {
    type Err = SpoolError;

    fn from_str(s: &str) -> Result<Self> {
        SignalKind::ALL
            .into_iter()
            .find(|kind| kind.file_key_type() == s)
            .ok_or_else(|| SpoolError::validation(format!("Unknown signal {s:?}")))
    }
}

/// Turns a batch of records into one request body
pub trait PayloadEncoder<R>: Send + Sync {
    fn encode(&self, records: &[R]) -> Result<Vec<u8>>;
}

impl<R, F> PayloadEncoder<R> for F
where
    F: Fn(&[R]) -> Result<Vec<u8>> + Send + Sync,
{
    fn encode(&self, records: &[R]) -> Result<Vec<u8>> {
        self(records)
    }
}

/// Concatenate pre-encoded OTLP export requests
///
/// Protobuf merges repeated fields of concatenated messages, so the result is a
/// single request carrying every `resource_*` entry of the inputs.
pub fn concat_encoded(records: &[Bytes]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(records.iter().map(Bytes::len).sum());
    for record in records {
        body.extend_from_slice(record);
    }
    Ok(body)
}

/// Exporter for pre-encoded OTLP requests backed by a journalled HTTP session
///
/// Opens the transfer session of `kind` under `<storage root>/sessions`,
/// resuming uploads left by a previous process, and starts the reconciliation
/// watchdog. Must be called inside a Tokio runtime.
pub fn open_exporter(
    kind: SignalKind,
    endpoint: Url,
    config: ExporterConfig,
    storage: Arc<LocalDiskStorage>,
) -> Result<Arc<BackgroundExporter<Bytes>>> {
    config.validate()?;
    let session = session_identifier(&config.file_key_type(kind));
    let transport = HttpTransport::open(storage.root().join(SESSIONS_DIR), &session, config.qos)?;
    let client = BackgroundHttpClient::new(
        storage.clone(),
        Arc::new(transport),
        config.retry.clone(),
        session,
    );
    let exporter = Arc::new(BackgroundExporter::new(
        kind,
        endpoint,
        config,
        storage,
        client,
        concat_encoded,
    ));
    exporter.start_watchdog();
    Ok(exporter)
}
