/*!
Observability for the upload subsystem.

- Structured logging through a `tracing-subscriber` registry
- Prometheus counters and histograms behind the `metrics` feature

The `record_*` functions are always available and compile to no-ops when the
feature is disabled, so call sites never need their own `cfg`.
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, SpoolError};

/// Filter applied when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "spool_core=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<SpoolMetrics>> = OnceLock::new();

/// Prometheus metrics of exporters and upload clients
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct SpoolMetrics {
    pub exports_total: Counter,
    pub export_failures_total: Counter,
    pub uploads_submitted_total: Counter,
    pub uploads_succeeded_total: Counter,
    pub upload_retries_total: Counter,
    pub uploads_dropped_total: Counter,
    pub stalled_tasks_cancelled_total: Counter,
    pub staged_payload_bytes: Histogram,
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| SpoolError::validation(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| SpoolError::validation(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
impl SpoolMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let staged_payload_bytes = Histogram::with_opts(
            HistogramOpts::new("spool_staged_payload_bytes", "Size of staged payloads in bytes")
                .buckets(prometheus::exponential_buckets(256.0, 4.0, 8).map_err(|e| {
                    SpoolError::validation(format!("Invalid payload size buckets: {e}"))
                })?),
        )
        .map_err(|e| {
            SpoolError::validation(format!("Failed to create spool_staged_payload_bytes metric: {e}"))
        })?;
        registry
            .register(Box::new(staged_payload_bytes.clone()))
            .map_err(|e| {
                SpoolError::validation(format!("Failed to register spool_staged_payload_bytes: {e}"))
            })?;

        Ok(Self {
            exports_total: counter(&registry, "spool_exports_total", "Export calls")?,
            export_failures_total: counter(
                &registry,
                "spool_export_failures_total",
                "Export calls that returned failure",
            )?,
            uploads_submitted_total: counter(
                &registry,
                "spool_uploads_submitted_total",
                "Upload tasks handed to the transfer session",
            )?,
            uploads_succeeded_total: counter(
                &registry,
                "spool_uploads_succeeded_total",
                "Uploads acknowledged with a 2xx status",
            )?,
            upload_retries_total: counter(
                &registry,
                "spool_upload_retries_total",
                "Failed uploads scheduled for another attempt",
            )?,
            uploads_dropped_total: counter(
                &registry,
                "spool_uploads_dropped_total",
                "Staged payloads deleted after exhausting their retries",
            )?,
            stalled_tasks_cancelled_total: counter(
                &registry,
                "spool_stalled_tasks_cancelled_total",
                "Transfer tasks cancelled by reconciliation",
            )?,
            staged_payload_bytes,
            registry,
        })
    }

    /// Global metrics, `None` if registration failed
    pub fn global() -> Option<&'static SpoolMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    /// Render every metric in the Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| SpoolError::validation(format!("Failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| SpoolError::validation(format!("Failed to convert metrics to string: {e}")))
    }
}

#[cfg(feature = "metrics")]
fn with_metrics(record: impl FnOnce(&SpoolMetrics)) {
    if let Some(metrics) = SpoolMetrics::global() {
        record(metrics);
    }
}

pub fn record_export(staged_bytes: usize) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| {
        m.exports_total.inc();
        m.staged_payload_bytes.observe(staged_bytes as f64);
    });
    #[cfg(not(feature = "metrics"))]
    let _ = staged_bytes;
}

pub fn record_export_failure() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| {
        m.exports_total.inc();
        m.export_failures_total.inc();
    });
}

pub fn record_upload_submitted() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.uploads_submitted_total.inc());
}

pub fn record_upload_succeeded() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.uploads_succeeded_total.inc());
}

pub fn record_upload_retried() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.upload_retries_total.inc());
}

pub fn record_upload_dropped() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.uploads_dropped_total.inc());
}

pub fn record_stalled_cancelled() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.stalled_tasks_cancelled_total.inc());
}

/// Prometheus text exposition of all metrics; empty without the `metrics` feature
pub fn gather_metrics() -> Result<String> {
    #[cfg(feature = "metrics")]
    {
        match SpoolMetrics::global() {
            Some(metrics) => metrics.gather_metrics(),
            None => Ok(String::new()),
        }
    }
    #[cfg(not(feature = "metrics"))]
    {
        Ok(String::new())
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over [`DEFAULT_FILTER`]. With `json` set, events
/// are written as one JSON object per line.
pub fn init_observability(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .map_err(|e| SpoolError::validation(format!("Invalid log filter: {e}")))?;

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };
    result.map_err(|e| SpoolError::validation(format!("Failed to set global tracing subscriber: {e}")))?;

    tracing::debug!("Spool observability initialized");
    Ok(())
}
