/*!
# Spool Core

Disk-backed background uploads for OTLP/HTTP payloads.

Every exported batch is written to local storage before any network call and
uploaded through a background transfer session whose tasks survive process
restarts. Failed uploads are retried with a bounded backoff schedule; a
periodic reconciliation pass recovers staged files that lost their task and
replaces tasks that stalled.

## Components

- [`storage`]: key-addressed disk storage with capacity rules
- [`descriptor`]: the persisted identity of one staged upload
- [`transport`]: background transfer sessions (reqwest-backed or in-memory)
- [`client`]: turns descriptors into transfer tasks and handles completions
- [`exporter`]: stages batches and reconciles disk against live tasks
- [`signal`]: signal kinds, payload encoders and exporter wiring

## Usage

```rust,no_run
use std::sync::Arc;

use bytes::Bytes;
use spool_core::{open_exporter, ExporterConfig, LocalDiskStorage, SignalKind};

# async fn run() -> spool_core::Result<()> {
let storage = Arc::new(LocalDiskStorage::new("/var/lib/spool"));
let endpoint = url::Url::parse("https://collector.example.com/v1/traces").unwrap();
let exporter = open_exporter(SignalKind::Trace, endpoint, ExporterConfig::default(), storage)?;

// Pre-encoded ExportTraceServiceRequest messages
exporter.export(&[Bytes::from_static(b"\x0a\x00")], None);
exporter.force_flush().await;
# Ok(())
# }
```
*/

pub mod client;
pub mod compression;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod exporter;
pub mod observability;
pub mod signal;
pub mod storage;
pub mod transport;


pub use client::{BackgroundHttpClient, UploadClient};
pub use compression::{GzipCompressor, PayloadCompressor};
pub use config::{ExporterConfig, PayloadCompression, SessionQos};
pub use descriptor::RequestDescriptor;
pub use error::{Result, SpoolError};
pub use exporter::{BackgroundExporter, ExportResult, LiveUpload};
pub use signal::{concat_encoded, open_exporter, session_identifier, PayloadEncoder, SignalKind};
pub use spool_retry::{RetryPolicy, RetrySchedule};
pub use storage::{DiskStorage, DiskStorageExt, ItemInfo, KeyBuilder, LocalDiskStorage, StorageRules};
pub use transport::{BackgroundTransport, HttpTransport, InMemoryTransport, TransferTask};
