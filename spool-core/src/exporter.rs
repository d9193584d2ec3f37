/*!
Background HTTP base exporter.

Stages every encoded batch on disk before handing it to the upload client, and
periodically reconciles the staged files of its signal against the live tasks
of the transfer session:

- tasks without an earliest begin date are cancelled,
- tasks whose earliest begin date lies more than one request timeout in the
  past are stalled; they are cancelled and their descriptor is resubmitted,
- when several tasks carry the same payload, all but the latest are cancelled,
- staged files without any task are orphans and are submitted afresh once they
  are older than the configured grace period.
*/

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::client::UploadClient;
use crate::compression::{compressor_for, PayloadCompressor};
use crate::config::ExporterConfig;
use crate::descriptor::{resolve_timeout, RequestDescriptor};
use crate::observability;
use crate::signal::{PayloadEncoder, SignalKind};
use crate::storage::{DiskStorage, KeyBuilder};
use crate::transport::{lock, TaskId, TransferTask};

/// Outcome reported to callers of the exporter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportResult {
    Success,
    Failure,
}

/// A live transfer task matched to its request descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct LiveUpload {
    pub task_id: TaskId,
    pub descriptor: RequestDescriptor,
    /// Earliest begin date of the task
    pub scheduled: DateTime<Utc>,
}

impl LiveUpload {
    pub fn is_stalled(&self, cancel_time: DateTime<Utc>) -> bool {
        self.scheduled < cancel_time
    }
}

pub struct BackgroundExporter<R> {
    kind: SignalKind,
    endpoint: Url,
    config: ExporterConfig,
    file_key_type: String,
    headers: BTreeMap<String, String>,
    storage: Arc<dyn DiskStorage>,
    client: Arc<dyn UploadClient>,
    encoder: Box<dyn PayloadEncoder<R>>,
    compressor: Arc<dyn PayloadCompressor>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl<R> BackgroundExporter<R> {
    pub fn new<E>(
        kind: SignalKind,
        endpoint: Url,
        config: ExporterConfig,
        storage: Arc<dyn DiskStorage>,
        client: Arc<dyn UploadClient>,
        encoder: E,
    ) -> Self
    where
        E: PayloadEncoder<R> + 'static,
    {
        let file_key_type = config.file_key_type(kind);
        let compressor = compressor_for(config.compression);
        let mut headers = config.merged_headers();
        if let Some(encoding) = compressor.content_encoding() {
            headers.insert("Content-Encoding".to_string(), encoding.to_string());
        }

        Self {
            kind,
            endpoint,
            config,
            file_key_type,
            headers,
            storage,
            client,
            encoder: Box::new(encoder),
            compressor,
            watchdog: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    /// Staging directory name: the configured file type or the signal default
    pub fn file_key_type(&self) -> &str {
        &self.file_key_type
    }

    /// Storage key under which this exporter stages payloads
    pub fn storage_key(&self) -> KeyBuilder {
        KeyBuilder::uploads().append(self.file_key_type.as_str())
    }

    /// Stage `records` on disk and schedule their upload
    ///
    /// An empty batch still stages (and uploads) one payload. The payload
    /// stays on disk when scheduling fails; reconciliation picks it up later.
    pub fn export(&self, records: &[R], explicit_timeout: Option<Duration>) -> ExportResult {
        let payload = match self
            .encoder
            .encode(records)
            .and_then(|encoded| self.compressor.compress(&encoded))
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(signal = %self.file_key_type, error = %e, "Failed to encode export batch");
                observability::record_export_failure();
                return ExportResult::Failure;
            }
        };

        let descriptor = RequestDescriptor::new(
            Uuid::new_v4(),
            self.endpoint.clone(),
            resolve_timeout(explicit_timeout, self.config.timeout),
            self.file_key_type.as_str(),
        )
        .with_headers(self.headers.clone());

        if let Err(e) = self.storage.insert(&payload, &descriptor.file_key()) {
            warn!(signal = %self.file_key_type, error = %e, "Failed to stage export payload");
            observability::record_export_failure();
            return ExportResult::Failure;
        }
        observability::record_export(payload.len());

        if let Err(e) = self.client.send(&descriptor) {
            warn!(
                signal = %self.file_key_type,
                id = %descriptor.id,
                error = %e,
                "Failed to schedule upload, payload stays staged"
            );
            observability::record_export_failure();
            return ExportResult::Failure;
        }

        debug!(
            signal = %self.file_key_type,
            id = %descriptor.id,
            records = records.len(),
            size = payload.len(),
            "Staged export batch"
        );
        ExportResult::Success
    }

    pub async fn force_flush(&self) -> ExportResult {
        self.client.flush().await;
        ExportResult::Success
    }

    /// Stop the reconciliation watchdog; exporting keeps working
    pub fn shutdown(&self) -> ExportResult {
        if let Some(watchdog) = lock(&self.watchdog).take() {
            watchdog.abort();
            debug!(signal = %self.file_key_type, "Stopped stalled upload watchdog");
        }
        ExportResult::Success
    }

    /// Run one reconciliation pass against the current session tasks
    pub async fn reconcile(&self) {
        let observed_at = Utc::now();
        let tasks = self.client.all_session_tasks().await;
        self.check_stalled_uploads_at(&tasks, observed_at);
    }

    pub fn check_stalled_uploads(&self, tasks: &[TransferTask]) {
        self.check_stalled_uploads_at(tasks, Utc::now());
    }

    /// Reconcile staged files against `tasks`, a snapshot taken at `observed_at`
    pub fn check_stalled_uploads_at(&self, tasks: &[TransferTask], observed_at: DateTime<Utc>) {
        let files = match self.storage.list(&self.storage_key()) {
            Ok(files) => files,
            Err(e) => {
                debug!(signal = %self.file_key_type, error = %e, "Skipping stalled upload check");
                return;
            }
        };

        let mut live = Vec::new();
        for task in tasks {
            let Some(scheduled) = task.earliest_begin else {
                debug!(task_id = task.id, "Cancelling task without earliest begin date");
                self.client.cancel(task.id);
                observability::record_stalled_cancelled();
                continue;
            };
            match task.decode_descriptor() {
                Ok(descriptor) if descriptor.file_key_type == self.file_key_type => {
                    live.push(LiveUpload {
                        task_id: task.id,
                        descriptor,
                        scheduled,
                    })
                }
                Ok(_) => {}
                Err(e) => debug!(task_id = task.id, error = %e, "Skipping undecodable task"),
            }
        }

        // One live task per payload; the latest attempt wins.
        live.sort_by(|a, b| {
            a.descriptor
                .id
                .cmp(&b.descriptor.id)
                .then(b.scheduled.cmp(&a.scheduled))
                .then(b.descriptor.sent_count.cmp(&a.descriptor.sent_count))
        });
        let mut seen = HashSet::new();
        live.retain(|upload| {
            if seen.insert(upload.descriptor.id) {
                return true;
            }
            debug!(
                task_id = upload.task_id,
                id = %upload.descriptor.id,
                "Cancelling duplicate task"
            );
            self.client.cancel(upload.task_id);
            false
        });

        let cancel_time = earlier_by(observed_at, self.config.timeout);
        let staged: HashSet<&str> = files.iter().map(|file| file.key.as_str()).collect();
        live.retain(|upload| {
            let has_file = staged.contains(upload.descriptor.id.to_string().as_str());
            if !has_file && upload.is_stalled(cancel_time) {
                debug!(
                    task_id = upload.task_id,
                    id = %upload.descriptor.id,
                    "Cancelling stalled task without staged payload"
                );
                self.client.cancel(upload.task_id);
                observability::record_stalled_cancelled();
                return false;
            }
            true
        });

        // Untracked files younger than the grace period may still be waiting
        // for their first send, which the snapshot cannot show.
        let orphan_cutoff = earlier_by(observed_at, self.config.orphan_grace);
        let file_keys: Vec<String> = files
            .into_iter()
            .filter(|file| {
                let tracked = Uuid::parse_str(&file.key).is_ok_and(|id| seen.contains(&id));
                tracked || file.modified.map_or(true, |modified| modified <= orphan_cutoff)
            })
            .map(|file| file.key)
            .collect();

        self.check_and_send(&file_keys, &live, cancel_time);
    }

    /// Resubmit stalled uploads and orphaned files among `file_keys`
    pub fn check_and_send(&self, file_keys: &[String], existing: &[LiveUpload], cancel_time: DateTime<Utc>) {
        for file_key in file_keys {
            let Ok(id) = Uuid::parse_str(file_key) else {
                debug!(signal = %self.file_key_type, file = %file_key, "Ignoring foreign staged file");
                continue;
            };

            let descriptor = match existing.iter().find(|upload| upload.descriptor.id == id) {
                Some(upload) if !upload.is_stalled(cancel_time) => continue,
                Some(upload) => {
                    info!(
                        signal = %self.file_key_type,
                        id = %id,
                        task_id = upload.task_id,
                        scheduled = %upload.scheduled,
                        "Resubmitting stalled upload"
                    );
                    self.client.cancel(upload.task_id);
                    observability::record_stalled_cancelled();
                    // The task description already carries the incremented sent count.
                    upload.descriptor.clone()
                }
                None => {
                    info!(signal = %self.file_key_type, id = %id, "Submitting orphaned payload");
                    RequestDescriptor::new(
                        id,
                        self.endpoint.clone(),
                        self.config.timeout,
                        self.file_key_type.as_str(),
                    )
                    .with_headers(self.headers.clone())
                }
            };

            if let Err(e) = self.client.send(&descriptor) {
                warn!(signal = %self.file_key_type, id = %id, error = %e, "Failed to resubmit upload");
            }
        }
    }
}

impl<R: 'static> BackgroundExporter<R> {
    /// Start the periodic reconciliation task
    ///
    /// The first pass runs immediately. Does nothing when stalled upload checks
    /// are disabled or no Tokio runtime is available.
    pub fn start_watchdog(self: &Arc<Self>) {
        if !self.config.perform_stalled_upload_check {
            return;
        }
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!(signal = %self.file_key_type, "No Tokio runtime, stalled upload checks disabled");
                return;
            }
        };

        let exporter = Arc::downgrade(self);
        let period = self.config.stall_check_interval;
        let watchdog = handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(exporter) = exporter.upgrade() else {
                    break;
                };
                exporter.reconcile().await;
            }
        });

        if let Some(previous) = lock(&self.watchdog).replace(watchdog) {
            previous.abort();
        }
    }
}

impl<R> Drop for BackgroundExporter<R> {
    fn drop(&mut self) {
        if let Some(watchdog) = lock(&self.watchdog).take() {
            watchdog.abort();
        }
    }
}

fn earlier_by(observed_at: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(period)
        .ok()
        .and_then(|period| observed_at.checked_sub_signed(period))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockUploadClient;
    use crate::config::PayloadCompression;
    use crate::signal::concat_encoded;
    use crate::storage::{ItemInfo, MockDiskStorage};
    use crate::transport::TaskState;
    use crate::{Result, SpoolError};
    use bytes::Bytes;
    use mockall::predicate::*;

    fn endpoint() -> Url {
        Url::parse("https://collector.example.com/v1/traces").unwrap()
    }

    fn exporter(
        storage: MockDiskStorage,
        client: MockUploadClient,
        config: ExporterConfig,
    ) -> BackgroundExporter<Bytes> {
        BackgroundExporter::new(
            SignalKind::Trace,
            endpoint(),
            config,
            Arc::new(storage),
            Arc::new(client),
            concat_encoded,
        )
    }

    fn descriptor(id: Uuid, sent_count: u32) -> RequestDescriptor {
        RequestDescriptor::new(id, endpoint(), Duration::from_secs(10), "trace")
            .with_sent_count(sent_count)
    }

    fn task(id: TaskId, descriptor: &RequestDescriptor, earliest_begin: Option<DateTime<Utc>>) -> TransferTask {
        TransferTask {
            id,
            description: Some(descriptor.to_json().unwrap()),
            earliest_begin,
            state: TaskState::Suspended,
        }
    }

    fn item(key: &str) -> ItemInfo {
        ItemInfo {
            key: key.to_string(),
            size: 4,
            modified: Some(Utc::now() - chrono::Duration::hours(1)),
        }
    }

    fn listing(items: Vec<ItemInfo>) -> MockDiskStorage {
        let mut storage = MockDiskStorage::new();
        storage.expect_list().returning(move |_| Ok(items.clone()));
        storage
    }

    #[test]
    fn test_export_stages_then_sends() {
        let mut storage = MockDiskStorage::new();
        let mut client = MockUploadClient::new();
        storage
            .expect_insert()
            .withf(|data: &[u8], key: &KeyBuilder| {
                data == b"ab" && key.parent().map(KeyBuilder::key).as_deref() == Some("uploadFiles/trace")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_send()
            .withf(|descriptor: &RequestDescriptor| {
                descriptor.sent_count == 0
                    && descriptor.file_key_type == "trace"
                    && descriptor.explicit_timeout == Duration::from_secs(3)
            })
            .times(1)
            .returning(|_| Ok(()));

        let exporter = exporter(storage, client, ExporterConfig::default());
        let records = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];
        assert_eq!(
            exporter.export(&records, Some(Duration::from_secs(3))),
            ExportResult::Success
        );
    }

    #[test]
    fn test_export_empty_batch_sends_once() {
        let mut storage = MockDiskStorage::new();
        let mut client = MockUploadClient::new();
        storage
            .expect_insert()
            .withf(|data: &[u8], _: &KeyBuilder| data.is_empty())
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_send().times(1).returning(|_| Ok(()));

        let exporter = exporter(storage, client, ExporterConfig::default());
        assert_eq!(exporter.export(&[], None), ExportResult::Success);
    }

    #[test]
    fn test_export_storage_failure_skips_send() {
        let mut storage = MockDiskStorage::new();
        let mut client = MockUploadClient::new();
        storage
            .expect_insert()
            .returning(|_, _| Err(SpoolError::storage("disk full")));
        client.expect_send().never();

        let exporter = exporter(storage, client, ExporterConfig::default());
        assert_eq!(exporter.export(&[], None), ExportResult::Failure);
    }

    #[test]
    fn test_export_send_failure_keeps_file() {
        let mut storage = MockDiskStorage::new();
        let mut client = MockUploadClient::new();
        storage.expect_insert().times(1).returning(|_, _| Ok(()));
        storage.expect_delete().never();
        client
            .expect_send()
            .returning(|_| Err(SpoolError::transport("session closed")));

        let exporter = exporter(storage, client, ExporterConfig::default());
        assert_eq!(exporter.export(&[], None), ExportResult::Failure);
    }

    #[test]
    fn test_export_headers_and_file_type_override() {
        let mut storage = MockDiskStorage::new();
        let mut client = MockUploadClient::new();
        storage
            .expect_insert()
            .withf(|_: &[u8], key: &KeyBuilder| key.key().starts_with("uploadFiles/spans/"))
            .returning(|_, _| Ok(()));
        client
            .expect_send()
            .withf(|descriptor: &RequestDescriptor| {
                let request = descriptor.create_request();
                descriptor.file_key_type == "spans"
                    && request.header("X-SF-Token") == Some("secret")
                    && request.header("x-env") == Some("env")
                    && request.header("Content-Encoding") == Some("gzip")
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut config = ExporterConfig::default();
        config.file_type = Some("spans".to_string());
        config.compression = PayloadCompression::Gzip;
        config.headers.insert("X-SF-Token".to_string(), "secret".to_string());
        config.env_var_headers.insert("x-env".to_string(), "env".to_string());

        let exporter = exporter(storage, client, config);
        assert_eq!(exporter.file_key_type(), "spans");
        assert_eq!(exporter.export(&[Bytes::from_static(b"x")], None), ExportResult::Success);
    }

    #[test]
    fn test_export_timeout_capped_by_config() {
        let mut storage = MockDiskStorage::new();
        let mut client = MockUploadClient::new();
        storage.expect_insert().returning(|_, _| Ok(()));
        client
            .expect_send()
            .withf(|descriptor: &RequestDescriptor| descriptor.explicit_timeout == Duration::from_secs(10))
            .times(2)
            .returning(|_| Ok(()));

        let exporter = exporter(storage, client, ExporterConfig::default());
        exporter.export(&[], Some(Duration::from_secs(60)));
        exporter.export(&[], None);
    }

    #[test]
    fn test_list_failure_aborts_pass() {
        let mut storage = MockDiskStorage::new();
        let mut client = MockUploadClient::new();
        storage
            .expect_list()
            .returning(|_| Err(SpoolError::storage("unreadable")));
        client.expect_cancel().never();
        client.expect_send().never();

        let exporter = exporter(storage, client, ExporterConfig::default());
        let id = Uuid::new_v4();
        exporter.check_stalled_uploads(&[task(1, &descriptor(id, 1), None)]);
    }

    #[test]
    fn test_task_without_earliest_begin_is_cancelled() {
        let mut client = MockUploadClient::new();
        client.expect_cancel().with(eq(7)).times(1).return_const(());
        client.expect_send().never();

        let exporter = exporter(listing(Vec::new()), client, ExporterConfig::default());
        exporter.check_stalled_uploads(&[task(7, &descriptor(Uuid::new_v4(), 1), None)]);
    }

    #[test]
    fn test_only_stalled_tasks_are_resubmitted() {
        let fresh = Uuid::new_v4();
        let stalled = Uuid::new_v4();
        let now = Utc::now();

        let mut client = MockUploadClient::new();
        client.expect_cancel().with(eq(2)).times(1).return_const(());
        client
            .expect_send()
            .withf(move |descriptor: &RequestDescriptor| descriptor.id == stalled && descriptor.sent_count == 5)
            .times(1)
            .returning(|_| Ok(()));

        let storage = listing(vec![item(&fresh.to_string()), item(&stalled.to_string())]);
        let exporter = exporter(storage, client, ExporterConfig::default());
        exporter.check_stalled_uploads_at(
            &[
                task(1, &descriptor(fresh, 1), Some(now + chrono::Duration::minutes(1))),
                task(2, &descriptor(stalled, 5), Some(now - chrono::Duration::seconds(11))),
            ],
            now,
        );
    }

    #[test]
    fn test_orphan_file_is_sent_as_new() {
        let orphan = Uuid::new_v4();
        let mut client = MockUploadClient::new();
        client.expect_cancel().never();
        client
            .expect_send()
            .withf(move |descriptor: &RequestDescriptor| {
                descriptor.id == orphan
                    && descriptor.sent_count == 0
                    && descriptor.explicit_timeout == Duration::from_secs(10)
            })
            .times(1)
            .returning(|_| Ok(()));

        let exporter = exporter(listing(vec![item(&orphan.to_string())]), client, ExporterConfig::default());
        exporter.check_stalled_uploads(&[]);
    }

    #[test]
    fn test_non_uuid_files_are_skipped() {
        let mut client = MockUploadClient::new();
        client.expect_send().never();

        let exporter = exporter(listing(vec![item("notes.txt")]), client, ExporterConfig::default());
        exporter.check_stalled_uploads(&[]);
    }

    #[test]
    fn test_young_untracked_files_are_skipped() {
        let id = Uuid::new_v4();
        let observed_at = Utc::now();
        let fresh = ItemInfo {
            modified: Some(observed_at - chrono::Duration::seconds(2)),
            ..item(&id.to_string())
        };
        let mut client = MockUploadClient::new();
        client.expect_send().never();

        let exporter = exporter(listing(vec![fresh]), client, ExporterConfig::default());
        exporter.check_stalled_uploads_at(&[], observed_at);
    }

    #[test]
    fn test_young_file_with_stalled_task_is_resubmitted() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let fresh = ItemInfo {
            modified: Some(now),
            ..item(&id.to_string())
        };
        let mut client = MockUploadClient::new();
        client.expect_cancel().with(eq(5)).times(1).return_const(());
        client
            .expect_send()
            .withf(move |descriptor: &RequestDescriptor| descriptor.id == id)
            .times(1)
            .returning(|_| Ok(()));

        let exporter = exporter(listing(vec![fresh]), client, ExporterConfig::default());
        exporter.check_stalled_uploads_at(
            &[task(5, &descriptor(id, 2), Some(now - chrono::Duration::minutes(5)))],
            now,
        );
    }

    #[test]
    fn test_duplicate_tasks_keep_only_latest_attempt() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut client = MockUploadClient::new();
        client.expect_cancel().with(eq(1)).times(1).return_const(());
        client.expect_send().never();

        let exporter = exporter(listing(vec![item(&id.to_string())]), client, ExporterConfig::default());
        exporter.check_stalled_uploads_at(
            &[
                task(1, &descriptor(id, 1), Some(now)),
                task(2, &descriptor(id, 2), Some(now + chrono::Duration::minutes(1))),
            ],
            now,
        );
    }

    #[test]
    fn test_stalled_task_without_file_is_cancelled() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut client = MockUploadClient::new();
        client.expect_cancel().with(eq(3)).times(1).return_const(());
        client.expect_send().never();

        let exporter = exporter(listing(Vec::new()), client, ExporterConfig::default());
        exporter.check_stalled_uploads_at(
            &[task(3, &descriptor(id, 2), Some(now - chrono::Duration::minutes(5)))],
            now,
        );
    }

    #[test]
    fn test_other_signals_and_undecodable_tasks_are_left_alone() {
        let now = Utc::now();
        let logs = RequestDescriptor::new(Uuid::new_v4(), endpoint(), Duration::from_secs(10), "logs");
        let garbage = TransferTask {
            id: 9,
            description: Some("garbage".to_string()),
            earliest_begin: Some(now - chrono::Duration::hours(1)),
            state: TaskState::Running,
        };
        let mut client = MockUploadClient::new();
        client.expect_cancel().never();
        client.expect_send().never();

        let exporter = exporter(listing(Vec::new()), client, ExporterConfig::default());
        exporter.check_stalled_uploads_at(
            &[task(4, &logs, Some(now - chrono::Duration::hours(1))), garbage],
            now,
        );
    }

    #[test]
    fn test_check_and_send_is_idempotent_for_healthy_tasks() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut client = MockUploadClient::new();
        client.expect_cancel().never();
        client.expect_send().never();

        let exporter = exporter(MockDiskStorage::new(), client, ExporterConfig::default());
        let existing = vec![LiveUpload {
            task_id: 1,
            descriptor: descriptor(id, 1),
            scheduled: now,
        }];
        for _ in 0..3 {
            exporter.check_and_send(&[id.to_string()], &existing, now - chrono::Duration::seconds(10));
        }
    }

    #[test]
    fn test_resubmit_errors_do_not_stop_the_pass() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let mut client = MockUploadClient::new();
        client
            .expect_send()
            .times(2)
            .returning(|_| -> Result<()> { Err(SpoolError::transport("rejected")) });

        let exporter = exporter(MockDiskStorage::new(), client, ExporterConfig::default());
        exporter.check_and_send(&[first.to_string(), second.to_string()], &[], Utc::now());
    }

    #[tokio::test]
    async fn test_force_flush_flushes_client() {
        let mut client = MockUploadClient::new();
        client.expect_flush().times(1).return_const(());

        let exporter = exporter(MockDiskStorage::new(), client, ExporterConfig::default());
        assert_eq!(exporter.force_flush().await, ExportResult::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_runs_at_start_and_every_interval() {
        let mut storage = MockDiskStorage::new();
        storage.expect_list().returning(|_| Ok(Vec::new()));
        let passes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = passes.clone();
        let mut client = MockUploadClient::new();
        client.expect_all_session_tasks().returning(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Vec::new()
        });

        let exporter = Arc::new(exporter(storage, client, ExporterConfig::default()));
        exporter.start_watchdog();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(passes.load(std::sync::atomic::Ordering::SeqCst), 3);

        assert_eq!(exporter.shutdown(), ExportResult::Success);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(passes.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_exporter_usable() {
        let mut storage = MockDiskStorage::new();
        storage.expect_list().returning(|_| Ok(Vec::new()));
        storage.expect_insert().returning(|_, _| Ok(()));
        let mut client = MockUploadClient::new();
        client.expect_all_session_tasks().returning(Vec::new);
        client.expect_send().times(1).returning(|_| Ok(()));

        let exporter = Arc::new(exporter(storage, client, ExporterConfig::default()));
        exporter.start_watchdog();
        assert_eq!(exporter.shutdown(), ExportResult::Success);
        assert_eq!(exporter.shutdown(), ExportResult::Success);
        assert_eq!(exporter.export(&[], None), ExportResult::Success);
    }
}
