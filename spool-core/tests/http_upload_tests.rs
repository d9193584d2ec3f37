/*!
End-to-end upload tests against a local OTLP/HTTP mock collector.
*/

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use spool_core::{
    open_exporter, DiskStorage, ExportResult, ExporterConfig, KeyBuilder, LocalDiskStorage,
    PayloadCompression, RetryPolicy, RetrySchedule, SignalKind,
};
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{body_bytes, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn staged(storage: &LocalDiskStorage, kind: SignalKind) -> usize {
    storage
        .list(&KeyBuilder::uploads().append(kind.file_key_type()))
        .unwrap()
        .len()
}

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

fn quick_retries() -> RetryPolicy {
    RetryPolicy::new(5, RetrySchedule::Stepped(vec![Duration::from_millis(20)]))
}

#[tokio::test]
async fn test_custom_headers_reach_the_collector() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/logs"))
        .and(header("X-SF-Token", "secret"))
        .and(header("content-type", "application/x-protobuf"))
        .and(body_bytes(b"log-record".to_vec()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let storage = Arc::new(LocalDiskStorage::new(temp_dir.path()));
    let mut config = ExporterConfig::default();
    config
        .headers
        .insert("X-SF-Token".to_string(), "secret".to_string());
    let endpoint = SignalKind::Logs
        .endpoint_for(&Url::parse(&server.uri()).unwrap())
        .unwrap();

    let exporter = open_exporter(SignalKind::Logs, endpoint, config, storage.clone()).unwrap();
    let result = exporter.export(&[Bytes::from_static(b"log-record")], None);
    assert_eq!(result, ExportResult::Success);

    assert!(eventually(|| staged(&storage, SignalKind::Logs) == 0).await);
    exporter.shutdown();
}

#[tokio::test]
async fn test_server_errors_are_retried_until_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/traces"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/traces"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let storage = Arc::new(LocalDiskStorage::new(temp_dir.path()));
    let mut config = ExporterConfig::default();
    config.retry = quick_retries();
    config.perform_stalled_upload_check = false;
    let endpoint = Url::parse(&format!("{}/v1/traces", server.uri())).unwrap();

    let exporter = open_exporter(SignalKind::Trace, endpoint, config, storage.clone()).unwrap();
    exporter.export(&[Bytes::from_static(b"span")], None);

    assert!(eventually(|| staged(&storage, SignalKind::Trace) == 0).await);
}

#[tokio::test]
async fn test_gzip_payloads_are_labelled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/metrics"))
        .and(header("content-encoding", "gzip"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let storage = Arc::new(LocalDiskStorage::new(temp_dir.path()));
    let mut config = ExporterConfig::default();
    config.compression = PayloadCompression::Gzip;
    config.perform_stalled_upload_check = false;
    let endpoint = Url::parse(&format!("{}/v1/metrics", server.uri())).unwrap();

    let exporter = open_exporter(SignalKind::Metric, endpoint, config, storage.clone()).unwrap();
    exporter.export(&[Bytes::from_static(b"metric")], None);

    assert!(eventually(|| staged(&storage, SignalKind::Metric) == 0).await);
}

#[tokio::test]
async fn test_watchdog_uploads_payloads_left_by_previous_process() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/traces"))
        .and(body_bytes(b"from last run".to_vec()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let storage = Arc::new(LocalDiskStorage::new(temp_dir.path()));
    let id = uuid::Uuid::new_v4();
    let key = KeyBuilder::uploads().append("trace").append(id.to_string());
    storage.insert(b"from last run", &key).unwrap();
    let file = std::fs::File::options()
        .write(true)
        .open(storage.final_destination(&key).unwrap())
        .unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(3600))
        .unwrap();

    let endpoint = Url::parse(&format!("{}/v1/traces", server.uri())).unwrap();
    let exporter =
        open_exporter(SignalKind::Trace, endpoint, ExporterConfig::default(), storage.clone())
            .unwrap();

    assert!(eventually(|| staged(&storage, SignalKind::Trace) == 0).await);
    exporter.shutdown();
}
