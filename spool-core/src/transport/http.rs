/*!
Journal-backed background transport over reqwest.

Every live task of a session is recorded in `<session dir>/<identifier>.tasks.json`.
Opening a session with the same identifier restores those tasks and resumes
them, so uploads submitted by a previous process still run and still report to
the new delegate.
*/

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    lock, BackgroundTransport, EventSender, TaskId, TaskState, TransferEvent, TransferEventKind,
    TransferFailure, TransferResponse, TransferTask, UploadTask,
};
use crate::config::SessionQos;
use crate::{Result, SpoolError};

const JOURNAL_SUFFIX: &str = ".tasks.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    id: TaskId,
    upload: UploadTask,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Journal {
    identifier: String,
    qos: Option<SessionQos>,
    next_id: TaskId,
    tasks: Vec<JournalEntry>,
}

struct LiveTask {
    upload: UploadTask,
    state: TaskState,
    runner: Option<JoinHandle<()>>,
}

impl LiveTask {
    fn snapshot(&self, id: TaskId) -> TransferTask {
        TransferTask {
            id,
            description: Some(self.upload.description.clone()),
            earliest_begin: Some(self.upload.earliest_begin),
            state: self.state,
        }
    }
}

#[derive(Default)]
struct SessionState {
    next_id: TaskId,
    tasks: BTreeMap<TaskId, LiveTask>,
    delegate: Option<EventSender>,
    /// Events produced before a delegate was attached
    pending: Vec<TransferEvent>,
}

struct Session {
    identifier: String,
    journal_path: PathBuf,
    qos: SessionQos,
    state: Mutex<SessionState>,
}

impl Session {
    fn persist(&self, state: &SessionState) {
        let journal = Journal {
            identifier: self.identifier.clone(),
            qos: Some(self.qos),
            next_id: state.next_id,
            tasks: state
                .tasks
                .iter()
                .map(|(id, task)| JournalEntry {
                    id: *id,
                    upload: task.upload.clone(),
                })
                .collect(),
        };
        if let Err(e) = write_journal(&self.journal_path, &journal) {
            warn!(
                session = %self.identifier,
                error = %e,
                "Failed to persist transfer journal"
            );
        }
    }

    fn dispatch(&self, state: &mut SessionState, event: TransferEvent) {
        let undelivered = match &state.delegate {
            Some(delegate) => delegate.send(event).err().map(|returned| returned.0),
            None => Some(event),
        };
        if let Some(event) = undelivered {
            if state.delegate.take().is_some() {
                debug!(session = %self.identifier, "Delegate dropped, queueing transfer events");
            }
            state.pending.push(event);
        }
    }

    fn mark_running(&self, id: TaskId) {
        if let Some(task) = lock(&self.state).tasks.get_mut(&id) {
            task.state = TaskState::Running;
        }
    }

    /// Remove a finished task and report it; a task cancelled meanwhile is not reported
    fn finish(&self, id: TaskId, events: Vec<TransferEventKind>) {
        let mut state = lock(&self.state);
        let Some(task) = state.tasks.remove(&id) else {
            return;
        };
        self.persist(&state);
        let snapshot = task.snapshot(id);
        for kind in events {
            self.dispatch(
                &mut state,
                TransferEvent {
                    task: snapshot.clone(),
                    kind,
                },
            );
        }
    }
}

fn write_journal(path: &Path, journal: &Journal) -> Result<()> {
    let data = serde_json::to_vec_pretty(journal)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn read_journal(path: &Path) -> Option<Journal> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(_) => return None,
    };
    match serde_json::from_slice(&data) {
        Ok(journal) => Some(journal),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable transfer journal");
            None
        }
    }
}

/// Background transport that uploads staged files with reqwest
///
/// Must be opened inside a Tokio runtime; each task runs as a Tokio task that
/// sleeps until its earliest begin date, posts the file and reports the outcome.
pub struct HttpTransport {
    session: Arc<Session>,
    client: reqwest::Client,
    runtime: Handle,
}

impl HttpTransport {
    /// Open (or restore) the session `identifier` journalled under `session_dir`
    pub fn open<P: AsRef<Path>>(session_dir: P, identifier: &str, qos: SessionQos) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| SpoolError::transport("HttpTransport must be opened inside a Tokio runtime"))?;
        let session_dir = session_dir.as_ref();
        fs::create_dir_all(session_dir).map_err(|e| {
            SpoolError::storage(format!(
                "Failed to create session directory {}: {}",
                session_dir.display(),
                e
            ))
        })?;
        let client = reqwest::Client::builder().build()?;

        let journal_path = session_dir.join(format!("{identifier}{JOURNAL_SUFFIX}"));
        let journal = read_journal(&journal_path).unwrap_or_default();

        // The host has no network classification; QoS flags are kept for the journal only.
        info!(
            session = identifier,
            cellular = qos.allows_cellular_access,
            constrained = qos.allows_constrained_network_access,
            expensive = qos.allows_expensive_network_access,
            restored = journal.tasks.len(),
            "Opened background transfer session"
        );

        let mut state = SessionState {
            next_id: journal.next_id,
            ..SessionState::default()
        };
        for entry in &journal.tasks {
            state.next_id = state.next_id.max(entry.id);
            state.tasks.insert(
                entry.id,
                LiveTask {
                    upload: entry.upload.clone(),
                    state: TaskState::Suspended,
                    runner: None,
                },
            );
        }

        let transport = Self {
            session: Arc::new(Session {
                identifier: identifier.to_string(),
                journal_path,
                qos,
                state: Mutex::new(state),
            }),
            client,
            runtime,
        };
        for entry in journal.tasks {
            transport.start(entry.id, entry.upload);
        }
        Ok(transport)
    }

    pub fn identifier(&self) -> &str {
        &self.session.identifier
    }

    pub fn journal_path(&self) -> &Path {
        &self.session.journal_path
    }

    fn start(&self, id: TaskId, upload: UploadTask) {
        let runner = self.runtime.spawn(run_upload(
            Arc::clone(&self.session),
            self.client.clone(),
            id,
            upload,
        ));
        match lock(&self.session.state).tasks.get_mut(&id) {
            Some(task) => task.runner = Some(runner),
            // Finished before the handle was stored
            None => drop(runner),
        }
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        // Journalled tasks resume when the session is opened again.
        let state = lock(&self.session.state);
        for task in state.tasks.values() {
            if let Some(runner) = &task.runner {
                runner.abort();
            }
        }
    }
}

async fn run_upload(session: Arc<Session>, client: reqwest::Client, id: TaskId, upload: UploadTask) {
    let wait = (upload.earliest_begin - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }
    session.mark_running(id);

    let body = match tokio::fs::read(&upload.file).await {
        Ok(body) => body,
        Err(e) => {
            session.finish(
                id,
                vec![TransferEventKind::Completed {
                    status: None,
                    error: Some(TransferFailure::FileUnavailable(format!(
                        "{}: {}",
                        upload.file.display(),
                        e
                    ))),
                }],
            );
            return;
        }
    };

    let method = match Method::from_bytes(upload.request.method.as_bytes()) {
        Ok(method) => method,
        Err(e) => {
            session.finish(
                id,
                vec![TransferEventKind::Completed {
                    status: None,
                    error: Some(TransferFailure::Network(e.to_string())),
                }],
            );
            return;
        }
    };

    let mut request = client
        .request(method, upload.request.url.clone())
        .timeout(upload.request.timeout)
        .body(body);
    for (name, value) in &upload.request.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let events = match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let body = match response.bytes().await {
                Ok(body) => body.to_vec(),
                Err(e) => {
                    debug!(task_id = id, error = %e, "Failed to read response body");
                    Vec::new()
                }
            };
            vec![
                TransferEventKind::DataReceived(TransferResponse { status, body }),
                TransferEventKind::Completed {
                    status: Some(status),
                    error: None,
                },
            ]
        }
        Err(e) => {
            let failure = if e.is_timeout() {
                TransferFailure::Timeout
            } else {
                TransferFailure::Network(e.to_string())
            };
            vec![TransferEventKind::Completed {
                status: None,
                error: Some(failure),
            }]
        }
    };
    session.finish(id, events);
}

#[async_trait]
impl BackgroundTransport for HttpTransport {
    fn set_delegate(&self, sender: EventSender) {
        let mut state = lock(&self.session.state);
        for event in state.pending.drain(..).collect::<Vec<_>>() {
            if sender.send(event).is_err() {
                break;
            }
        }
        state.delegate = Some(sender);
    }

    fn submit(&self, task: UploadTask) -> Result<TaskId> {
        let id = {
            let mut state = lock(&self.session.state);
            state.next_id += 1;
            let id = state.next_id;
            state.tasks.insert(
                id,
                LiveTask {
                    upload: task.clone(),
                    state: TaskState::Suspended,
                    runner: None,
                },
            );
            self.session.persist(&state);
            id
        };

        debug!(
            session = %self.session.identifier,
            task_id = id,
            earliest_begin = %task.earliest_begin,
            "Submitted upload task"
        );
        self.start(id, task);
        Ok(id)
    }

    fn cancel(&self, id: TaskId) {
        let mut state = lock(&self.session.state);
        let Some(task) = state.tasks.remove(&id) else {
            return;
        };
        if let Some(runner) = &task.runner {
            runner.abort();
        }
        self.session.persist(&state);
        let event = TransferEvent {
            task: task.snapshot(id),
            kind: TransferEventKind::Completed {
                status: None,
                error: Some(TransferFailure::Cancelled),
            },
        };
        self.session.dispatch(&mut state, event);
    }

    async fn all_tasks(&self) -> Vec<TransferTask> {
        lock(&self.session.state)
            .tasks
            .iter()
            .map(|(id, task)| task.snapshot(*id))
            .collect()
    }

    async fn flush(&self) {
        let state = lock(&self.session.state);
        self.session.persist(&state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UploadRequest;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use url::Url;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn upload(url: Url, file: PathBuf, delay: chrono::Duration) -> UploadTask {
        UploadTask {
            request: UploadRequest {
                method: "POST".to_string(),
                url,
                headers: vec![
                    ("Content-Type".to_string(), "application/x-protobuf".to_string()),
                    ("X-SF-Token".to_string(), "token".to_string()),
                ],
                timeout: Duration::from_secs(5),
            },
            file,
            earliest_begin: Utc::now() + delay,
            description: "{\"id\":\"test\"}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_upload_posts_file_and_reports_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .and(header("x-sf-token", "token"))
            .and(body_bytes(b"payload".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("payload");
        fs::write(&file, b"payload").unwrap();
        let transport = HttpTransport::open(temp_dir.path(), "test", SessionQos::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_delegate(tx);

        let url = Url::parse(&format!("{}/v1/traces", server.uri())).unwrap();
        let id = transport
            .submit(upload(url, file, chrono::Duration::zero()))
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.task.id, id);
        assert!(matches!(first.kind, TransferEventKind::DataReceived(ref r) if r.status == 200));
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second.kind,
            TransferEventKind::Completed { status: Some(200), error: None }
        );
        assert!(transport.all_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_reports_file_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let transport = HttpTransport::open(temp_dir.path(), "test", SessionQos::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_delegate(tx);

        let url = Url::parse("http://127.0.0.1:9/v1/logs").unwrap();
        transport
            .submit(upload(url, temp_dir.path().join("gone"), chrono::Duration::zero()))
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            TransferEventKind::Completed { status: None, error: Some(TransferFailure::FileUnavailable(_)) }
        ));
    }

    #[tokio::test]
    async fn test_session_restores_journalled_tasks() {
        let temp_dir = TempDir::new().unwrap();
        let url = Url::parse("http://127.0.0.1:9/v1/traces").unwrap();
        let task = upload(url, temp_dir.path().join("payload"), chrono::Duration::hours(1));

        let id = {
            let transport =
                HttpTransport::open(temp_dir.path(), "restore", SessionQos::default()).unwrap();
            let id = transport.submit(task.clone()).unwrap();
            assert!(transport.journal_path().exists());
            id
        };

        let reopened = HttpTransport::open(temp_dir.path(), "restore", SessionQos::default()).unwrap();
        let tasks = reopened.all_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);
        assert_eq!(tasks[0].description.as_deref(), Some(task.description.as_str()));
        assert_eq!(tasks[0].earliest_begin, Some(task.earliest_begin));

        let (tx, mut rx) = mpsc::unbounded_channel();
        reopened.set_delegate(tx);
        reopened.cancel(id);
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            TransferEventKind::Completed { error: Some(TransferFailure::Cancelled), .. }
        ));

        let journal = read_journal(reopened.journal_path()).unwrap();
        assert!(journal.tasks.is_empty());
        assert!(reopened.submit(task).unwrap() > id);
    }

    #[test]
    fn test_open_requires_runtime() {
        let temp_dir = TempDir::new().unwrap();
        let result = HttpTransport::open(temp_dir.path(), "test", SessionQos::default());
        assert!(matches!(result, Err(SpoolError::Transport(_))));
    }
}
