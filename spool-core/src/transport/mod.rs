/*!
Background transfer sessions.

A [`BackgroundTransport`] owns upload tasks that run outside the caller's
control: tasks start no earlier than their `earliest_begin`, may outlive the
process that submitted them, and report progress to a single delegate channel.
Each task carries an opaque description (the JSON request descriptor) that is
handed back verbatim by [`BackgroundTransport::all_tasks`] and in events.
*/

pub mod http;
pub mod memory;

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

use crate::descriptor::RequestDescriptor;
use crate::Result;

pub use http::HttpTransport;
pub use memory::InMemoryTransport;

/// Identifier of a task within its session
pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for its earliest begin date or for the network
    Suspended,
    /// Request in flight
    Running,
}

/// Snapshot of a live task in a session
#[derive(Debug, Clone, PartialEq)]
pub struct TransferTask {
    pub id: TaskId,
    /// Opaque description given at submission
    pub description: Option<String>,
    pub earliest_begin: Option<DateTime<Utc>>,
    pub state: TaskState,
}

impl TransferTask {
    pub fn decode_descriptor(&self) -> Result<RequestDescriptor> {
        match &self.description {
            Some(description) => RequestDescriptor::from_json(description),
            None => Err(crate::SpoolError::invalid_descriptor(format!(
                "task {} has no description",
                self.id
            ))),
        }
    }
}

/// Outbound HTTP request of an upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    #[serde(with = "crate::config::duration_secs")]
    pub timeout: Duration,
}

impl UploadRequest {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Everything a transport needs to run one upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    pub request: UploadRequest,
    /// File whose contents become the request body
    pub file: PathBuf,
    pub earliest_begin: DateTime<Utc>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransferResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Why a task ended without a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFailure {
    Cancelled,
    Timeout,
    Network(String),
    FileUnavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEventKind {
    /// Response body received
    DataReceived(TransferResponse),
    /// Task finished; `status` is absent when no response arrived
    Completed {
        status: Option<u16>,
        error: Option<TransferFailure>,
    },
}

/// Delegate callback of a transport session
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub task: TransferTask,
    pub kind: TransferEventKind,
}

pub type EventSender = UnboundedSender<TransferEvent>;

/// Session that runs uploads in the background
#[async_trait]
pub trait BackgroundTransport: Send + Sync {
    /// Route every subsequent event of the session to `sender`
    fn set_delegate(&self, sender: EventSender);

    /// Schedule an upload
    fn submit(&self, task: UploadTask) -> Result<TaskId>;

    /// Cancel a task; unknown ids are ignored
    fn cancel(&self, id: TaskId);

    /// Live tasks of the session, including ones restored from a previous process
    async fn all_tasks(&self) -> Vec<TransferTask>;

    /// Persist session state
    async fn flush(&self);
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
