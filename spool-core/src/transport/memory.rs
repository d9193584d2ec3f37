/*!
In-process transport that never touches the network.

Tasks stay live until a caller drives them with [`InMemoryTransport::complete`]
or [`InMemoryTransport::respond`]. Used by tests and by dry runs of the CLI.
*/

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    lock, BackgroundTransport, EventSender, TaskId, TaskState, TransferEvent, TransferEventKind,
    TransferFailure, TransferResponse, TransferTask, UploadTask,
};
use crate::{Result, SpoolError};

#[derive(Debug, Default)]
struct Inner {
    next_id: TaskId,
    live: BTreeMap<TaskId, TransferTask>,
    submitted: Vec<(TaskId, UploadTask)>,
    cancelled: Vec<TaskId>,
    delegate: Option<EventSender>,
    reject_submissions: bool,
    flushes: usize,
}

#[derive(Debug, Default)]
pub struct InMemoryTransport {
    inner: Mutex<Inner>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a live task, as if restored from a previous process
    pub fn insert_live(
        &self,
        description: Option<String>,
        earliest_begin: Option<DateTime<Utc>>,
    ) -> TaskId {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.live.insert(
            id,
            TransferTask {
                id,
                description,
                earliest_begin,
                state: TaskState::Suspended,
            },
        );
        id
    }

    /// Uploads submitted so far, oldest first
    pub fn submitted(&self) -> Vec<(TaskId, UploadTask)> {
        lock(&self.inner).submitted.clone()
    }

    /// Every id passed to `cancel`, including unknown ones
    pub fn cancelled(&self) -> Vec<TaskId> {
        lock(&self.inner).cancelled.clone()
    }

    pub fn live_count(&self) -> usize {
        lock(&self.inner).live.len()
    }

    pub fn flush_count(&self) -> usize {
        lock(&self.inner).flushes
    }

    /// Make subsequent submissions fail
    pub fn reject_submissions(&self, reject: bool) {
        lock(&self.inner).reject_submissions = reject;
    }

    /// Deliver a response body for a live task
    pub fn respond(&self, id: TaskId, status: u16, body: Vec<u8>) -> Option<TransferEvent> {
        let mut inner = lock(&self.inner);
        let task = inner.live.get(&id)?.clone();
        let event = TransferEvent {
            task,
            kind: TransferEventKind::DataReceived(TransferResponse { status, body }),
        };
        dispatch(&mut inner, event.clone());
        Some(event)
    }

    /// Finish a live task and notify the delegate
    pub fn complete(
        &self,
        id: TaskId,
        status: Option<u16>,
        error: Option<TransferFailure>,
    ) -> Option<TransferEvent> {
        let mut inner = lock(&self.inner);
        let task = inner.live.remove(&id)?;
        let event = TransferEvent {
            task,
            kind: TransferEventKind::Completed { status, error },
        };
        dispatch(&mut inner, event.clone());
        Some(event)
    }
}

fn dispatch(inner: &mut Inner, event: TransferEvent) {
    if let Some(delegate) = &inner.delegate {
        if delegate.send(event).is_err() {
            debug!("Delegate dropped, discarding transfer event");
            inner.delegate = None;
        }
    }
}

#[async_trait]
impl BackgroundTransport for InMemoryTransport {
    fn set_delegate(&self, sender: EventSender) {
        lock(&self.inner).delegate = Some(sender);
    }

    fn submit(&self, task: UploadTask) -> Result<TaskId> {
        let mut inner = lock(&self.inner);
        if inner.reject_submissions {
            return Err(SpoolError::transport("session rejected the upload"));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.live.insert(
            id,
            TransferTask {
                id,
                description: Some(task.description.clone()),
                earliest_begin: Some(task.earliest_begin),
                state: TaskState::Suspended,
            },
        );
        inner.submitted.push((id, task));
        Ok(id)
    }

    fn cancel(&self, id: TaskId) {
        let mut inner = lock(&self.inner);
        inner.cancelled.push(id);
        if let Some(task) = inner.live.remove(&id) {
            let event = TransferEvent {
                task,
                kind: TransferEventKind::Completed {
                    status: None,
                    error: Some(TransferFailure::Cancelled),
                },
            };
            dispatch(&mut inner, event);
        }
    }

    async fn all_tasks(&self) -> Vec<TransferTask> {
        lock(&self.inner).live.values().cloned().collect()
    }

    async fn flush(&self) {
        lock(&self.inner).flushes += 1;
    }
}
