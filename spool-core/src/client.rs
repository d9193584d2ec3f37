/*!
Background HTTP client.

Turns request descriptors into background transfer tasks and reacts to their
completions: successful uploads delete the staged payload, failed ones are
resubmitted with the next backoff delay until the retry policy gives up.
*/

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use spool_retry::RetryPolicy;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, warn};

use crate::descriptor::RequestDescriptor;
use crate::observability;
use crate::storage::DiskStorage;
use crate::transport::{
    BackgroundTransport, TaskId, TransferEvent, TransferEventKind, TransferFailure,
    TransferResponse, TransferTask, UploadTask,
};
use crate::Result;

/// Upload operations the exporter relies on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UploadClient: Send + Sync {
    /// Schedule an upload of the payload staged for `descriptor`
    ///
    /// Drops the payload instead when the retry policy refuses another attempt.
    fn send(&self, descriptor: &RequestDescriptor) -> Result<()>;

    /// Cancel a task; best effort
    fn cancel(&self, task_id: TaskId);

    /// Persist transfer session state
    async fn flush(&self);

    /// Live tasks of the transfer session
    async fn all_session_tasks(&self) -> Vec<TransferTask>;
}

/// [`UploadClient`] backed by a [`BackgroundTransport`] session
pub struct BackgroundHttpClient {
    storage: Arc<dyn DiskStorage>,
    transport: Arc<dyn BackgroundTransport>,
    policy: RetryPolicy,
    session: String,
}

impl BackgroundHttpClient {
    /// Create a client and attach it as the delegate of `transport`
    ///
    /// Transfer events are handled one at a time by a task spawned on the
    /// current Tokio runtime. Without a runtime the client can still send, but
    /// completions must be fed to [`BackgroundHttpClient::handle_event`].
    pub fn new<S: Into<String>>(
        storage: Arc<dyn DiskStorage>,
        transport: Arc<dyn BackgroundTransport>,
        policy: RetryPolicy,
        session: S,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        transport.set_delegate(sender);

        let client = Arc::new(Self {
            storage,
            transport,
            policy,
            session: session.into(),
        });

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(delegate_loop(Arc::downgrade(&client), receiver));
            }
            Err(_) => debug!(
                session = %client.session,
                "No Tokio runtime, transfer events are not handled automatically"
            ),
        }
        client
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// React to one delegate callback of the transfer session
    pub fn handle_event(&self, event: TransferEvent) {
        match event.kind {
            TransferEventKind::DataReceived(response) => {
                self.data_received(&event.task, &response)
            }
            TransferEventKind::Completed { status, error } => {
                self.task_completed(&event.task, status, error)
            }
        }
    }

    fn data_received(&self, task: &TransferTask, response: &TransferResponse) {
        if response.is_success() {
            return;
        }
        let body = String::from_utf8_lossy(&response.body);
        match task.decode_descriptor() {
            Ok(descriptor) => info!(
                session = %self.session,
                id = %descriptor.id,
                signal = %descriptor.file_key_type,
                sent_count = descriptor.sent_count,
                status = response.status,
                body = %body,
                "Collector rejected upload"
            ),
            Err(_) => info!(
                session = %self.session,
                task_id = task.id,
                status = response.status,
                body = %body,
                "Collector rejected upload"
            ),
        }
    }

    fn task_completed(&self, task: &TransferTask, status: Option<u16>, error: Option<TransferFailure>) {
        let descriptor = match task.decode_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                info!(
                    session = %self.session,
                    task_id = task.id,
                    error = %e,
                    "Completed task carries no request descriptor"
                );
                return;
            }
        };

        // Cancelled tasks are resubmitted by the reconciliation pass
        if matches!(error, Some(TransferFailure::Cancelled)) {
            debug!(session = %self.session, id = %descriptor.id, "Upload task cancelled");
            return;
        }

        let succeeded = error.is_none() && status.is_some_and(|status| (200..300).contains(&status));
        if succeeded {
            observability::record_upload_succeeded();
            info!(
                session = %self.session,
                id = %descriptor.id,
                signal = %descriptor.file_key_type,
                attempts = descriptor.sent_count,
                "Upload completed"
            );
            if let Err(e) = self.storage.delete(&descriptor.file_key()) {
                warn!(id = %descriptor.id, error = %e, "Failed to delete uploaded payload");
            }
            return;
        }

        info!(
            session = %self.session,
            id = %descriptor.id,
            signal = %descriptor.file_key_type,
            sent_count = descriptor.sent_count,
            status = ?status,
            error = ?error,
            "Upload failed"
        );
        observability::record_upload_retried();
        if let Err(e) = self.send(&descriptor) {
            warn!(id = %descriptor.id, error = %e, "Failed to reschedule upload");
        }
    }
}

async fn delegate_loop(client: Weak<BackgroundHttpClient>, mut events: UnboundedReceiver<TransferEvent>) {
    while let Some(event) = events.recv().await {
        let Some(client) = client.upgrade() else {
            break;
        };
        client.handle_event(event);
    }
}

#[async_trait]
impl UploadClient for BackgroundHttpClient {
    fn send(&self, descriptor: &RequestDescriptor) -> Result<()> {
        let key = descriptor.file_key();

        if !descriptor.should_send(&self.policy) {
            info!(
                session = %self.session,
                id = %descriptor.id,
                signal = %descriptor.file_key_type,
                sent_count = descriptor.sent_count,
                "Giving up on upload, deleting staged payload"
            );
            observability::record_upload_dropped();
            return self.storage.delete(&key);
        }

        let file = self.storage.final_destination(&key)?;
        if !self.storage.exists(&key)? {
            error!(
                session = %self.session,
                id = %descriptor.id,
                path = %file.display(),
                "Staged payload is missing, nothing to upload"
            );
            return Ok(());
        }

        let earliest_begin = descriptor.scheduled(&self.policy);
        let task = UploadTask {
            request: descriptor.create_request(),
            file,
            earliest_begin,
            description: descriptor.next_attempt().to_json()?,
        };
        let task_id = self.transport.submit(task)?;
        observability::record_upload_submitted();

        debug!(
            session = %self.session,
            task_id,
            id = %descriptor.id,
            sent_count = descriptor.sent_count,
            earliest_begin = %earliest_begin,
            "Scheduled upload"
        );
        Ok(())
    }

    fn cancel(&self, task_id: TaskId) {
        self.transport.cancel(task_id);
    }

    async fn flush(&self) {
        self.transport.flush().await;
    }

    async fn all_session_tasks(&self) -> Vec<TransferTask> {
        self.transport.all_tasks().await
    }
}
