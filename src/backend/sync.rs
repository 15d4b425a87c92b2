use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::backend::Backend;
use crate::events::UserEvent;
use crate::scheduler::job::JobState;
use crate::scheduler::session::SessionState;

#[derive(Debug)]
enum BackendUpdate {
    JobState { job_id: u64, state: JobState },
    SessionState { name: String, state: SessionState },
    Publish { username: String, event: UserEvent },
    Flush(oneshot::Sender<()>),
}

/// Ordered, fire-and-forget writer for state updates and user events.
///
/// Updates are applied by a single task in the order they were submitted, so
/// a job is never reported COMPLETED before RUNNING. Failures are logged and
/// dropped; in-memory scheduling state stays authoritative.
#[derive(Clone)]
pub struct BackendSync {
    tx: mpsc::UnboundedSender<BackendUpdate>,
}

impl BackendSync {
    /// Spawn the writer task for `backend`.
    pub fn spawn(backend: Arc<dyn Backend>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                Self::apply(backend.as_ref(), update).await;
            }
            tracing::debug!("Backend sync writer stopped");
        });

        Self { tx }
    }

    async fn apply(backend: &dyn Backend, update: BackendUpdate) {
        match update {
            BackendUpdate::JobState { job_id, state } => {
                if let Err(e) = backend.job_update(job_id, state).await {
                    tracing::error!(job_id, ?state, error = %e, "Failed to persist job state");
                }
            }
            BackendUpdate::SessionState { name, state } => {
                if let Err(e) = backend.session_update_state(&name, state).await {
                    tracing::error!(session = %name, ?state, error = %e, "Failed to persist session state");
                }
            }
            BackendUpdate::Publish { username, event } => {
                if let Err(e) = backend.publish_data(&username, &event).await {
                    tracing::warn!(user = %username, kind = event.kind(), error = %e, "Failed to publish user event");
                }
            }
            BackendUpdate::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    fn send(&self, update: BackendUpdate) {
        if self.tx.send(update).is_err() {
            tracing::warn!("Backend sync writer is gone, update dropped");
        }
    }

    pub fn job_state(&self, job_id: u64, state: JobState) {
        self.send(BackendUpdate::JobState { job_id, state });
    }

    pub fn session_state(&self, name: &str, state: SessionState) {
        self.send(BackendUpdate::SessionState {
            name: name.to_string(),
            state,
        });
    }

    pub fn publish(&self, username: &str, event: UserEvent) {
        self.send(BackendUpdate::Publish {
            username: username.to_string(),
            event,
        });
    }

    /// Wait until every update submitted so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(BackendUpdate::Flush(tx));
        let _ = rx.await;
    }
}
