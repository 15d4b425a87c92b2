use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::SessionRecord;
use crate::error::{GridError, Result};
use crate::scheduler::board::Board;
use crate::scheduler::grid::{Grid, GridStatus};
use crate::scheduler::job::Job;
use crate::scheduler::session::SessionParams;

const MAILBOX_CAPACITY: usize = 256;

/// Message types for the grid event loop
#[derive(Debug)]
pub enum GridMessage {
    RegisterBoard(Arc<Board>),
    UnregisterBoard(String),
    SubmitSession {
        params: SessionParams,
        response_tx: oneshot::Sender<Result<()>>,
    },
    CancelSession {
        session_id: u64,
        response_tx: oneshot::Sender<bool>,
    },
    SaveSession {
        session_id: u64,
        image_name: String,
        response_tx: oneshot::Sender<Result<()>>,
    },
    Status {
        response_tx: oneshot::Sender<GridStatus>,
    },
}

/// Cloneable address of a running grid.
///
/// Every grid runs on its own task and processes one message or job
/// completion at a time, so scheduling decisions never interleave.
#[derive(Clone, Debug)]
pub struct GridHandle {
    platform: String,
    tx: mpsc::Sender<GridMessage>,
}

impl GridHandle {
    /// Reconcile `grid` against `unfinished` and run it until `shutdown`
    /// fires or every handle is dropped.
    pub fn spawn(
        mut grid: Grid,
        completions: mpsc::UnboundedReceiver<Arc<Job>>,
        unfinished: Vec<SessionRecord>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = Self {
            platform: grid.platform().name.clone(),
            tx,
        };

        let task = tokio::spawn(async move {
            grid.start(unfinished).await;
            run(grid, rx, completions, shutdown).await;
        });

        (handle, task)
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    async fn send(&self, message: GridMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| GridError::GridClosed(self.platform.clone()))
    }

    async fn request<T>(&self, message: GridMessage, response_rx: oneshot::Receiver<T>) -> Result<T> {
        self.send(message).await?;
        response_rx
            .await
            .map_err(|_| GridError::GridClosed(self.platform.clone()))
    }

    pub async fn register_board(&self, board: Arc<Board>) -> Result<()> {
        self.send(GridMessage::RegisterBoard(board)).await
    }

    pub async fn unregister_board(&self, hostname: &str) -> Result<()> {
        self.send(GridMessage::UnregisterBoard(hostname.to_string()))
            .await
    }

    pub async fn submit_session(&self, params: SessionParams) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(
            GridMessage::SubmitSession {
                params,
                response_tx,
            },
            response_rx,
        )
        .await?
    }

    /// Returns false if the session is not subscribed to this grid.
    pub async fn cancel_session(&self, session_id: u64) -> Result<bool> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(
            GridMessage::CancelSession {
                session_id,
                response_tx,
            },
            response_rx,
        )
        .await
    }

    pub async fn save_session(&self, session_id: u64, image_name: &str) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(
            GridMessage::SaveSession {
                session_id,
                image_name: image_name.to_string(),
                response_tx,
            },
            response_rx,
        )
        .await?
    }

    pub async fn status(&self) -> Result<GridStatus> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(GridMessage::Status { response_tx }, response_rx)
            .await
    }
}

async fn run(
    mut grid: Grid,
    mut rx: mpsc::Receiver<GridMessage>,
    mut completions: mpsc::UnboundedReceiver<Arc<Job>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                grid.stop();
                break;
            }

            Some(job) = completions.recv() => {
                grid.on_job_complete(job);
            }

            message = rx.recv() => {
                let Some(message) = message else {
                    grid.stop();
                    break;
                };
                handle_message(&mut grid, message).await;
            }
        }
    }
    tracing::debug!(platform = %grid.platform().name, "Grid loop exited");
}

async fn handle_message(grid: &mut Grid, message: GridMessage) {
    match message {
        GridMessage::RegisterBoard(board) => {
            grid.register_board(board);
            grid.schedule();
        }
        GridMessage::UnregisterBoard(hostname) => {
            grid.unregister_board(&hostname);
        }
        GridMessage::SubmitSession {
            params,
            response_tx,
        } => {
            let result = grid.submit_session(params).await;
            let _ = response_tx.send(result);
        }
        GridMessage::CancelSession {
            session_id,
            response_tx,
        } => {
            // Sessions are looked up on every grid, so a miss here is normal.
            let dismissed = grid.session(session_id).is_some() && grid.dismiss_session(session_id);
            if dismissed {
                grid.schedule();
            }
            let _ = response_tx.send(dismissed);
        }
        GridMessage::SaveSession {
            session_id,
            image_name,
            response_tx,
        } => {
            let _ = response_tx.send(grid.save_session(session_id, &image_name));
        }
        GridMessage::Status { response_tx } => {
            let _ = response_tx.send(grid.status());
        }
    }
}
