use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backend::{Backend, BackendSync};
use crate::config::{RegistryConfig, ServiceConfig, WorkspaceConfig};
use crate::error::{GridError, Result};
use crate::scheduler::board::Board;
use crate::scheduler::job::{Job, JobContext, JobId, JobState};
use crate::scheduler::session::{Session, SessionParams, SessionStatus};
use crate::ssh::SshPortBroker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub id: u64,
    pub name: String,
}

/// Collaborators shared by every grid of a service.
#[derive(Clone)]
pub struct GridDeps {
    pub backend: Arc<dyn Backend>,
    pub sync: BackendSync,
    pub ssh: Arc<SshPortBroker>,
    pub registry: RegistryConfig,
    pub workspace: WorkspaceConfig,
    pub exclusive: bool,
}

impl GridDeps {
    /// Spawns the backend writer, so it must be called within a runtime.
    pub fn new(config: &ServiceConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            sync: BackendSync::spawn(backend.clone()),
            backend,
            ssh: Arc::new(SshPortBroker::new(&config.ssh)),
            registry: config.registry.clone(),
            workspace: config.workspace.clone(),
            exclusive: config.exclusive_jobs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardStatus {
    pub hostname: String,
    pub address: String,
    pub used: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningJobStatus {
    pub id: JobId,
    pub session_id: u64,
    pub session: String,
    pub state: JobState,
    pub board: Option<String>,
    pub container: Option<String>,
    pub started: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridStatus {
    pub platform: Platform,
    pub boards: Vec<BoardStatus>,
    pub subscribers: Vec<SessionStatus>,
    pub running_jobs: Vec<RunningJobStatus>,
}

/// Scheduler for one platform.
///
/// The grid owns the platform's boards, the queue of sessions with work
/// ("subscribers") and the jobs currently running. It is driven by a single
/// task (see [`crate::scheduler::handle`]), so none of its state needs
/// locking. Jobs report back through the completion receiver returned by
/// [`Grid::new`].
pub struct Grid {
    platform: Platform,
    pub(crate) boards: Vec<Arc<Board>>,
    pub(crate) subscribers: VecDeque<Session>,
    pub(crate) running_jobs: Vec<Arc<Job>>,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) sync: BackendSync,
    pub(crate) ctx: Arc<JobContext>,
}

impl Grid {
    pub fn new(platform: Platform, deps: &GridDeps) -> (Self, mpsc::UnboundedReceiver<Arc<Job>>) {
        let (ctx, completions) = JobContext::new(platform.clone(), deps);
        let grid = Self {
            platform,
            boards: Vec::new(),
            subscribers: VecDeque::new(),
            running_jobs: Vec::new(),
            backend: deps.backend.clone(),
            sync: deps.sync.clone(),
            ctx,
        };
        (grid, completions)
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn boards(&self) -> &[Arc<Board>] {
        &self.boards
    }

    pub fn running_jobs(&self) -> &[Arc<Job>] {
        &self.running_jobs
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &Session> {
        self.subscribers.iter()
    }

    pub fn session(&self, id: u64) -> Option<&Session> {
        self.subscribers.iter().find(|s| s.id() == id)
    }

    /// Add a board to the pool.
    ///
    /// A job still running on a board of the same hostname keeps it: the
    /// job's board goes back into the pool in place of `board`, so it stays
    /// occupied until that job releases it.
    pub fn register_board(&mut self, board: Arc<Board>) {
        if self.boards.iter().any(|b| b.hostname == board.hostname) {
            tracing::warn!(platform = %self.platform.name, board = %board.hostname, "Board already registered");
            return;
        }
        let held = self
            .running_jobs
            .iter()
            .filter_map(|j| j.board())
            .find(|b| b.hostname == board.hostname);
        let board = match held {
            Some(held) => {
                tracing::warn!(
                    platform = %self.platform.name,
                    board = %board.hostname,
                    "Board is still held by a running job, keeping it occupied"
                );
                held
            }
            None => board,
        };
        self.boards.push(board);
        tracing::info!(
            platform = %self.platform.name,
            boards = self.boards.len(),
            "Registered board"
        );
    }

    pub fn unregister_board(&mut self, hostname: &str) -> Option<Arc<Board>> {
        match self.boards.iter().position(|b| b.hostname == hostname) {
            Some(index) => {
                let board = self.boards.remove(index);
                tracing::info!(
                    platform = %self.platform.name,
                    board = %hostname,
                    boards = self.boards.len(),
                    "Unregistered board"
                );
                Some(board)
            }
            None => {
                tracing::error!(platform = %self.platform.name, board = %hostname, "Board to unregister is not registered");
                None
            }
        }
    }

    /// Expand a new session, queue it and schedule.
    ///
    /// If expansion fails the session is not queued and the error is
    /// returned.
    pub async fn submit_session(&mut self, params: SessionParams) -> Result<()> {
        let mut session = Session::new(params, self.sync.clone());
        if let Err(e) = session.start(self.backend.as_ref(), &self.ctx).await {
            tracing::error!(platform = %self.platform.name, session = %session.name(), error = %e, "Session rejected");
            return Err(e);
        }

        self.subscribe(session);
        self.schedule();
        Ok(())
    }

    pub(crate) fn subscribe(&mut self, session: Session) {
        tracing::info!(
            platform = %self.platform.name,
            session = %session.name(),
            subscribers = self.subscribers.len() + 1,
            "Subscribed session"
        );
        self.subscribers.push_back(session);
    }

    /// Stop a session and drop it from the queue. Its running jobs stay in
    /// `running_jobs` until their cancellation completes and frees the board.
    pub fn dismiss_session(&mut self, id: u64) -> bool {
        match self.subscribers.iter().position(|s| s.id() == id) {
            Some(index) => {
                if let Some(mut session) = self.subscribers.remove(index) {
                    session.stop();
                    tracing::info!(
                        platform = %self.platform.name,
                        session = %session.name(),
                        subscribers = self.subscribers.len(),
                        "Dismissed session"
                    );
                }
                true
            }
            None => {
                tracing::error!(platform = %self.platform.name, session_id = id, "Session to dismiss is not subscribed");
                false
            }
        }
    }

    /// Claim the first free board in registration order.
    pub fn select_free_board(&self) -> Option<Arc<Board>> {
        claim_free_board(&self.boards)
    }

    /// Hand out jobs to free boards, round-robin over the subscribers.
    pub fn schedule(&mut self) {
        tracing::debug!(
            platform = %self.platform.name,
            boards = self.boards.len(),
            subscribers = self.subscribers.len(),
            running = self.running_jobs.len(),
            "Scheduling"
        );

        if self.running_jobs.len() > self.boards.len() {
            tracing::error!(
                platform = %self.platform.name,
                running = self.running_jobs.len(),
                boards = self.boards.len(),
                "More running jobs than boards, skipping scheduling cycle"
            );
            return;
        }

        let mut skipped = 0;
        while self.running_jobs.len() < self.boards.len() && skipped < self.subscribers.len() {
            let Some(head) = self.subscribers.front_mut() else {
                break;
            };

            if head.is_done() {
                let id = head.id();
                self.dismiss_session(id);
                continue;
            }

            if head.can_accept() {
                let Some(board) = claim_free_board(&self.boards) else {
                    tracing::error!(platform = %self.platform.name, "No free board although capacity remains");
                    break;
                };
                match head.accept_next() {
                    Some(job) => {
                        self.running_jobs.push(job.clone());
                        job.start(board);
                        skipped = 0;
                    }
                    None => {
                        board.release();
                        skipped += 1;
                    }
                }
            } else {
                skipped += 1;
            }

            self.subscribers.rotate_left(1);
        }
    }

    /// Account for a terminated job and reschedule.
    pub fn on_job_complete(&mut self, job: Arc<Job>) {
        job.stamp_completed();

        let session_done = match self.subscribers.iter_mut().find(|s| s.id() == job.session_id()) {
            Some(session) => {
                session.on_complete(&job);
                session.is_done()
            }
            None => {
                // The session was dismissed while the job was winding down.
                self.sync.job_state(job.id(), job.state());
                false
            }
        };

        let before = self.running_jobs.len();
        self.running_jobs.retain(|j| j.id() != job.id());
        if self.running_jobs.len() == before {
            tracing::error!(platform = %self.platform.name, job_id = job.id(), "Completed job is not in the running set");
        }

        if session_done {
            tracing::info!(platform = %self.platform.name, session_id = job.session_id(), "All jobs of session are done");
            self.dismiss_session(job.session_id());
        }

        self.schedule();
    }

    /// Save the container of a session's running job as `image_name`. The
    /// commit, push and registration run in the background.
    pub fn save_session(&self, session_id: u64, image_name: &str) -> Result<()> {
        let session = self
            .session(session_id)
            .ok_or(GridError::SessionNotFound(session_id))?;
        let job = session.first_running().ok_or(GridError::NoRunningJob {
            session: session_id,
        })?;
        if job.container_id().is_none() {
            return Err(GridError::NoContainer(job.id()));
        }

        let image_name = image_name.to_string();
        tokio::spawn(async move {
            match job.save(&image_name).await {
                Ok(record) => {
                    tracing::info!(job_id = job.id(), image = %record.name, "Image saved");
                }
                Err(e) => {
                    tracing::error!(job_id = job.id(), image = %image_name, error = %e, "Failed to save image");
                }
            }
        });
        Ok(())
    }

    pub fn status(&self) -> GridStatus {
        GridStatus {
            platform: self.platform.clone(),
            boards: self
                .boards
                .iter()
                .map(|b| BoardStatus {
                    hostname: b.hostname.clone(),
                    address: b.address.clone(),
                    used: b.is_used(),
                })
                .collect(),
            subscribers: self.subscribers.iter().map(Session::status).collect(),
            running_jobs: self
                .running_jobs
                .iter()
                .map(|j| RunningJobStatus {
                    id: j.id(),
                    session_id: j.session_id(),
                    session: j.spec().session_name.clone(),
                    state: j.state(),
                    board: j.board().map(|b| b.hostname.clone()),
                    container: j.container_id(),
                    started: j.timestamps().started,
                })
                .collect(),
        }
    }

    /// Stop scheduling. Running jobs are left alone so the next start can
    /// reconcile them.
    pub fn stop(&mut self) {
        tracing::info!(
            platform = %self.platform.name,
            running = self.running_jobs.len(),
            subscribers = self.subscribers.len(),
            "Stopping grid"
        );
        self.subscribers.clear();
        self.running_jobs.clear();
    }
}

fn claim_free_board(boards: &[Arc<Board>]) -> Option<Arc<Board>> {
    boards.iter().find(|b| b.try_use()).cloned()
}
