use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, BackendSync, JobRecord, SessionRecord};
use crate::error::{GridError, Result};
use crate::scheduler::job::{Job, JobContext, JobId, JobSpec, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Submitted,
    Running,
    Completed,
    Canceled,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Submitted => write!(f, "submitted"),
            SessionState::Running => write!(f, "running"),
            SessionState::Completed => write!(f, "completed"),
            SessionState::Canceled => write!(f, "canceled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Batch,
    Interactive,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerImage {
    pub name: String,
    #[serde(default)]
    pub options: String,
}

impl DockerImage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub id: u64,
    pub name: String,
    pub username: String,
    pub kind: SessionKind,
    pub max_concurrency: u32,
    pub image: DockerImage,
    pub command: Vec<String>,
    pub dataset_split: u32,
}

impl From<&SessionRecord> for SessionParams {
    fn from(record: &SessionRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            username: record.username.clone(),
            kind: record.kind,
            max_concurrency: record.max_jobs,
            image: record.docker_image.clone(),
            command: record.command.clone(),
            dataset_split: record.dataset_split,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: u64,
    pub name: String,
    pub username: String,
    pub kind: SessionKind,
    pub state: SessionState,
    pub max_concurrency: u32,
    pub total_jobs: usize,
    pub pending: usize,
    pub running: Vec<JobId>,
}

/// One user submission and the jobs it expanded into.
///
/// Jobs wait in `pending` in chunk order and move to `running` when the grid
/// accepts them. At most `max_concurrency` jobs run at once.
pub struct Session {
    params: SessionParams,
    state: SessionState,
    pending: VecDeque<Arc<Job>>,
    running: Vec<Arc<Job>>,
    total_jobs: usize,
    announced: bool,
    sync: BackendSync,
}

impl Session {
    pub fn new(mut params: SessionParams, sync: BackendSync) -> Self {
        params.max_concurrency = params.max_concurrency.max(1);
        params.dataset_split = params.dataset_split.max(1);
        Self {
            params,
            state: SessionState::Submitted,
            pending: VecDeque::new(),
            running: Vec::new(),
            total_jobs: 0,
            announced: false,
            sync,
        }
    }

    pub fn id(&self) -> u64 {
        self.params.id
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_batch(&self) -> bool {
        self.params.kind == SessionKind::Batch
    }

    pub fn is_interactive(&self) -> bool {
        self.params.kind == SessionKind::Interactive
    }

    pub fn total_jobs(&self) -> usize {
        self.total_jobs
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn running(&self) -> &[Arc<Job>] {
        &self.running
    }

    /// Expand the session into jobs registered with the backend.
    ///
    /// Batch sessions get one job per dataset chunk, interactive sessions
    /// exactly one. Nothing is queued if registration fails.
    pub async fn start(&mut self, backend: &dyn Backend, ctx: &Arc<JobContext>) -> Result<()> {
        let split = if self.is_interactive() {
            1
        } else {
            self.params.dataset_split
        };

        let records = backend
            .jobs_create(self.id(), split)
            .await
            .map_err(|source| GridError::Expansion {
                session: self.params.name.clone(),
                source,
            })?;

        for record in &records {
            let job = self.new_job(record, ctx);
            self.pending.push_back(job);
        }
        self.total_jobs = self.pending.len();

        tracing::info!(
            session = %self.params.name,
            jobs = self.total_jobs,
            kind = ?self.params.kind,
            "Session expanded"
        );
        Ok(())
    }

    pub fn new_job(&self, record: &JobRecord, ctx: &Arc<JobContext>) -> Arc<Job> {
        let command = if self.is_interactive() {
            Vec::new()
        } else {
            self.params.command.clone()
        };
        let spec = JobSpec {
            id: record.id,
            session_id: self.params.id,
            session_name: self.params.name.clone(),
            username: self.params.username.clone(),
            kind: self.params.kind,
            dataset_chunk: record.dataset_chunk,
            command,
            image: self.params.image.clone(),
        };
        Job::new(spec, ctx.clone())
    }

    /// Queue a job recovered at startup that has not run yet.
    pub fn restore_pending(&mut self, job: Arc<Job>) {
        self.pending.push_back(job);
    }

    /// Track a job recovered at startup whose container is still up.
    pub fn restore_running(&mut self, job: Arc<Job>) {
        self.running.push(job);
    }

    /// Close a startup restore. `backend_state` is the state the backend
    /// recorded for the session.
    pub fn finish_restore(&mut self, backend_state: SessionState) {
        self.total_jobs = self.pending.len() + self.running.len();
        self.announced = backend_state == SessionState::Running || !self.running.is_empty();
        if self.announced {
            self.state = SessionState::Running;
        }
    }

    pub fn can_accept(&self) -> bool {
        !self.pending.is_empty() && self.running.len() < self.params.max_concurrency as usize
    }

    /// Hand out the next pending job if the concurrency cap allows it.
    pub fn accept_next(&mut self) -> Option<Arc<Job>> {
        if !self.can_accept() {
            return None;
        }

        if !self.announced && self.pending.len() == self.total_jobs {
            self.announced = true;
            self.state = SessionState::Running;
            self.sync
                .session_state(&self.params.name, SessionState::Running);
        }

        let job = self.pending.pop_front()?;
        self.running.push(job.clone());
        self.sync.job_state(job.id(), JobState::Running);
        Some(job)
    }

    pub fn on_complete(&mut self, job: &Job) {
        match self.running.iter().position(|j| j.id() == job.id()) {
            Some(index) => {
                self.running.swap_remove(index);
                self.sync.job_state(job.id(), job.state());
            }
            None => {
                tracing::error!(
                    session = %self.params.name,
                    job_id = job.id(),
                    "Completed job is not running in its session"
                );
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }

    /// Cancel all remaining work and persist the final session state.
    pub fn stop(&mut self) {
        let had_work = !self.is_done();

        for job in self.pending.drain(..) {
            job.abandon();
            self.sync.job_state(job.id(), JobState::Canceled);
        }

        // Running jobs persist their own terminal state once their
        // completion reaches the grid.
        for job in self.running.drain(..) {
            tokio::spawn(async move {
                job.cancel().await;
            });
        }

        self.state = if had_work {
            SessionState::Canceled
        } else {
            SessionState::Completed
        };
        self.sync.session_state(&self.params.name, self.state);

        tracing::info!(session = %self.params.name, state = %self.state, "Session stopped");
    }

    pub fn first_running(&self) -> Option<Arc<Job>> {
        self.running.first().cloned()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.params.id,
            name: self.params.name.clone(),
            username: self.params.username.clone(),
            kind: self.params.kind,
            state: self.state,
            max_concurrency: self.params.max_concurrency,
            total_jobs: self.total_jobs,
            pending: self.pending.len(),
            running: self.running.iter().map(|j| j.id()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, BackendOp, MemoryBackend};
    use crate::config::ServiceConfig;
    use crate::scheduler::grid::{GridDeps, Platform};

    fn params(kind: SessionKind, max_concurrency: u32, split: u32) -> SessionParams {
        SessionParams {
            id: 1,
            name: "s1".to_string(),
            username: "alice".to_string(),
            kind,
            max_concurrency,
            image: DockerImage::new("ubuntu-run"),
            command: vec!["./run".to_string()],
            dataset_split: split,
        }
    }

    fn setup() -> (Arc<MemoryBackend>, BackendSync, Arc<JobContext>) {
        let backend = Arc::new(MemoryBackend::new());
        let deps = GridDeps::new(&ServiceConfig::default(), backend.clone());
        let platform = Platform {
            id: 1,
            name: "rpi".to_string(),
        };
        let (ctx, _rx) = JobContext::new(platform, &deps);
        (backend, deps.sync, ctx)
    }

    #[tokio::test]
    async fn batch_expands_one_job_per_chunk() {
        let (backend, sync, ctx) = setup();
        let mut session = Session::new(params(SessionKind::Batch, 1, 3), sync);
        session.start(backend.as_ref(), &ctx).await.unwrap();

        assert_eq!(session.total_jobs(), 3);
        assert_eq!(session.pending_len(), 3);
        let chunks: Vec<_> = session
            .pending
            .iter()
            .map(|j| j.spec().dataset_chunk)
            .collect();
        assert_eq!(chunks, vec![Some(0), Some(1), Some(2)]);
        assert!(session.pending.iter().all(|j| j.spec().command == vec!["./run"]));
    }

    #[tokio::test]
    async fn interactive_expands_to_one_job_without_command() {
        let (backend, sync, ctx) = setup();
        let mut session = Session::new(params(SessionKind::Interactive, 1, 5), sync);
        session.start(backend.as_ref(), &ctx).await.unwrap();

        assert_eq!(session.total_jobs(), 1);
        assert!(session.pending[0].spec().command.is_empty());
        assert_eq!(
            backend.calls(),
            vec![BackendCall::JobsCreate {
                session_id: 1,
                dataset_split: 1
            }]
        );
    }

    #[tokio::test]
    async fn failed_expansion_queues_nothing() {
        let (backend, sync, ctx) = setup();
        backend.fail(BackendOp::JobsCreate);
        let mut session = Session::new(params(SessionKind::Batch, 1, 3), sync);

        let err = session.start(backend.as_ref(), &ctx).await.unwrap_err();
        assert!(matches!(err, GridError::Expansion { .. }));
        assert!(session.is_done());
    }

    #[tokio::test]
    async fn accept_next_respects_cap_and_announces_once() {
        let (backend, sync, ctx) = setup();
        let mut session = Session::new(params(SessionKind::Batch, 2, 3), sync.clone());
        session.start(backend.as_ref(), &ctx).await.unwrap();
        backend.clear_calls();

        let first = session.accept_next().unwrap();
        let second = session.accept_next().unwrap();
        assert!(session.accept_next().is_none());
        assert!(!session.can_accept());

        sync.flush().await;
        let calls = backend.calls();
        let announcements = calls
            .iter()
            .filter(|c| matches!(c, BackendCall::SessionUpdateState { state: SessionState::Running, .. }))
            .count();
        assert_eq!(announcements, 1);
        assert_eq!(
            calls[0],
            BackendCall::SessionUpdateState {
                name: "s1".to_string(),
                state: SessionState::Running
            }
        );
        assert!(calls.contains(&BackendCall::JobUpdate {
            job_id: first.id(),
            state: JobState::Running
        }));
        assert!(calls.contains(&BackendCall::JobUpdate {
            job_id: second.id(),
            state: JobState::Running
        }));
    }

    #[tokio::test]
    async fn on_complete_frees_a_slot() {
        let (backend, sync, ctx) = setup();
        let mut session = Session::new(params(SessionKind::Batch, 1, 2), sync);
        session.start(backend.as_ref(), &ctx).await.unwrap();

        let job = session.accept_next().unwrap();
        assert!(session.accept_next().is_none());
        job.abandon();
        session.on_complete(&job);
        assert!(session.accept_next().is_some());
        assert!(!session.is_done());
    }

    #[tokio::test]
    async fn stop_cancels_pending_jobs() {
        let (backend, sync, ctx) = setup();
        let mut session = Session::new(params(SessionKind::Batch, 1, 2), sync.clone());
        session.start(backend.as_ref(), &ctx).await.unwrap();
        let ids: Vec<JobId> = session.pending.iter().map(|j| j.id()).collect();
        backend.clear_calls();

        session.stop();
        sync.flush().await;

        assert_eq!(session.state(), SessionState::Canceled);
        let calls = backend.calls();
        for id in ids {
            assert!(calls.contains(&BackendCall::JobUpdate {
                job_id: id,
                state: JobState::Canceled
            }));
        }
        assert_eq!(
            calls.last(),
            Some(&BackendCall::SessionUpdateState {
                name: "s1".to_string(),
                state: SessionState::Canceled
            })
        );
    }

    #[tokio::test]
    async fn stopping_a_finished_session_completes_it() {
        let (_backend, sync, _ctx) = setup();
        let mut session = Session::new(params(SessionKind::Batch, 1, 1), sync);
        session.stop();
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[test]
    fn kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&SessionKind::Interactive).unwrap(),
            "\"interactive\""
        );
        assert_eq!(
            serde_json::to_string(&SessionState::Running).unwrap(),
            "\"RUNNING\""
        );
    }
}
