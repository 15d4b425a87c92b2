use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::backend::{
    Backend, BackendError, BackendResult, BoardRecord, ImageRecord, JobRecord, PlatformRecord,
    SessionRecord,
};
use crate::events::UserEvent;
use crate::scheduler::job::JobState;
use crate::scheduler::session::SessionState;

/// Backend operations, used to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    AllPlatforms,
    AllBoards,
    AllSessions,
    JobsCreate,
    JobUpdate,
    SessionUpdateState,
    DockerImageCreate,
    PublishData,
}

/// A mutation received by a [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    JobsCreate { session_id: u64, dataset_split: u32 },
    JobUpdate { job_id: u64, state: JobState },
    SessionUpdateState { name: String, state: SessionState },
    DockerImageCreate { platform_id: u64, name: String },
    PublishData { username: String, event: UserEvent },
}

#[derive(Default)]
struct MemoryState {
    platforms: Vec<PlatformRecord>,
    boards: HashMap<String, Vec<BoardRecord>>,
    sessions: Vec<SessionRecord>,
    images: Vec<ImageRecord>,
    next_id: u64,
    calls: Vec<BackendCall>,
    failing: HashSet<BackendOp>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&self, op: BackendOp) -> BackendResult<()> {
        if self.failing.contains(&op) {
            Err(BackendError::Rejected(format!("{:?} is failing", op)))
        } else {
            Ok(())
        }
    }
}

/// In-process system of record.
///
/// Used when the service runs without an external backend, and by tests. All
/// mutations are recorded in order and can be inspected with [`calls`].
/// Mutations against unknown records are accepted and recorded.
///
/// [`calls`]: MemoryBackend::calls
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_platform(self, name: &str) -> Self {
        self.add_platform(name);
        self
    }

    pub fn add_platform(&self, name: &str) -> PlatformRecord {
        let mut state = self.state();
        if let Some(existing) = state.platforms.iter().find(|p| p.name == name) {
            return existing.clone();
        }
        let record = PlatformRecord {
            id: state.allocate_id(),
            name: name.to_string(),
            description: String::new(),
        };
        state.platforms.push(record.clone());
        record
    }

    pub fn add_board(&self, platform: &str, hostname: &str, address: Option<&str>) -> BoardRecord {
        let mut state = self.state();
        let record = BoardRecord {
            id: state.allocate_id(),
            hostname: hostname.to_string(),
            address: address.map(str::to_string),
            description: String::new(),
        };
        state
            .boards
            .entry(platform.to_string())
            .or_default()
            .push(record.clone());
        record
    }

    /// Store a session record as is, jobs included. Ids of seeded jobs are
    /// reserved so later `jobs_create` calls never reuse them.
    pub fn add_session(&self, record: SessionRecord) {
        let mut state = self.state();
        let highest = record
            .jobs
            .iter()
            .map(|j| j.id)
            .chain(std::iter::once(record.id))
            .max()
            .unwrap_or(0);
        state.next_id = state.next_id.max(highest);
        state.sessions.retain(|s| s.id != record.id);
        state.sessions.push(record);
    }

    pub fn session(&self, id: u64) -> Option<SessionRecord> {
        self.state().sessions.iter().find(|s| s.id == id).cloned()
    }

    pub fn images(&self) -> Vec<ImageRecord> {
        self.state().images.clone()
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Events published to `username`, oldest first.
    pub fn events_for(&self, username: &str) -> Vec<UserEvent> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::PublishData { username: u, event } if u == username => {
                    Some(event.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Make every subsequent call of `op` fail.
    pub fn fail(&self, op: BackendOp) {
        self.state().failing.insert(op);
    }

    pub fn recover(&self, op: BackendOp) {
        self.state().failing.remove(&op);
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn all_platforms(&self) -> BackendResult<Vec<PlatformRecord>> {
        let state = self.state();
        state.check(BackendOp::AllPlatforms)?;
        Ok(state.platforms.clone())
    }

    async fn all_boards(&self, platform: &str) -> BackendResult<Vec<BoardRecord>> {
        let state = self.state();
        state.check(BackendOp::AllBoards)?;
        Ok(state.boards.get(platform).cloned().unwrap_or_default())
    }

    async fn all_sessions(
        &self,
        platform: &str,
        states: &[SessionState],
    ) -> BackendResult<Vec<SessionRecord>> {
        let state = self.state();
        state.check(BackendOp::AllSessions)?;
        Ok(state
            .sessions
            .iter()
            .filter(|s| s.platform == platform && states.contains(&s.state))
            .cloned()
            .collect())
    }

    async fn jobs_create(
        &self,
        session_id: u64,
        dataset_split: u32,
    ) -> BackendResult<Vec<JobRecord>> {
        let mut state = self.state();
        state.calls.push(BackendCall::JobsCreate {
            session_id,
            dataset_split,
        });
        state.check(BackendOp::JobsCreate)?;

        let jobs: Vec<JobRecord> = (0..dataset_split)
            .map(|chunk| JobRecord {
                id: state.allocate_id(),
                dataset_chunk: Some(chunk),
                state: JobState::Submitted,
            })
            .collect();

        if let Some(session) = state.sessions.iter_mut().find(|s| s.id == session_id) {
            session.jobs.extend(jobs.iter().cloned());
        }
        Ok(jobs)
    }

    async fn job_update(&self, job_id: u64, job_state: JobState) -> BackendResult<()> {
        let mut state = self.state();
        state.calls.push(BackendCall::JobUpdate {
            job_id,
            state: job_state,
        });
        state.check(BackendOp::JobUpdate)?;

        if let Some(job) = state
            .sessions
            .iter_mut()
            .flat_map(|s| s.jobs.iter_mut())
            .find(|j| j.id == job_id)
        {
            job.state = job_state;
        }
        Ok(())
    }

    async fn session_update_state(&self, name: &str, session_state: SessionState) -> BackendResult<()> {
        let mut state = self.state();
        state.calls.push(BackendCall::SessionUpdateState {
            name: name.to_string(),
            state: session_state,
        });
        state.check(BackendOp::SessionUpdateState)?;

        if let Some(session) = state.sessions.iter_mut().find(|s| s.name == name) {
            session.state = session_state;
        }
        Ok(())
    }

    async fn docker_image_create(
        &self,
        platform_id: u64,
        name: &str,
        options: &str,
        description: &str,
    ) -> BackendResult<ImageRecord> {
        let mut state = self.state();
        state.calls.push(BackendCall::DockerImageCreate {
            platform_id,
            name: name.to_string(),
        });
        state.check(BackendOp::DockerImageCreate)?;

        let record = ImageRecord {
            id: state.allocate_id(),
            name: name.to_string(),
            options: options.to_string(),
            description: description.to_string(),
        };
        state.images.push(record.clone());
        Ok(record)
    }

    async fn publish_data(&self, username: &str, event: &UserEvent) -> BackendResult<()> {
        let mut state = self.state();
        state.calls.push(BackendCall::PublishData {
            username: username.to_string(),
            event: event.clone(),
        });
        state.check(BackendOp::PublishData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::session::{DockerImage, SessionKind};

    fn session(id: u64, name: &str, state: SessionState) -> SessionRecord {
        SessionRecord {
            id,
            name: name.to_string(),
            kind: SessionKind::Batch,
            state,
            username: "alice".to_string(),
            max_jobs: 1,
            dataset_split: 1,
            command: vec!["true".to_string()],
            platform: "rpi".to_string(),
            docker_image: DockerImage::new("ubuntu-run"),
            jobs: vec![JobRecord {
                id: id + 1,
                dataset_chunk: Some(0),
                state: JobState::Submitted,
            }],
        }
    }

    #[tokio::test]
    async fn sessions_filter_by_platform_and_state() {
        let backend = MemoryBackend::new().with_platform("rpi");
        backend.add_session(session(10, "a", SessionState::Running));
        backend.add_session(session(20, "b", SessionState::Completed));

        let found = backend
            .all_sessions("rpi", &[SessionState::Submitted, SessionState::Running])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "a");
        assert!(backend.all_sessions("other", &[SessionState::Running]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn jobs_create_never_reuses_seeded_ids() {
        let backend = MemoryBackend::new();
        backend.add_session(session(10, "a", SessionState::Submitted));

        let jobs = backend.jobs_create(10, 3).await.unwrap();
        let ids: Vec<u64> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![12, 13, 14]);
        assert_eq!(
            jobs.iter().map(|j| j.dataset_chunk).collect::<Vec<_>>(),
            vec![Some(0), Some(1), Some(2)]
        );
        assert_eq!(backend.session(10).unwrap().jobs.len(), 4);
    }

    #[tokio::test]
    async fn updates_apply_and_are_recorded() {
        let backend = MemoryBackend::new();
        backend.add_session(session(10, "a", SessionState::Submitted));

        backend.job_update(11, JobState::Running).await.unwrap();
        backend
            .session_update_state("a", SessionState::Running)
            .await
            .unwrap();

        let record = backend.session(10).unwrap();
        assert_eq!(record.state, SessionState::Running);
        assert_eq!(record.jobs[0].state, JobState::Running);
        assert_eq!(
            backend.calls(),
            vec![
                BackendCall::JobUpdate {
                    job_id: 11,
                    state: JobState::Running
                },
                BackendCall::SessionUpdateState {
                    name: "a".to_string(),
                    state: SessionState::Running
                },
            ]
        );
    }

    #[tokio::test]
    async fn injected_failures() {
        let backend = MemoryBackend::new();
        backend.fail(BackendOp::JobsCreate);
        assert!(matches!(
            backend.jobs_create(1, 2).await,
            Err(BackendError::Rejected(_))
        ));

        backend.recover(BackendOp::JobsCreate);
        assert_eq!(backend.jobs_create(1, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn boards_are_listed_per_platform() {
        let backend = MemoryBackend::new().with_platform("rpi");
        backend.add_board("rpi", "rpi-01", None);
        backend.add_board("rpi", "rpi-02", Some("10.0.0.2"));

        let boards = backend.all_boards("rpi").await.unwrap();
        assert_eq!(boards.len(), 2);
        assert_eq!(boards[0].engine_address(), "rpi-01");
        assert_eq!(boards[1].engine_address(), "10.0.0.2");
        assert!(backend.all_boards("jetson").await.unwrap().is_empty());
    }
}
