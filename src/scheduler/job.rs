use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backend::{Backend, BackendSync, ImageRecord};
use crate::config::{RegistryConfig, WorkspaceConfig};
use crate::engine::{container_name, ContainerEngine, ContainerSpec, PortBinding};
use crate::error::{GridError, Result};
use crate::events::UserEvent;
use crate::scheduler::board::Board;
use crate::scheduler::grid::{GridDeps, Platform};
use crate::scheduler::session::{DockerImage, SessionKind};
use crate::ssh::{self, SshCredentials, SshPortBroker, CONTAINER_SSH_PORT};

pub type JobId = u64;

/// Mount point of the user's workspace inside job containers.
pub const WORKSPACE_MOUNT: &str = "/workspace";
/// Mount point of the shared read-only volume inside job containers.
pub const PUBLIC_MOUNT: &str = "/public";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Submitted,
    Running,
    Completed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Canceled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Submitted => write!(f, "submitted"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Canceled => write!(f, "canceled"),
        }
    }
}

/// Immutable description of a job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: JobId,
    pub session_id: u64,
    pub session_name: String,
    pub username: String,
    pub kind: SessionKind,
    pub dataset_chunk: Option<u32>,
    pub command: Vec<String>,
    pub image: DockerImage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobTimestamps {
    pub submitted: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

struct JobRuntime {
    state: JobState,
    board: Option<Arc<Board>>,
    container_id: Option<String>,
    ssh: Option<SshCredentials>,
    times: JobTimestamps,
}

/// Everything a job needs from its grid while it runs.
pub struct JobContext {
    pub platform: Platform,
    pub registry: RegistryConfig,
    pub workspace: WorkspaceConfig,
    pub exclusive: bool,
    pub backend: Arc<dyn Backend>,
    pub sync: BackendSync,
    pub ssh: Arc<SshPortBroker>,
    completions: mpsc::UnboundedSender<Arc<Job>>,
}

impl JobContext {
    /// Build the context for `platform`. Terminated jobs are delivered on the
    /// returned receiver.
    pub fn new(
        platform: Platform,
        deps: &GridDeps,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Job>>) {
        let (completions, rx) = mpsc::unbounded_channel();
        let ctx = Self {
            platform,
            registry: deps.registry.clone(),
            workspace: deps.workspace.clone(),
            exclusive: deps.exclusive,
            backend: deps.backend.clone(),
            sync: deps.sync.clone(),
            ssh: deps.ssh.clone(),
            completions,
        };
        (Arc::new(ctx), rx)
    }
}

/// One schedulable unit of a session.
///
/// A job moves forward only: SUBMITTED, RUNNING, then COMPLETED or CANCELED.
/// While running it owns a board and, for interactive sessions, an SSH port.
/// Both are released exactly once when the job terminates, and the job is
/// then handed back to its grid through the completion channel.
pub struct Job {
    spec: JobSpec,
    runtime: Mutex<JobRuntime>,
    ctx: Arc<JobContext>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.spec.id)
            .field("session", &self.spec.session_name)
            .field("state", &self.state())
            .finish()
    }
}

impl Job {
    pub fn new(spec: JobSpec, ctx: Arc<JobContext>) -> Arc<Self> {
        Arc::new(Self {
            spec,
            runtime: Mutex::new(JobRuntime {
                state: JobState::Submitted,
                board: None,
                container_id: None,
                ssh: None,
                times: JobTimestamps {
                    submitted: Some(Utc::now()),
                    ..Default::default()
                },
            }),
            ctx,
        })
    }

    fn runtime(&self) -> MutexGuard<'_, JobRuntime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> JobId {
        self.spec.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn session_id(&self) -> u64 {
        self.spec.session_id
    }

    pub fn is_interactive(&self) -> bool {
        self.spec.kind == SessionKind::Interactive
    }

    pub fn state(&self) -> JobState {
        self.runtime().state
    }

    pub fn board(&self) -> Option<Arc<Board>> {
        self.runtime().board.clone()
    }

    pub fn container_id(&self) -> Option<String> {
        self.runtime().container_id.clone()
    }

    pub fn ssh_credentials(&self) -> Option<SshCredentials> {
        self.runtime().ssh.clone()
    }

    pub fn timestamps(&self) -> JobTimestamps {
        self.runtime().times
    }

    pub fn stamp_completed(&self) {
        self.runtime().times.completed = Some(Utc::now());
    }

    fn publish(&self, event: UserEvent) {
        self.ctx.sync.publish(&self.spec.username, event);
    }

    /// Bind the job to `board` and start it in the background.
    ///
    /// The board must already be claimed for this job. The job is RUNNING
    /// when this returns.
    pub fn start(self: &Arc<Self>, board: Arc<Board>) {
        {
            let mut rt = self.runtime();
            rt.board = Some(board.clone());
            rt.state = JobState::Running;
            rt.times.started = Some(Utc::now());
        }

        tracing::info!(
            job_id = self.id(),
            session = %self.spec.session_name,
            board = %board.hostname,
            "Starting job"
        );

        let job = self.clone();
        tokio::spawn(async move { job.drive(board).await });
    }

    /// Adopt a container found running at startup.
    ///
    /// An interactive container keeps the SSH port it publishes. Its login
    /// credentials were never persisted, so none are known afterwards.
    pub fn reattach(&self, board: Arc<Board>, container_id: String, ports: &[PortBinding]) {
        {
            let mut rt = self.runtime();
            rt.board = Some(board);
            rt.container_id = Some(container_id);
            rt.state = JobState::Running;
            rt.times.started = Some(Utc::now());
        }

        if self.is_interactive() {
            for binding in ports
                .iter()
                .filter(|b| b.container_port == CONTAINER_SSH_PORT)
            {
                self.ctx.ssh.reclaim(self.id(), binding.host_port);
            }
        }
    }

    /// Cancel a job that never left the pending queue.
    pub fn abandon(&self) {
        let mut rt = self.runtime();
        if !rt.state.is_terminal() {
            rt.state = JobState::Canceled;
            rt.times.completed = Some(Utc::now());
        }
    }

    async fn drive(self: Arc<Self>, board: Arc<Board>) {
        let container_id = match self.launch(&board).await {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(e) => {
                self.fail_start(e).await;
                return;
            }
        };

        if self.is_interactive() {
            self.open_terminal();
            return;
        }

        if self.spec.command.is_empty() {
            self.fail_start(GridError::Internal("batch job has no command".to_string()))
                .await;
            return;
        }

        let log = self
            .ctx
            .workspace
            .job_log_path(&self.spec.session_name, self.id());
        match self.exec(board.engine().as_ref(), &container_id, &log).await {
            Ok(status) if self.state().is_terminal() => {
                tracing::debug!(job_id = self.id(), ?status, "Command ended after cancellation");
            }
            Ok(status) => {
                if status.success() {
                    tracing::info!(job_id = self.id(), "Command succeeded");
                    self.publish(UserEvent::ExecSuccess {
                        job_id: self.id(),
                        message: format!("job {} finished", self.id()),
                        connection: None,
                    });
                } else {
                    tracing::warn!(job_id = self.id(), exit_code = ?status.exit_code, "Command failed");
                    self.publish(UserEvent::ExecError {
                        job_id: self.id(),
                        message: format!("job {} exited with {:?}", self.id(), status.exit_code),
                        exit_code: status.exit_code,
                    });
                }
                self.complete().await;
            }
            Err(e) => self.fail_start(e).await,
        }
    }

    async fn exec(
        &self,
        engine: &dyn ContainerEngine,
        container_id: &str,
        log: &Path,
    ) -> Result<crate::engine::ExecStatus> {
        if let Some(dir) = log.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(crate::engine::EngineError::from)?;
        }
        Ok(engine.exec(container_id, &self.spec.command, log).await?)
    }

    async fn fail_start(self: &Arc<Self>, err: GridError) {
        if self.state().is_terminal() {
            tracing::debug!(job_id = self.id(), error = %err, "Start interrupted by termination");
            return;
        }
        tracing::error!(job_id = self.id(), session = %self.spec.session_name, error = %err, "Job failed to start");
        self.cancel().await;
        self.publish(UserEvent::StartError {
            job_id: self.id(),
            message: err.to_string(),
        });
    }

    /// Bring the container up. Returns `None` when the job was terminated
    /// while starting; whatever was created is already torn down.
    async fn launch(&self, board: &Arc<Board>) -> Result<Option<String>> {
        let engine = board.engine().clone();

        if self.ctx.exclusive {
            self.clear_board(board).await;
        }

        self.pull(engine.as_ref()).await?;

        engine
            .create_volume(&self.ctx.workspace.workspace_volume(&self.spec.username))
            .await?;
        engine
            .create_volume(&self.ctx.workspace.public_volume())
            .await?;

        let credentials = if self.is_interactive() {
            let credentials = self.ctx.ssh.setup_session(self.id(), &board.address)?;
            let stored = {
                let mut rt = self.runtime();
                if rt.state.is_terminal() {
                    false
                } else {
                    rt.ssh = Some(credentials.clone());
                    true
                }
            };
            if !stored {
                self.ctx.ssh.release_port(self.id());
                return Ok(None);
            }
            Some(credentials)
        } else {
            None
        };

        let spec = self.container_spec(credentials.as_ref());
        let container_id = engine.create_container(&spec).await?;

        let attached = {
            let mut rt = self.runtime();
            if rt.state.is_terminal() {
                false
            } else {
                rt.container_id = Some(container_id.clone());
                true
            }
        };
        if !attached {
            tracing::info!(job_id = self.id(), container = %container_id, "Job ended while starting, stopping container");
            if let Err(e) = engine.stop_container(&container_id).await {
                if !e.is_already_stopped() {
                    tracing::warn!(container = %container_id, error = %e, "Failed to stop container");
                }
            }
            return Ok(None);
        }

        engine.start_container(&container_id).await?;
        tracing::info!(
            job_id = self.id(),
            board = %board.hostname,
            container = %container_id,
            "Container started"
        );
        Ok(Some(container_id))
    }

    /// Best-effort teardown of every container already on the board.
    async fn clear_board(&self, board: &Board) {
        let engine = board.engine();
        let containers = match engine.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                tracing::warn!(board = %board.hostname, error = %e, "Failed to list containers before start");
                return;
            }
        };

        for container in containers {
            tracing::debug!(board = %board.hostname, container = %container.id, "Clearing container");
            match engine.stop_container(&container.id).await {
                Ok(()) => {}
                Err(e) if e.is_already_stopped() => {}
                Err(e) => {
                    tracing::warn!(container = %container.id, error = %e, "Failed to stop container");
                }
            }
            // Auto-removed containers are already gone here.
            match engine.remove_container(&container.id).await {
                Ok(()) => {}
                Err(e) if e.is_already_stopped() => {}
                Err(e) => {
                    tracing::warn!(container = %container.id, error = %e, "Failed to remove container");
                }
            }
        }
    }

    async fn pull(&self, engine: &dyn ContainerEngine) -> Result<()> {
        let image = self.ctx.registry.image_ref(&self.spec.image.name);
        let auth = self.ctx.registry.auth();
        let interactive = self.is_interactive();
        let sync = self.ctx.sync.clone();
        let username = self.spec.username.clone();
        let progress = move |line: String| {
            if interactive {
                sync.publish(&username, UserEvent::PullData { data: line });
            }
        };

        match engine.pull_image(&image, &auth, &progress).await {
            Ok(()) => {
                if interactive {
                    self.publish(UserEvent::PullSuccess);
                }
                Ok(())
            }
            Err(e) => {
                if interactive {
                    self.publish(UserEvent::PullError {
                        message: e.to_string(),
                    });
                }
                Err(e.into())
            }
        }
    }

    fn container_spec(&self, credentials: Option<&SshCredentials>) -> ContainerSpec {
        let workspace = self.ctx.workspace.workspace_volume(&self.spec.username);
        let public = self.ctx.workspace.public_volume();

        let mut spec = ContainerSpec {
            name: container_name(&self.spec.session_name, self.id()),
            image: self.ctx.registry.image_ref(&self.spec.image.name),
            command: vec!["/bin/bash".to_string()],
            tty: true,
            binds: vec![
                format!("{}:{}", workspace.name, WORKSPACE_MOUNT),
                format!("{}:{}:ro", public.name, PUBLIC_MOUNT),
            ],
            env: vec![format!("JOB_ID={}", self.id())],
            auto_remove: true,
            ..Default::default()
        };

        if let Some(chunk) = self.spec.dataset_chunk {
            spec.env.push(format!("DATASET_CHUNK={}", chunk));
        }

        if let Some(credentials) = credentials {
            spec.command = ssh::boot_command(credentials);
            spec.port_bindings.push(PortBinding {
                host_port: credentials.port,
                container_port: CONTAINER_SSH_PORT,
            });
        }

        apply_image_options(&mut spec, &self.spec.image.options);
        spec
    }

    fn open_terminal(&self) {
        let Some(credentials) = self.ssh_credentials() else {
            return;
        };
        self.ctx.ssh.register_tunnel(self.id());
        tracing::info!(
            job_id = self.id(),
            host = %credentials.host,
            port = credentials.port,
            "Interactive session ready"
        );
        self.publish(UserEvent::ExecSuccess {
            job_id: self.id(),
            message: format!("ssh {}@{} -p {}", credentials.username, credentials.host, credentials.port),
            connection: Some(credentials),
        });
    }

    /// Finish the job normally. Returns false if it had already terminated.
    pub async fn complete(self: &Arc<Self>) -> bool {
        self.terminate(JobState::Completed).await
    }

    /// Cancel the job. Returns false if it had already terminated.
    pub async fn cancel(self: &Arc<Self>) -> bool {
        self.terminate(JobState::Canceled).await
    }

    async fn terminate(self: &Arc<Self>, state: JobState) -> bool {
        let (board, container_id) = {
            let mut rt = self.runtime();
            if rt.state.is_terminal() {
                return false;
            }
            rt.state = state;
            rt.ssh = None;
            (rt.board.take(), rt.container_id.take())
        };

        tracing::info!(job_id = self.id(), session = %self.spec.session_name, %state, "Job terminated");

        if let (Some(board), Some(container_id)) = (&board, &container_id) {
            match board.engine().stop_container(container_id).await {
                Ok(()) => {}
                Err(e) if e.is_already_stopped() => {
                    tracing::debug!(container = %container_id, "Container already stopped");
                }
                Err(e) => {
                    tracing::warn!(board = %board.hostname, container = %container_id, error = %e, "Failed to stop container");
                }
            }
        }

        self.ctx.ssh.end_session(self.id());

        if let Some(board) = board {
            board.release();
        }

        if self.ctx.completions.send(self.clone()).is_err() {
            tracing::debug!(job_id = self.id(), "Grid is gone, completion dropped");
        }
        true
    }

    /// Snapshot the job's container into `image_name`, push it and register
    /// it with the backend.
    ///
    /// A failed commit, push or registration emits exactly one `commit_error`.
    /// Job state is never changed.
    pub async fn save(&self, image_name: &str) -> Result<ImageRecord> {
        let (board, container_id) = {
            let rt = self.runtime();
            match (&rt.board, &rt.container_id) {
                (Some(board), Some(id)) if !rt.state.is_terminal() => (board.clone(), id.clone()),
                _ => return Err(GridError::NoContainer(self.id())),
            }
        };
        let engine = board.engine();
        let image = self.ctx.registry.image_ref(image_name);

        tracing::info!(job_id = self.id(), container = %container_id, %image, "Saving container");

        if let Err(e) = engine.commit_container(&container_id, &image).await {
            self.publish(UserEvent::CommitError {
                message: e.to_string(),
            });
            return Err(e.into());
        }

        let sync = self.ctx.sync.clone();
        let username = self.spec.username.clone();
        let progress = move |line: String| {
            sync.publish(&username, UserEvent::PushData { data: line });
        };
        if let Err(e) = engine
            .push_image(&image, &self.ctx.registry.auth(), &progress)
            .await
        {
            self.publish(UserEvent::PushError {
                message: e.to_string(),
            });
            self.publish(UserEvent::CommitError {
                message: e.to_string(),
            });
            return Err(e.into());
        }
        self.publish(UserEvent::PushSuccess);

        let description = format!(
            "saved from session {} job {}",
            self.spec.session_name,
            self.id()
        );
        match self
            .ctx
            .backend
            .docker_image_create(
                self.ctx.platform.id,
                image_name,
                &self.spec.image.options,
                &description,
            )
            .await
        {
            Ok(record) => {
                self.publish(UserEvent::RegisterSuccess {
                    image: record.name.clone(),
                });
                Ok(record)
            }
            Err(e) => {
                self.publish(UserEvent::RegisterError {
                    message: e.to_string(),
                });
                self.publish(UserEvent::CommitError {
                    message: e.to_string(),
                });
                Err(e.into())
            }
        }
    }
}

/// Apply image options to a container spec.
///
/// Options are whitespace-separated: `--privileged`, `--device=<path>` and
/// `--env=<KEY=VALUE>`. Anything else is ignored.
pub(crate) fn apply_image_options(spec: &mut ContainerSpec, options: &str) {
    for option in options.split_whitespace() {
        if option == "--privileged" {
            spec.privileged = true;
        } else if let Some(device) = option.strip_prefix("--device=") {
            spec.devices.push(device.to_string());
        } else if let Some(var) = option.strip_prefix("--env=") {
            spec.env.push(var.to_string());
        } else {
            tracing::warn!(option, "Ignoring unknown image option");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!JobState::Submitted.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Canceled.is_terminal());
    }

    #[test]
    fn job_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&JobState::Canceled).unwrap(),
            "\"CANCELED\""
        );
        let state: JobState = serde_json::from_str("\"SUBMITTED\"").unwrap();
        assert_eq!(state, JobState::Submitted);
        assert_eq!(JobState::Running.to_string(), "running");
    }

    #[test]
    fn image_options() {
        let mut spec = ContainerSpec::default();
        apply_image_options(
            &mut spec,
            "--privileged  --device=/dev/gpiomem --env=MODE=fast --bogus",
        );
        assert!(spec.privileged);
        assert_eq!(spec.devices, vec!["/dev/gpiomem"]);
        assert_eq!(spec.env, vec!["MODE=fast"]);

        let mut plain = ContainerSpec::default();
        apply_image_options(&mut plain, "");
        assert_eq!(plain, ContainerSpec::default());
    }
}
