//! Container engine capability used on every board.
//!
//! The scheduler only needs a narrow slice of an engine: list, create, start,
//! stop and remove containers, exec a command, move images in and out of the
//! registry, and provision volumes. [`ContainerEngine`] captures that slice so
//! boards can be backed by the docker CLI ([`DockerCli`]) or by a fake in tests.
//!
//! Containers started by the scheduler are named
//! `session-<session_name>.job-<job_id>`. The name is the only link between a
//! live container and its job after a restart, see [`parse_container_name`].

pub mod docker;

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

pub use docker::{DockerCli, DockerConnector};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("container {0} is not running")]
    AlreadyStopped(String),

    #[error("no such container: {0}")]
    NotFound(String),

    #[error("{op} failed: {message}")]
    Remote { op: &'static str, message: String },

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stopping a container that is already stopped, or already gone because
    /// it was auto-removed, is not a failure.
    pub fn is_already_stopped(&self) -> bool {
        matches!(self, EngineError::AlreadyStopped(_) | EngineError::NotFound(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// A container as reported by the engine's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub running: bool,
    /// Host ports the container publishes.
    pub ports: Vec<PortBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub host_port: u16,
    pub container_port: u16,
}

/// Everything needed to create a job container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub tty: bool,
    /// `volume:/path[:ro]` bind specifications
    pub binds: Vec<String>,
    pub port_bindings: Vec<PortBinding>,
    pub env: Vec<String>,
    pub devices: Vec<String>,
    pub privileged: bool,
    pub auto_remove: bool,
}

/// A local-driver volume mounted from NFS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub nfs_host: String,
    pub device: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub server: String,
    pub username: String,
    pub password: String,
}

impl RegistryAuth {
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    pub exit_code: Option<i32>,
}

impl ExecStatus {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// All containers on the board, running or not.
    async fn list_containers(&self) -> EngineResult<Vec<ContainerSummary>>;

    async fn stop_container(&self, id: &str) -> EngineResult<()>;

    async fn remove_container(&self, id: &str) -> EngineResult<()>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;

    /// Run `command` inside a running container, streaming stdout and stderr
    /// into `log`, and return once the command exits.
    async fn exec(&self, id: &str, command: &[String], log: &Path) -> EngineResult<ExecStatus>;

    /// Pull an image, reporting each progress line through `progress`.
    async fn pull_image(
        &self,
        image: &str,
        auth: &RegistryAuth,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> EngineResult<()>;

    /// Push an image, reporting each progress line through `progress`.
    async fn push_image(
        &self,
        image: &str,
        auth: &RegistryAuth,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> EngineResult<()>;

    /// Snapshot a container's filesystem into `image`.
    async fn commit_container(&self, id: &str, image: &str) -> EngineResult<()>;

    async fn create_volume(&self, spec: &VolumeSpec) -> EngineResult<()>;

    /// Remove stopped containers and unused volumes.
    async fn prune(&self) -> EngineResult<()>;
}

/// Opens engine handles for board addresses.
pub trait EngineConnector: Send + Sync {
    fn connect(&self, address: &str) -> Arc<dyn ContainerEngine>;
}

/// Name given to the container of a job.
pub fn container_name(session_name: &str, job_id: u64) -> String {
    format!("session-{}.job-{}", session_name, job_id)
}

fn container_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^/?session-(?P<session>.+)\.job-(?P<job>\d+)$")
            .expect("container name pattern is valid")
    })
}

/// Recover `(session_name, job_id)` from a container name.
pub fn parse_container_name(name: &str) -> Option<(String, u64)> {
    let captures = container_name_pattern().captures(name)?;
    let job_id = captures["job"].parse().ok()?;
    Some((captures["session"].to_string(), job_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_roundtrips_through_parser() {
        let name = container_name("nightly-build", 42);
        assert_eq!(name, "session-nightly-build.job-42");
        assert_eq!(
            parse_container_name(&name),
            Some(("nightly-build".to_string(), 42))
        );
    }

    #[test]
    fn parse_accepts_leading_slash_and_dotted_session_names() {
        assert_eq!(
            parse_container_name("/session-v1.2.job-7"),
            Some(("v1.2".to_string(), 7))
        );
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert_eq!(parse_container_name("pc.nightly"), None);
        assert_eq!(parse_container_name("session-x.job-"), None);
        assert_eq!(parse_container_name("session-x.job-abc"), None);
        assert_eq!(parse_container_name("brd.bladabla"), None);
    }

    #[test]
    fn already_stopped_classification() {
        assert!(EngineError::AlreadyStopped("c1".into()).is_already_stopped());
        assert!(EngineError::NotFound("c1".into()).is_already_stopped());
        assert!(!EngineError::Remote {
            op: "stop",
            message: "boom".into()
        }
        .is_already_stopped());
        assert!(!EngineError::Timeout {
            op: "stop",
            after: Duration::from_secs(1)
        }
        .is_already_stopped());
    }

    #[test]
    fn exec_status_success() {
        assert!(ExecStatus { exit_code: Some(0) }.success());
        assert!(!ExecStatus { exit_code: Some(2) }.success());
        assert!(!ExecStatus { exit_code: None }.success());
    }
}
