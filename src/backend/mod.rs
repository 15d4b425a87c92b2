//! System-of-record access.
//!
//! The backend owns the canonical records for platforms, boards, sessions,
//! jobs and images, and relays user-facing events. The scheduler treats it as
//! a sink for state changes (see [`BackendSync`]) and as the source of truth
//! only at bootstrap and reconciliation.

pub mod graphql;
pub mod memory;
pub mod sync;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::UserEvent;
use crate::scheduler::job::JobState;
use crate::scheduler::session::{DockerImage, SessionKind, SessionState};

pub use graphql::GraphqlBackend;
pub use memory::{BackendCall, BackendOp, MemoryBackend};
pub use sync::BackendSync;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("GraphQL error: {0}")]
    GraphQL(String),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformRecord {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardRecord {
    pub id: u64,
    pub hostname: String,
    /// Engine address; the hostname is used when absent
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl BoardRecord {
    pub fn engine_address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.hostname)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: u64,
    #[serde(default)]
    pub dataset_chunk: Option<u32>,
    pub state: JobState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub state: SessionState,
    pub username: String,
    pub max_jobs: u32,
    #[serde(default = "default_split")]
    pub dataset_split: u32,
    #[serde(default)]
    pub command: Vec<String>,
    pub platform: String,
    pub docker_image: DockerImage,
    #[serde(default)]
    pub jobs: Vec<JobRecord>,
}

fn default_split() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub description: String,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn all_platforms(&self) -> BackendResult<Vec<PlatformRecord>>;

    async fn all_boards(&self, platform: &str) -> BackendResult<Vec<BoardRecord>>;

    /// Sessions of `platform` whose state is one of `states`, with their jobs.
    async fn all_sessions(
        &self,
        platform: &str,
        states: &[SessionState],
    ) -> BackendResult<Vec<SessionRecord>>;

    /// Register `dataset_split` jobs for a session and return them with
    /// their canonical ids, ordered by chunk.
    async fn jobs_create(&self, session_id: u64, dataset_split: u32)
        -> BackendResult<Vec<JobRecord>>;

    async fn job_update(&self, job_id: u64, state: JobState) -> BackendResult<()>;

    async fn session_update_state(&self, name: &str, state: SessionState) -> BackendResult<()>;

    async fn docker_image_create(
        &self,
        platform_id: u64,
        name: &str,
        options: &str,
        description: &str,
    ) -> BackendResult<ImageRecord>;

    async fn publish_data(&self, username: &str, event: &UserEvent) -> BackendResult<()>;
}
