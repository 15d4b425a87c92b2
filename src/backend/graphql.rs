use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::backend::{
    Backend, BackendError, BackendResult, BoardRecord, ImageRecord, JobRecord, PlatformRecord,
    SessionRecord,
};
use crate::config::BackendConfig;
use crate::events::UserEvent;
use crate::scheduler::job::JobState;
use crate::scheduler::session::{DockerImage, SessionKind, SessionState};

const ALL_PLATFORMS: &str = "query { allPlatforms { id name description } }";

const ALL_BOARDS: &str = "query allBoards($platformName: String!) {
  allBoards(platformName: $platformName) { id hostname address description }
}";

const ALL_SESSIONS: &str = "query allSessions($platformName: String!, $states: [String!]!) {
  allSessions(platformName: $platformName, states: $states) {
    id name type state max_jobs datasets command
    user { username }
    platform { name }
    dockerImage { name options }
    jobs { id datasetChunk state }
  }
}";

const JOBS_CREATE: &str = "mutation jobsCreate($sessionId: Int!, $datasetSplit: Int!) {
  jobsCreate(sessionId: $sessionId, datasetSplit: $datasetSplit) { id datasetChunk state }
}";

const JOB_UPDATE: &str = "mutation jobUpdate($id: Int!, $state: String!) {
  jobUpdate(id: $id, state: $state) { id }
}";

const SESSION_UPDATE_STATE: &str = "mutation sessionUpdateState($name: String!, $state: String!) {
  sessionUpdateState(name: $name, state: $state) { id }
}";

const DOCKER_IMAGE_CREATE: &str = "mutation dockerImageCreate($platformId: Int!, $name: String!, $options: String!, $description: String!) {
  dockerImageCreate(platformId: $platformId, name: $name, options: $options, description: $description) { id name options description }
}";

const PUBLISH_DATA: &str = "mutation publishData($username: String!, $data: String!) {
  publishData(username: $username, data: $data)
}";

#[derive(Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
    variables: Value,
}

#[derive(Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlErrorEntry>,
}

#[derive(Deserialize)]
struct GraphqlErrorEntry {
    message: String,
}

impl<T> GraphqlResponse<T> {
    fn into_data(self) -> BackendResult<T> {
        if !self.errors.is_empty() {
            let messages: Vec<String> = self.errors.into_iter().map(|e| e.message).collect();
            return Err(BackendError::GraphQL(messages.join("; ")));
        }
        self.data
            .ok_or_else(|| BackendError::Decode("response carries no data".to_string()))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformsData {
    all_platforms: Vec<PlatformRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoardsData {
    all_boards: Vec<BoardRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionsData {
    all_sessions: Vec<SessionWire>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobsCreateData {
    jobs_create: Vec<JobWire>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageCreateData {
    docker_image_create: ImageRecord,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobWire {
    id: u64,
    #[serde(default)]
    dataset_chunk: Option<u32>,
    state: JobState,
}

impl From<JobWire> for JobRecord {
    fn from(wire: JobWire) -> Self {
        JobRecord {
            id: wire.id,
            dataset_chunk: wire.dataset_chunk,
            state: wire.state,
        }
    }
}

#[derive(Deserialize)]
struct NamedRef {
    #[serde(alias = "username")]
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionWire {
    id: u64,
    name: String,
    #[serde(rename = "type")]
    kind: SessionKind,
    state: SessionState,
    #[serde(rename = "max_jobs")]
    max_jobs: u32,
    #[serde(default)]
    datasets: Option<u32>,
    #[serde(default)]
    command: Option<String>,
    user: NamedRef,
    platform: NamedRef,
    docker_image: DockerImage,
    #[serde(default)]
    jobs: Vec<JobWire>,
}

impl From<SessionWire> for SessionRecord {
    fn from(wire: SessionWire) -> Self {
        SessionRecord {
            id: wire.id,
            name: wire.name,
            kind: wire.kind,
            state: wire.state,
            username: wire.user.name,
            max_jobs: wire.max_jobs,
            dataset_split: wire.datasets.unwrap_or(1).max(1),
            command: parse_command(wire.command.as_deref().unwrap_or_default()),
            platform: wire.platform.name,
            docker_image: wire.docker_image,
            jobs: wire.jobs.into_iter().map(JobRecord::from).collect(),
        }
    }
}

/// Commands are stored as a JSON argv. Anything else is handed to a shell.
pub(crate) fn parse_command(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(argv) => argv,
        Err(_) => vec!["sh".to_string(), "-c".to_string(), raw.to_string()],
    }
}

fn state_name<T: Serialize>(state: &T) -> BackendResult<String> {
    match serde_json::to_value(state) {
        Ok(Value::String(name)) => Ok(name),
        Ok(other) => Err(BackendError::Decode(format!("unexpected state value {}", other))),
        Err(e) => Err(BackendError::Decode(e.to_string())),
    }
}

/// Backend reached over GraphQL-over-HTTP.
pub struct GraphqlBackend {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl GraphqlBackend {
    pub fn new(config: &BackendConfig) -> BackendResult<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| BackendError::Request("no backend endpoint configured".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Request(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            timeout: config.request_timeout,
        })
    }

    async fn request<T: DeserializeOwned>(&self, query: &str, variables: Value) -> BackendResult<T> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&GraphqlRequest { query, variables })
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Request(format!("HTTP {}: {}", status, body)));
        }

        let body: GraphqlResponse<T> = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        body.into_data()
    }

    fn map_transport(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else {
            BackendError::Request(err.to_string())
        }
    }
}

#[async_trait]
impl Backend for GraphqlBackend {
    async fn all_platforms(&self) -> BackendResult<Vec<PlatformRecord>> {
        let data: PlatformsData = self.request(ALL_PLATFORMS, json!({})).await?;
        Ok(data.all_platforms)
    }

    async fn all_boards(&self, platform: &str) -> BackendResult<Vec<BoardRecord>> {
        let data: BoardsData = self
            .request(ALL_BOARDS, json!({ "platformName": platform }))
            .await?;
        Ok(data.all_boards)
    }

    async fn all_sessions(
        &self,
        platform: &str,
        states: &[SessionState],
    ) -> BackendResult<Vec<SessionRecord>> {
        let states = states
            .iter()
            .map(state_name)
            .collect::<BackendResult<Vec<_>>>()?;
        let data: SessionsData = self
            .request(
                ALL_SESSIONS,
                json!({ "platformName": platform, "states": states }),
            )
            .await?;
        Ok(data
            .all_sessions
            .into_iter()
            .map(SessionRecord::from)
            .collect())
    }

    async fn jobs_create(
        &self,
        session_id: u64,
        dataset_split: u32,
    ) -> BackendResult<Vec<JobRecord>> {
        let data: JobsCreateData = self
            .request(
                JOBS_CREATE,
                json!({ "sessionId": session_id, "datasetSplit": dataset_split }),
            )
            .await?;
        Ok(data.jobs_create.into_iter().map(JobRecord::from).collect())
    }

    async fn job_update(&self, job_id: u64, state: JobState) -> BackendResult<()> {
        let _: Value = self
            .request(JOB_UPDATE, json!({ "id": job_id, "state": state_name(&state)? }))
            .await?;
        Ok(())
    }

    async fn session_update_state(&self, name: &str, state: SessionState) -> BackendResult<()> {
        let _: Value = self
            .request(
                SESSION_UPDATE_STATE,
                json!({ "name": name, "state": state_name(&state)? }),
            )
            .await?;
        Ok(())
    }

    async fn docker_image_create(
        &self,
        platform_id: u64,
        name: &str,
        options: &str,
        description: &str,
    ) -> BackendResult<ImageRecord> {
        let data: ImageCreateData = self
            .request(
                DOCKER_IMAGE_CREATE,
                json!({
                    "platformId": platform_id,
                    "name": name,
                    "options": options,
                    "description": description,
                }),
            )
            .await?;
        Ok(data.docker_image_create)
    }

    async fn publish_data(&self, username: &str, event: &UserEvent) -> BackendResult<()> {
        let data = serde_json::to_string(event).map_err(|e| BackendError::Decode(e.to_string()))?;
        let _: Value = self
            .request(PUBLISH_DATA, json!({ "username": username, "data": data }))
            .await?;
        Ok(())
    }
}
