use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BoardRecord, SessionRecord};
use crate::config::ServiceConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::engine::EngineConnector;
use crate::error::{GridError, Result};
use crate::scheduler::{
    Board, Grid, GridDeps, GridHandle, GridStatus, Platform, SessionParams, SessionState,
};

/// Events that drive the service: backend subscription updates, admin
/// commands and the periodic heartbeat.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    BoardAdded {
        platform: String,
        board: BoardRecord,
    },
    BoardRemoved {
        platform: String,
        hostname: String,
    },
    SessionAdded {
        session: SessionRecord,
    },
    SessionUpdated {
        session_id: u64,
        state: SessionState,
    },
    SessionSaveRequested {
        session_id: u64,
        image_name: String,
    },
    Diagnostics,
    Heartbeat,
}

/// Routes control events to the grid of their platform.
#[derive(Clone)]
pub struct ControlPlane {
    grids: Arc<HashMap<String, GridHandle>>,
    connector: Arc<dyn EngineConnector>,
}

impl ControlPlane {
    pub fn new(grids: HashMap<String, GridHandle>, connector: Arc<dyn EngineConnector>) -> Self {
        Self {
            grids: Arc::new(grids),
            connector,
        }
    }

    fn grid(&self, platform: &str) -> Result<&GridHandle> {
        self.grids
            .get(platform)
            .ok_or_else(|| GridError::PlatformNotFound(platform.to_string()))
    }

    pub fn platforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.grids.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn add_board(&self, platform: &str, record: &BoardRecord) -> Result<()> {
        let grid = self.grid(platform)?;
        let address = record.engine_address();
        let board = Board::new(&record.hostname, address, self.connector.connect(address));
        grid.register_board(Arc::new(board)).await
    }

    pub async fn remove_board(&self, platform: &str, hostname: &str) -> Result<()> {
        self.grid(platform)?.unregister_board(hostname).await
    }

    pub async fn submit_session(&self, record: &SessionRecord) -> Result<()> {
        self.grid(&record.platform)?
            .submit_session(SessionParams::from(record))
            .await
    }

    pub async fn cancel_session(&self, session_id: u64) -> Result<()> {
        for grid in self.grids.values() {
            if grid.cancel_session(session_id).await? {
                return Ok(());
            }
        }
        tracing::error!(session_id, "Session to cancel is not subscribed to any grid");
        Err(GridError::SessionNotFound(session_id))
    }

    pub async fn save_session(&self, session_id: u64, image_name: &str) -> Result<()> {
        for grid in self.grids.values() {
            match grid.save_session(session_id, image_name).await {
                Err(GridError::SessionNotFound(_)) => continue,
                other => return other,
            }
        }
        Err(GridError::SessionNotFound(session_id))
    }

    /// Status of every grid, ordered by platform name.
    pub async fn status(&self) -> Result<Vec<GridStatus>> {
        let mut status = Vec::with_capacity(self.grids.len());
        for name in self.platforms() {
            status.push(self.grid(&name)?.status().await?);
        }
        Ok(status)
    }

    pub async fn diagnostics(&self) -> Result<Vec<GridStatus>> {
        let status = self.status().await?;
        for grid in &status {
            tracing::info!(
                platform = %grid.platform.name,
                boards = grid.boards.len(),
                used = grid.boards.iter().filter(|b| b.used).count(),
                subscribers = grid.subscribers.len(),
                running = grid.running_jobs.len(),
                "Diagnostics"
            );
            for job in &grid.running_jobs {
                tracing::info!(
                    platform = %grid.platform.name,
                    job_id = job.id,
                    session = %job.session,
                    board = ?job.board,
                    container = ?job.container,
                    "Running job"
                );
            }
        }
        Ok(status)
    }

    pub async fn dispatch(&self, event: ControlEvent) -> Result<()> {
        tracing::debug!(?event, "Control event");
        match event {
            ControlEvent::BoardAdded { platform, board } => self.add_board(&platform, &board).await,
            ControlEvent::BoardRemoved { platform, hostname } => {
                self.remove_board(&platform, &hostname).await
            }
            ControlEvent::SessionAdded { session } => self.submit_session(&session).await,
            ControlEvent::SessionUpdated {
                session_id,
                state: SessionState::Canceled,
            } => self.cancel_session(session_id).await,
            ControlEvent::SessionUpdated { session_id, state } => {
                tracing::debug!(session_id, %state, "Ignoring session update");
                Ok(())
            }
            ControlEvent::SessionSaveRequested {
                session_id,
                image_name,
            } => self.save_session(session_id, &image_name).await,
            ControlEvent::Diagnostics => self.diagnostics().await.map(|_| ()),
            ControlEvent::Heartbeat => {
                for grid in self.status().await? {
                    tracing::debug!(
                        platform = %grid.platform.name,
                        subscribers = grid.subscribers.len(),
                        running = grid.running_jobs.len(),
                        "Heartbeat"
                    );
                }
                Ok(())
            }
        }
    }
}

/// Main node that orchestrates all components
pub struct Node {
    config: ServiceConfig,
    backend: Arc<dyn Backend>,
    connector: Arc<dyn EngineConnector>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(
        config: ServiceConfig,
        backend: Arc<dyn Backend>,
        connector: Arc<dyn EngineConnector>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            backend,
            connector,
            shutdown,
        }
    }

    /// Build and start one grid per backend platform.
    ///
    /// Each grid gets the platform's boards, reconciles against the
    /// platform's unfinished sessions and then runs on its own task.
    pub async fn bootstrap(&self) -> Result<(ControlPlane, Vec<JoinHandle<()>>)> {
        let deps = GridDeps::new(&self.config, self.backend.clone());
        let platforms = self.backend.all_platforms().await?;

        let mut grids = HashMap::new();
        let mut tasks = Vec::new();

        for record in platforms {
            tracing::info!(platform = %record.name, "Building grid");
            let (mut grid, completions) = Grid::new(
                Platform {
                    id: record.id,
                    name: record.name.clone(),
                },
                &deps,
            );

            match self.backend.all_boards(&record.name).await {
                Ok(boards) => {
                    for board in boards {
                        let address = board.engine_address();
                        grid.register_board(Arc::new(Board::new(
                            &board.hostname,
                            address,
                            self.connector.connect(address),
                        )));
                    }
                }
                Err(e) => {
                    tracing::error!(platform = %record.name, error = %e, "Failed to load boards");
                }
            }

            let unfinished = match self
                .backend
                .all_sessions(
                    &record.name,
                    &[SessionState::Submitted, SessionState::Running],
                )
                .await
            {
                Ok(sessions) => sessions,
                Err(e) => {
                    tracing::error!(platform = %record.name, error = %e, "Failed to load unfinished sessions");
                    Vec::new()
                }
            };

            let (handle, task) =
                GridHandle::spawn(grid, completions, unfinished, self.shutdown.child_token());
            grids.insert(record.name, handle);
            tasks.push(task);
        }

        Ok((ControlPlane::new(grids, self.connector.clone()), tasks))
    }

    /// Run the node until shutdown.
    ///
    /// Bootstraps the grids, serves the control API and emits a heartbeat
    /// event on every interval. On shutdown the grids stop scheduling and
    /// leave their containers running for the next start to reconcile.
    pub async fn run(self) -> Result<()> {
        let (control, tasks) = self.bootstrap().await?;

        let dashboard = tokio::spawn(run_dashboard(
            self.config.api_addr,
            DashboardState {
                control: control.clone(),
            },
            self.shutdown.clone(),
        ));

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = heartbeat.tick() => {
                    if let Err(e) = control.dispatch(ControlEvent::Heartbeat).await {
                        tracing::warn!(error = %e, "Heartbeat failed");
                    }
                }
            }
        }

        tracing::info!("Shutting down");
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Grid task failed");
            }
        }
        if let Err(e) = dashboard.await {
            tracing::error!(error = %e, "Dashboard task failed");
        }
        Ok(())
    }
}
