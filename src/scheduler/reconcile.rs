//! Startup reconciliation.
//!
//! After a restart the grid rebuilds its state from two sources: the backend
//! record of unfinished sessions and the containers still running on the
//! platform's boards. Containers are matched to jobs by name
//! (`session-<name>.job-<id>`). Each backend job is then resolved as follows:
//!
//! | backend job | container | action                                      |
//! |-------------|-----------|---------------------------------------------|
//! | RUNNING     | no        | persist COMPLETED                           |
//! | RUNNING     | yes       | keep it running on its board                |
//! | SUBMITTED   | no        | queue it                                    |
//! | SUBMITTED   | yes       | persist RUNNING, keep it running            |
//!
//! Containers nobody claims are orphans: they are stopped and their board
//! is pruned.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::SessionRecord;
use crate::engine::{parse_container_name, PortBinding};
use crate::scheduler::board::Board;
use crate::scheduler::grid::Grid;
use crate::scheduler::job::{JobId, JobState};
use crate::scheduler::session::{Session, SessionParams, SessionState};

#[derive(Debug)]
struct FoundContainer {
    board: Arc<Board>,
    container_id: String,
    ports: Vec<PortBinding>,
}

impl Grid {
    /// Reconcile with the backend and the boards, then start scheduling.
    ///
    /// `unfinished` are the platform's sessions in SUBMITTED or RUNNING state.
    pub async fn start(&mut self, unfinished: Vec<SessionRecord>) {
        let platform = self.platform().name.clone();
        tracing::info!(
            platform = %platform,
            boards = self.boards.len(),
            sessions = unfinished.len(),
            "Reconciling grid"
        );

        let (mut pool, mut orphans) = self.discover_containers().await;

        for record in unfinished {
            if record.jobs.is_empty() && record.state == SessionState::Submitted {
                self.resubmit(&record).await;
                continue;
            }

            let mut session = Session::new(SessionParams::from(&record), self.sync.clone());

            for job_record in &record.jobs {
                let found = pool.remove(&(record.name.clone(), job_record.id));
                if job_record.state.is_terminal() {
                    if let Some(found) = found {
                        tracing::warn!(
                            session = %record.name,
                            job_id = job_record.id,
                            container = %found.container_id,
                            "Container of a finished job is still running"
                        );
                        orphans.push(found);
                    }
                    continue;
                }

                let found = match found {
                    Some(found) if found.board.try_use() => Some(found),
                    Some(found) => {
                        tracing::warn!(
                            job_id = job_record.id,
                            board = %found.board.hostname,
                            "Board already holds a recovered job"
                        );
                        orphans.push(found);
                        None
                    }
                    None => None,
                };

                match (job_record.state, found) {
                    (JobState::Running, None) => {
                        tracing::warn!(session = %record.name, job_id = job_record.id, "Running job lost its container, marking completed");
                        self.sync.job_state(job_record.id, JobState::Completed);
                    }
                    (JobState::Submitted, None) => {
                        let job = session.new_job(job_record, &self.ctx);
                        session.restore_pending(job);
                    }
                    (state, Some(found)) => {
                        tracing::info!(
                            session = %record.name,
                            job_id = job_record.id,
                            board = %found.board.hostname,
                            container = %found.container_id,
                            "Recovered running job"
                        );
                        if state == JobState::Submitted {
                            self.sync.job_state(job_record.id, JobState::Running);
                        }
                        let job = session.new_job(job_record, &self.ctx);
                        job.reattach(found.board, found.container_id, &found.ports);
                        session.restore_running(job.clone());
                        self.running_jobs.push(job);
                    }
                    (_, None) => {}
                }
            }

            session.finish_restore(record.state);
            if session.is_done() {
                tracing::info!(session = %record.name, "Recovered session has no work left");
                self.sync
                    .session_state(&record.name, SessionState::Completed);
                continue;
            }
            if !session.running().is_empty() {
                self.sync.session_state(&record.name, SessionState::Running);
            }
            self.subscribe(session);
        }

        orphans.extend(pool.into_values());
        for orphan in orphans {
            Self::remove_orphan(orphan).await;
        }

        self.schedule();
    }

    /// Running containers on every board, keyed by the job they belong to.
    /// Containers whose names do not follow the job naming are orphans.
    async fn discover_containers(
        &self,
    ) -> (HashMap<(String, JobId), FoundContainer>, Vec<FoundContainer>) {
        let mut pool = HashMap::new();
        let mut orphans = Vec::new();

        for board in &self.boards {
            let containers = match board.engine().list_containers().await {
                Ok(containers) => containers,
                Err(e) => {
                    tracing::error!(board = %board.hostname, error = %e, "Failed to list containers");
                    continue;
                }
            };

            for container in containers.into_iter().filter(|c| c.running) {
                let key = container
                    .names
                    .iter()
                    .find_map(|name| parse_container_name(name));
                let found = FoundContainer {
                    board: board.clone(),
                    container_id: container.id,
                    ports: container.ports,
                };
                match key {
                    Some(key) => {
                        if let Some(previous) = pool.insert(key, found) {
                            orphans.push(previous);
                        }
                    }
                    None => orphans.push(found),
                }
            }
        }

        (pool, orphans)
    }

    /// A SUBMITTED session without jobs was never expanded.
    async fn resubmit(&mut self, record: &SessionRecord) {
        let mut session = Session::new(SessionParams::from(record), self.sync.clone());
        match session.start(self.backend.as_ref(), &self.ctx).await {
            Ok(()) => self.subscribe(session),
            Err(e) => {
                tracing::error!(session = %record.name, error = %e, "Failed to expand recovered session");
            }
        }
    }

    async fn remove_orphan(orphan: FoundContainer) {
        let engine = orphan.board.engine();
        tracing::warn!(
            board = %orphan.board.hostname,
            container = %orphan.container_id,
            "Stopping orphan container"
        );
        match engine.stop_container(&orphan.container_id).await {
            Ok(()) => {}
            Err(e) if e.is_already_stopped() => {}
            Err(e) => {
                tracing::error!(container = %orphan.container_id, error = %e, "Failed to stop orphan container");
            }
        }
        if let Err(e) = engine.prune().await {
            tracing::error!(board = %orphan.board.hostname, error = %e, "Failed to prune board");
        }
    }
}
