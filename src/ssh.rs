//! External SSH access to interactive containers.
//!
//! Each interactive job borrows one port from a fixed range for as long as
//! its container is up. The container publishes its port 22 on that port,
//! and boots with a throwaway root-equivalent account whose credentials are
//! handed to the user.

use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::SshConfig;
use crate::error::{GridError, Result};
use crate::scheduler::job::JobId;

/// Port inside the container that sshd listens on.
pub const CONTAINER_SSH_PORT: u16 = 22;

const PASSWORD_LEN: usize = 16;
const USERNAME_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    job_id: JobId,
    tunnel: bool,
}

pub struct SshPortBroker {
    first_port: u16,
    public_host: Option<String>,
    slots: Mutex<Vec<Option<Reservation>>>,
}

impl SshPortBroker {
    pub fn new(config: &SshConfig) -> Self {
        Self {
            first_port: config.port_min,
            public_host: config.public_host.clone(),
            slots: Mutex::new(vec![None; config.pool_size()]),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Option<Reservation>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn port_at(&self, index: usize) -> u16 {
        self.first_port + index as u16
    }

    /// Reserve a port for `job_id` and generate fresh credentials.
    ///
    /// `board_host` is what users connect to unless a public host is
    /// configured. Fails with [`GridError::PortsExhausted`] when every port is
    /// held by a live job.
    pub fn setup_session(&self, job_id: JobId, board_host: &str) -> Result<SshCredentials> {
        let port = {
            let mut slots = self.slots();
            let index = match slots
                .iter()
                .position(|s| matches!(s, Some(r) if r.job_id == job_id))
            {
                Some(index) => index,
                None => slots
                    .iter()
                    .position(Option::is_none)
                    .ok_or(GridError::PortsExhausted)?,
            };
            slots[index] = Some(Reservation {
                job_id,
                tunnel: false,
            });
            self.port_at(index)
        };

        tracing::info!(job_id, port, "Reserved SSH port");

        Ok(SshCredentials {
            host: self
                .public_host
                .clone()
                .unwrap_or_else(|| board_host.to_string()),
            port,
            username: generate_username(),
            password: generate_password(),
        })
    }

    /// Reserve `port` for a job whose container survived a restart and still
    /// publishes it.
    ///
    /// Returns false when the port is outside the pool or held by another job.
    pub fn reclaim(&self, job_id: JobId, port: u16) -> bool {
        let mut slots = self.slots();
        let index = port
            .checked_sub(self.first_port)
            .map(usize::from)
            .filter(|index| *index < slots.len());
        let Some(index) = index else {
            tracing::warn!(job_id, port, "Recovered SSH port is outside the pool");
            return false;
        };

        match slots[index] {
            Some(holder) if holder.job_id != job_id => {
                tracing::warn!(job_id, port, holder = holder.job_id, "Recovered SSH port is already reserved");
                false
            }
            _ => {
                slots[index] = Some(Reservation {
                    job_id,
                    tunnel: true,
                });
                tracing::info!(job_id, port, "Reclaimed SSH port");
                true
            }
        }
    }

    /// Mark the reservation of `job_id` as carrying a live tunnel.
    pub fn register_tunnel(&self, job_id: JobId) -> bool {
        let mut slots = self.slots();
        match slots.iter_mut().flatten().find(|r| r.job_id == job_id) {
            Some(reservation) => {
                reservation.tunnel = true;
                true
            }
            None => {
                tracing::warn!(job_id, "No SSH port reserved, tunnel not registered");
                false
            }
        }
    }

    /// Return the port held by `job_id`. A second call is a no-op.
    pub fn release_port(&self, job_id: JobId) -> Option<u16> {
        let mut slots = self.slots();
        let index = slots
            .iter()
            .position(|s| matches!(s, Some(r) if r.job_id == job_id))?;
        slots[index] = None;
        let port = self.port_at(index);
        tracing::info!(job_id, port, "Released SSH port");
        Some(port)
    }

    /// Tear down the tunnel of `job_id`, if any, and release its port.
    pub fn end_session(&self, job_id: JobId) -> Option<u16> {
        let had_tunnel = self
            .slots()
            .iter()
            .flatten()
            .any(|r| r.job_id == job_id && r.tunnel);
        if had_tunnel {
            tracing::debug!(job_id, "Closing SSH tunnel");
        }
        self.release_port(job_id)
    }

    pub fn port_of(&self, job_id: JobId) -> Option<u16> {
        let slots = self.slots();
        slots
            .iter()
            .position(|s| matches!(s, Some(r) if r.job_id == job_id))
            .map(|index| self.port_at(index))
    }

    pub fn reserved_count(&self) -> usize {
        self.slots().iter().filter(|s| s.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots().len()
    }
}

fn generate_username() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(USERNAME_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("u{}", suffix)
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Container command that creates the login account and runs sshd in the
/// foreground.
pub fn boot_command(credentials: &SshCredentials) -> Vec<String> {
    let script = format!(
        "useradd --non-unique --uid 0 --gid 0 --no-create-home --home-dir /root --shell /bin/bash {user} \
         && echo '{user}:{password}' | chpasswd \
         && mkdir -p /run/sshd \
         && exec /usr/sbin/sshd -D -p {port}",
        user = credentials.username,
        password = credentials.password,
        port = CONTAINER_SSH_PORT,
    );
    vec!["/bin/sh".to_string(), "-c".to_string(), script]
}
