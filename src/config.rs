use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{RegistryAuth, VolumeSpec};

/// Configuration for talking to the container engine on each board.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path or name of the docker CLI binary
    pub docker_bin: String,
    /// TCP port the board's engine listens on
    pub port: u16,
    /// Upper bound for short engine calls (create, start, stop, list...)
    pub command_timeout: Duration,
    /// Upper bound for image pulls and pushes
    pub transfer_timeout: Duration,
    /// Upper bound for a batch command. `None` lets the command run as long as it needs.
    pub exec_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            port: 2375,
            command_timeout: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(900),
            exec_timeout: None,
        }
    }
}

/// Image registry that job images are pulled from and saved images are pushed to.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Registry host:port. Empty means images are referenced by their bare name.
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RegistryConfig {
    /// Fully qualified reference for an image name.
    pub fn image_ref(&self, image: &str) -> String {
        if self.address.is_empty() {
            image.to_string()
        } else {
            format!("{}/{}", self.address.trim_end_matches('/'), image)
        }
    }

    pub fn auth(&self) -> RegistryAuth {
        RegistryAuth {
            server: self.address.clone(),
            username: self.username.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
        }
    }
}

/// NFS-backed user workspaces and per-job logs.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// NFS server exporting user workspaces
    pub nfs_host: String,
    /// Export root; user workspaces live at `<root>/<username>`
    pub nfs_root: String,
    /// Name of the shared read-only volume (exported at `<root>/<public_volume>`)
    pub public_volume: String,
    /// Directory that receives `<session>/job-<id>.log` files
    pub log_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            nfs_host: "127.0.0.1".to_string(),
            nfs_root: "/srv/gridlet".to_string(),
            public_volume: "public".to_string(),
            log_dir: PathBuf::from("/var/log/gridlet"),
        }
    }
}

impl WorkspaceConfig {
    pub fn workspace_volume(&self, username: &str) -> VolumeSpec {
        VolumeSpec {
            name: format!("workspace-{}", username),
            nfs_host: self.nfs_host.clone(),
            device: format!("{}/{}", self.nfs_root.trim_end_matches('/'), username),
            read_only: false,
        }
    }

    pub fn public_volume(&self) -> VolumeSpec {
        VolumeSpec {
            name: self.public_volume.clone(),
            nfs_host: self.nfs_host.clone(),
            device: format!(
                "{}/{}",
                self.nfs_root.trim_end_matches('/'),
                self.public_volume
            ),
            read_only: true,
        }
    }

    pub fn job_log_path(&self, session_name: &str, job_id: u64) -> PathBuf {
        self.log_dir
            .join(session_name)
            .join(format!("job-{}.log", job_id))
    }
}

/// External ports handed out to interactive sessions.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub port_min: u16,
    pub port_max: u16,
    /// Host users connect to. Defaults to the address of the job's board.
    pub public_host: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port_min: 2200,
            port_max: 2299,
            public_host: None,
        }
    }
}

impl SshConfig {
    pub fn pool_size(&self) -> usize {
        if self.port_max < self.port_min {
            0
        } else {
            (self.port_max - self.port_min) as usize + 1
        }
    }
}

/// System-of-record connection. Without an endpoint the service keeps its
/// record in memory.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub endpoint: Option<String>,
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub api_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    /// Tear down every container on a board before a job starts on it
    pub exclusive_jobs: bool,
    pub engine: EngineConfig,
    pub registry: RegistryConfig,
    pub workspace: WorkspaceConfig,
    pub ssh: SshConfig,
    pub backend: BackendConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            api_addr: "127.0.0.1:8080"
                .parse()
                .expect("default api address is valid"),
            heartbeat_interval: Duration::from_secs(30),
            exclusive_jobs: true,
            engine: EngineConfig::default(),
            registry: RegistryConfig::default(),
            workspace: WorkspaceConfig::default(),
            ssh: SshConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new(api_addr: SocketAddr) -> Self {
        Self {
            api_addr,
            ..Default::default()
        }
    }

    pub fn with_backend_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.backend.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_registry(mut self, address: impl Into<String>) -> Self {
        self.registry.address = address.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_default() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.docker_bin, "docker");
        assert_eq!(cfg.port, 2375);
        assert!(cfg.exec_timeout.is_none());
    }

    #[test]
    fn registry_image_ref() {
        let mut cfg = RegistryConfig::default();
        assert_eq!(cfg.image_ref("ubuntu-run"), "ubuntu-run");

        cfg.address = "10.0.0.5:5000/".to_string();
        assert_eq!(cfg.image_ref("ubuntu-run"), "10.0.0.5:5000/ubuntu-run");
    }

    #[test]
    fn registry_auth_defaults_to_empty_credentials() {
        let cfg = RegistryConfig {
            address: "registry:5000".to_string(),
            username: Some("ci".to_string()),
            password: None,
        };
        let auth = cfg.auth();
        assert_eq!(auth.server, "registry:5000");
        assert_eq!(auth.username, "ci");
        assert!(auth.password.is_empty());
    }

    #[test]
    fn workspace_volumes() {
        let cfg = WorkspaceConfig {
            nfs_host: "nfs.local".to_string(),
            nfs_root: "/exports/".to_string(),
            public_volume: "public".to_string(),
            log_dir: PathBuf::from("/logs"),
        };

        let ws = cfg.workspace_volume("alice");
        assert_eq!(ws.name, "workspace-alice");
        assert_eq!(ws.device, "/exports/alice");
        assert!(!ws.read_only);

        let public = cfg.public_volume();
        assert_eq!(public.device, "/exports/public");
        assert!(public.read_only);

        assert_eq!(
            cfg.job_log_path("nightly", 7),
            PathBuf::from("/logs/nightly/job-7.log")
        );
    }

    #[test]
    fn ssh_pool_size() {
        let cfg = SshConfig::default();
        assert_eq!(cfg.pool_size(), 100);

        let empty = SshConfig {
            port_min: 10,
            port_max: 9,
            public_host: None,
        };
        assert_eq!(empty.pool_size(), 0);
    }

    #[test]
    fn service_config_builders() {
        let addr: SocketAddr = "0.0.0.0:9000".parse().unwrap();
        let cfg = ServiceConfig::new(addr)
            .with_backend_endpoint("http://backend:4000/graphql")
            .with_registry("registry:5000");
        assert_eq!(cfg.api_addr, addr);
        assert_eq!(
            cfg.backend.endpoint.as_deref(),
            Some("http://backend:4000/graphql")
        );
        assert_eq!(cfg.registry.address, "registry:5000");
        assert!(cfg.exclusive_jobs);
    }
}
