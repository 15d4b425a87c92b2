use std::future::Future;
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::config::EngineConfig;
use crate::engine::{
    ContainerEngine, ContainerSpec, ContainerSummary, EngineConnector, EngineError, EngineResult,
    ExecStatus, PortBinding, RegistryAuth, VolumeSpec,
};

/// Container engine reached through the docker CLI.
///
/// Every call runs `docker -H tcp://<board>:<port> ...` as a child process.
/// Short calls are bounded by [`EngineConfig::command_timeout`], pulls and
/// pushes by [`EngineConfig::transfer_timeout`]. An expired call kills the
/// child and surfaces as [`EngineError::Timeout`].
#[derive(Debug, Clone)]
pub struct DockerCli {
    host: String,
    config: EngineConfig,
}

/// Line emitted by `docker ps --format '{{json .}}'`
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Ports", default)]
    ports: String,
}

impl DockerCli {
    pub fn new(address: &str, config: EngineConfig) -> Self {
        Self {
            host: format!("tcp://{}:{}", address, config.port),
            config,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.docker_bin);
        cmd.arg("-H").arg(&self.host).kill_on_drop(true);
        cmd
    }

    async fn bounded<T, F>(op: &'static str, limit: Option<Duration>, fut: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        match limit {
            Some(after) => match tokio::time::timeout(after, fut).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(op, ?after, "Engine call timed out");
                    Err(EngineError::Timeout { op, after })
                }
            },
            None => fut.await,
        }
    }

    /// Run a short docker command and return its trimmed stdout.
    async fn run(&self, op: &'static str, target: &str, args: &[String]) -> EngineResult<String> {
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = Self::bounded(op, Some(self.config.command_timeout), async {
            Ok(cmd.output().await?)
        })
        .await?;

        Self::process_output(op, target, output)
    }

    /// Run a long docker command, feeding each stdout line to `progress`.
    async fn run_streaming(
        &self,
        op: &'static str,
        target: &str,
        args: &[String],
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> EngineResult<()> {
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = Self::bounded(op, Some(self.config.transfer_timeout), async {
            let mut child = cmd.spawn()?;
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            // The child blocks once either pipe fills, so both are drained
            // together.
            let read_stdout = async {
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Some(line) = lines.next_line().await? {
                        progress(line);
                    }
                }
                Ok::<_, std::io::Error>(())
            };
            let read_stderr = async {
                let mut buf = Vec::new();
                if let Some(mut stderr) = stderr {
                    stderr.read_to_end(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let (stdout_done, stderr) = tokio::join!(read_stdout, read_stderr);
            stdout_done?;
            let stderr = stderr?;

            Ok(Output {
                status: child.wait().await?,
                stdout: Vec::new(),
                stderr,
            })
        })
        .await?;

        Self::process_output(op, target, output).map(|_| ())
    }

    async fn login(&self, auth: &RegistryAuth) -> EngineResult<()> {
        if auth.is_anonymous() {
            return Ok(());
        }

        let mut cmd = self.command();
        cmd.args(["login", "--username", &auth.username, "--password-stdin"]);
        if !auth.server.is_empty() {
            cmd.arg(&auth.server);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let password = auth.password.clone();
        let output = Self::bounded("login", Some(self.config.command_timeout), async {
            let mut child = cmd.spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(password.as_bytes()).await?;
            }
            Ok(child.wait_with_output().await?)
        })
        .await?;

        Self::process_output("login", &auth.server, output).map(|_| ())
    }

    fn process_output(op: &'static str, target: &str, output: Output) -> EngineResult<String> {
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("exit code: {:?}", output.status.code())
        } else {
            stderr
        };
        Err(classify_failure(op, target, message))
    }

    fn parse_ps(stdout: &str) -> EngineResult<Vec<ContainerSummary>> {
        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let ps: PsLine = serde_json::from_str(line).map_err(|e| EngineError::Remote {
                    op: "list",
                    message: format!("unreadable listing line {:?}: {}", line, e),
                })?;
                Ok(ContainerSummary {
                    id: ps.id,
                    names: ps
                        .names
                        .split(',')
                        .filter(|n| !n.is_empty())
                        .map(str::to_string)
                        .collect(),
                    running: ps.state == "running",
                    ports: parse_ports(&ps.ports),
                })
            })
            .collect()
    }
}

fn classify_failure(op: &'static str, target: &str, message: String) -> EngineError {
    if message.contains("No such container") {
        EngineError::NotFound(target.to_string())
    } else if message.contains("is not running") || message.contains("already stopped") {
        EngineError::AlreadyStopped(target.to_string())
    } else {
        EngineError::Remote { op, message }
    }
}

/// Published ports from the `Ports` column of `docker ps`, e.g.
/// `0.0.0.0:2200->22/tcp, :::2200->22/tcp`. Exposed but unpublished ports
/// have no `->` and are skipped.
pub(crate) fn parse_ports(ports: &str) -> Vec<PortBinding> {
    let mut bindings: Vec<PortBinding> = Vec::new();
    for entry in ports.split(',').map(str::trim) {
        let Some((host, container)) = entry.split_once("->") else {
            continue;
        };
        let host_port = host.rsplit_once(':').map_or(host, |(_, port)| port);
        let container_port = container.split_once('/').map_or(container, |(port, _)| port);
        let (Ok(host_port), Ok(container_port)) =
            (host_port.parse::<u16>(), container_port.parse::<u16>())
        else {
            continue;
        };
        let binding = PortBinding {
            host_port,
            container_port,
        };
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
    }
    bindings
}

/// Arguments for `docker create`.
pub(crate) fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];

    if spec.tty {
        args.push("--tty".to_string());
    }
    if spec.auto_remove {
        args.push("--rm".to_string());
    }
    if spec.privileged {
        args.push("--privileged".to_string());
    }
    for bind in &spec.binds {
        args.push(format!("--volume={}", bind));
    }
    for binding in &spec.port_bindings {
        args.push(format!(
            "--publish={}:{}",
            binding.host_port, binding.container_port
        ));
    }
    for var in &spec.env {
        args.push(format!("--env={}", var));
    }
    for device in &spec.devices {
        args.push(format!("--device={}", device));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Arguments for `docker volume create` with an NFS-backed local driver.
pub(crate) fn volume_args(spec: &VolumeSpec) -> Vec<String> {
    let mode = if spec.read_only { "ro" } else { "rw" };
    vec![
        "volume".to_string(),
        "create".to_string(),
        "--driver=local".to_string(),
        "--opt=type=nfs".to_string(),
        format!("--opt=o=addr={},{}", spec.nfs_host, mode),
        format!("--opt=device=:{}", spec.device),
        spec.name.clone(),
    ]
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn list_containers(&self) -> EngineResult<Vec<ContainerSummary>> {
        let args = ["ps", "--all", "--no-trunc", "--format", "{{json .}}"].map(String::from);
        let stdout = self.run("list", &self.host, &args).await?;
        Self::parse_ps(&stdout)
    }

    async fn stop_container(&self, id: &str) -> EngineResult<()> {
        self.run("stop", id, &["stop".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        let args = ["rm", "--force", id].map(String::from);
        self.run("remove", id, &args).await.map(|_| ())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        tracing::debug!(host = %self.host, name = %spec.name, image = %spec.image, "Creating container");
        self.run("create", &spec.name, &create_args(spec)).await
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.run("start", id, &["start".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }

    async fn exec(&self, id: &str, command: &[String], log: &Path) -> EngineResult<ExecStatus> {
        let file = tokio::fs::File::create(log).await?.into_std().await;
        let stderr = file.try_clone()?;

        let mut cmd = self.command();
        cmd.arg("exec")
            .arg(id)
            .args(command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::from(stderr));

        let status = Self::bounded("exec", self.config.exec_timeout, async {
            Ok(cmd.status().await?)
        })
        .await?;

        Ok(ExecStatus {
            exit_code: status.code(),
        })
    }

    async fn pull_image(
        &self,
        image: &str,
        auth: &RegistryAuth,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> EngineResult<()> {
        self.login(auth).await?;
        let args = ["pull", image].map(String::from);
        self.run_streaming("pull", image, &args, progress).await
    }

    async fn push_image(
        &self,
        image: &str,
        auth: &RegistryAuth,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> EngineResult<()> {
        self.login(auth).await?;
        let args = ["push", image].map(String::from);
        self.run_streaming("push", image, &args, progress).await
    }

    async fn commit_container(&self, id: &str, image: &str) -> EngineResult<()> {
        let args = ["commit", id, image].map(String::from);
        self.run("commit", id, &args).await.map(|_| ())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> EngineResult<()> {
        self.run("create_volume", &spec.name, &volume_args(spec))
            .await
            .map(|_| ())
    }

    async fn prune(&self) -> EngineResult<()> {
        let containers = ["container", "prune", "--force"].map(String::from);
        self.run("prune", &self.host, &containers).await?;
        let volumes = ["volume", "prune", "--force"].map(String::from);
        self.run("prune", &self.host, &volumes).await.map(|_| ())
    }
}

/// Opens a [`DockerCli`] per board address.
#[derive(Debug, Clone, Default)]
pub struct DockerConnector {
    config: EngineConfig,
}

impl DockerConnector {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl EngineConnector for DockerConnector {
    fn connect(&self, address: &str) -> Arc<dyn ContainerEngine> {
        Arc::new(DockerCli::new(address, self.config.clone()))
    }
}
