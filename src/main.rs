use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use gridlet::backend::{Backend, GraphqlBackend, MemoryBackend, SessionRecord};
use gridlet::config::{
    BackendConfig, EngineConfig, RegistryConfig, ServiceConfig, SshConfig, WorkspaceConfig,
};
use gridlet::dashboard::{ActionResponse, AddBoardRequest, SaveSessionRequest};
use gridlet::engine::DockerConnector;
use gridlet::node::Node;
use gridlet::scheduler::grid::GridStatus;
use gridlet::scheduler::{DockerImage, SessionKind, SessionState};
use gridlet::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "gridlet")]
#[command(version)]
#[command(about = "Schedules batch and interactive container jobs onto pools of boards")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduling service
    Server(ServerArgs),

    /// Session management commands
    Session {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Board management commands
    Board {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: BoardCommands,
    },

    /// Show boards, sessions and running jobs of every platform
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Log a diagnostics report on the server and print it
    Diagnostics {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address of the control API
    #[arg(long, env = "GRIDLET_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// GraphQL endpoint of the backend. Without it the record is kept in memory.
    #[arg(long, env = "GRIDLET_BACKEND_URL")]
    backend_url: Option<String>,

    /// Backend request timeout in seconds
    #[arg(long, env = "GRIDLET_BACKEND_TIMEOUT", default_value = "30")]
    backend_timeout: u64,

    /// Platforms to create in in-memory mode (comma-separated)
    #[arg(long, env = "GRIDLET_PLATFORMS", value_delimiter = ',')]
    platform: Vec<String>,

    /// Boards to create in in-memory mode, as "platform:hostname[=address]"
    #[arg(long, env = "GRIDLET_BOARDS", value_delimiter = ',', value_parser = parse_board)]
    board: Vec<BoardArg>,

    /// Image registry address (host:port)
    #[arg(long, env = "GRIDLET_REGISTRY", default_value = "")]
    registry: String,

    #[arg(long, env = "GRIDLET_REGISTRY_USER")]
    registry_user: Option<String>,

    #[arg(long, env = "GRIDLET_REGISTRY_PASSWORD", hide_env_values = true)]
    registry_password: Option<String>,

    /// NFS server exporting user workspaces
    #[arg(long, env = "GRIDLET_NFS_HOST", default_value = "127.0.0.1")]
    nfs_host: String,

    /// NFS export root
    #[arg(long, env = "GRIDLET_NFS_ROOT", default_value = "/srv/gridlet")]
    nfs_root: String,

    /// Directory for per-job logs
    #[arg(long, env = "GRIDLET_LOG_DIR", default_value = "/var/log/gridlet")]
    log_dir: PathBuf,

    #[arg(long, env = "GRIDLET_SSH_PORT_MIN", default_value = "2200")]
    ssh_port_min: u16,

    #[arg(long, env = "GRIDLET_SSH_PORT_MAX", default_value = "2299")]
    ssh_port_max: u16,

    /// Host users connect to for interactive sessions (defaults to the board)
    #[arg(long, env = "GRIDLET_SSH_PUBLIC_HOST")]
    ssh_public_host: Option<String>,

    /// Docker CLI binary
    #[arg(long, env = "GRIDLET_DOCKER_BIN", default_value = "docker")]
    docker_bin: String,

    /// Port of the container engine on every board
    #[arg(long, env = "GRIDLET_ENGINE_PORT", default_value = "2375")]
    engine_port: u16,

    /// Timeout in seconds for short engine calls
    #[arg(long, env = "GRIDLET_COMMAND_TIMEOUT", default_value = "60")]
    command_timeout: u64,

    /// Timeout in seconds for image pulls and pushes
    #[arg(long, env = "GRIDLET_TRANSFER_TIMEOUT", default_value = "900")]
    transfer_timeout: u64,

    /// Timeout in seconds for batch commands (unbounded when omitted)
    #[arg(long, env = "GRIDLET_EXEC_TIMEOUT")]
    exec_timeout: Option<u64>,

    #[arg(long, env = "GRIDLET_HEARTBEAT", default_value = "30")]
    heartbeat_secs: u64,

    /// Leave existing containers alone when a job starts on a board
    #[arg(long, env = "GRIDLET_NO_EXCLUSIVE")]
    no_exclusive: bool,
}

#[derive(Debug, Clone)]
struct BoardArg {
    platform: String,
    hostname: String,
    address: Option<String>,
}

fn parse_board(value: &str) -> Result<BoardArg, String> {
    let (platform, rest) = value
        .split_once(':')
        .ok_or_else(|| format!("expected platform:hostname[=address], got {:?}", value))?;
    let (hostname, address) = match rest.split_once('=') {
        Some((hostname, address)) => (hostname, Some(address.to_string())),
        None => (rest, None),
    };
    if platform.is_empty() || hostname.is_empty() {
        return Err(format!("expected platform:hostname[=address], got {:?}", value));
    }
    Ok(BoardArg {
        platform: platform.to_string(),
        hostname: hostname.to_string(),
        address,
    })
}

impl ServerArgs {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            api_addr: self.listen,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            exclusive_jobs: !self.no_exclusive,
            engine: EngineConfig {
                docker_bin: self.docker_bin.clone(),
                port: self.engine_port,
                command_timeout: Duration::from_secs(self.command_timeout),
                transfer_timeout: Duration::from_secs(self.transfer_timeout),
                exec_timeout: self.exec_timeout.map(Duration::from_secs),
            },
            registry: RegistryConfig {
                address: self.registry.clone(),
                username: self.registry_user.clone(),
                password: self.registry_password.clone(),
            },
            workspace: WorkspaceConfig {
                nfs_host: self.nfs_host.clone(),
                nfs_root: self.nfs_root.clone(),
                log_dir: self.log_dir.clone(),
                ..WorkspaceConfig::default()
            },
            ssh: SshConfig {
                port_min: self.ssh_port_min,
                port_max: self.ssh_port_max,
                public_host: self.ssh_public_host.clone(),
            },
            backend: BackendConfig {
                endpoint: self.backend_url.clone(),
                request_timeout: Duration::from_secs(self.backend_timeout),
            },
        }
    }

    fn memory_backend(&self) -> MemoryBackend {
        let backend = MemoryBackend::new();
        for platform in &self.platform {
            backend.add_platform(platform);
        }
        for board in &self.board {
            backend.add_platform(&board.platform);
            backend.add_board(&board.platform, &board.hostname, board.address.as_deref());
        }
        backend
    }
}

// =============================================================================
// Client Arguments (shared by all client commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Control API address
    #[arg(long, short = 'a', env = "GRIDLET_ADDR", default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Batch,
    Interactive,
}

impl From<KindArg> for SessionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Batch => SessionKind::Batch,
            KindArg::Interactive => SessionKind::Interactive,
        }
    }
}

// =============================================================================
// Session and Board Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum SessionCommands {
    /// Submit a session
    Submit {
        /// Session id assigned by the backend
        #[arg(long)]
        id: u64,

        #[arg(long)]
        name: String,

        #[arg(long)]
        user: String,

        #[arg(long)]
        platform: String,

        #[arg(long = "type", value_enum, default_value = "batch")]
        kind: KindArg,

        /// Maximum number of jobs running at once
        #[arg(long, default_value = "1")]
        max_jobs: u32,

        /// Number of dataset chunks (one job each)
        #[arg(long, default_value = "1")]
        split: u32,

        #[arg(long)]
        image: String,

        /// Image options, e.g. "--privileged --device=/dev/gpiomem"
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        image_options: String,

        /// Command to run in every batch job
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Cancel a session
    Cancel { id: u64 },
    /// Save the container of a session as a new image
    Save { id: u64, image: String },
}

#[derive(clap::Subcommand, Debug)]
enum BoardCommands {
    /// Register a board with a platform
    Add {
        platform: String,
        hostname: String,
        /// Engine address, defaults to the hostname
        #[arg(long)]
        address: Option<String>,
    },
    /// Unregister a board
    Remove { platform: String, hostname: String },
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.service_config();
    let backend: Arc<dyn Backend> = if config.backend.endpoint.is_some() {
        Arc::new(GraphqlBackend::new(&config.backend)?)
    } else {
        tracing::warn!("No backend endpoint configured, keeping the record in memory");
        Arc::new(args.memory_backend())
    };
    let connector = Arc::new(DockerConnector::new(config.engine.clone()));
    let shutdown = install_shutdown_handler()?;

    tracing::info!(
        api_addr = %config.api_addr,
        backend = ?config.backend.endpoint,
        registry = %config.registry.address,
        exclusive = config.exclusive_jobs,
        ssh_ports = config.ssh.pool_size(),
        "Starting gridlet"
    );

    Node::new(config, backend, connector, shutdown).run().await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    fn new(args: &ClientArgs) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: args.addr.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn action(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<ActionResponse, Box<dyn std::error::Error>> {
        let response = request.send().await?;
        let status = response.status();
        let body: ActionResponse = response.json().await?;
        if !body.success {
            eprintln!(
                "Error ({}): {}",
                status,
                body.error.as_deref().unwrap_or("request failed")
            );
            std::process::exit(1);
        }
        Ok(body)
    }

    async fn grids(&self, path: &str, post: bool) -> Result<Vec<GridStatus>, Box<dyn std::error::Error>> {
        let request = if post {
            self.http.post(self.url(path))
        } else {
            self.http.get(self.url(path))
        };
        let response = request.send().await?;
        if !response.status().is_success() {
            let body: ActionResponse = response.json().await?;
            eprintln!("Error: {}", body.error.as_deref().unwrap_or("request failed"));
            std::process::exit(1);
        }
        Ok(response.json().await?)
    }
}

fn print_action(
    output_format: &OutputFormat,
    response: &ActionResponse,
    message: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(response)?),
        OutputFormat::Table => println!("{}", message),
    }
    Ok(())
}

async fn handle_session(
    client: &ApiClient,
    command: SessionCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        SessionCommands::Submit {
            id,
            name,
            user,
            platform,
            kind,
            max_jobs,
            split,
            image,
            image_options,
            command,
        } => {
            let record = SessionRecord {
                id,
                name: name.clone(),
                kind: kind.into(),
                state: SessionState::Submitted,
                username: user,
                max_jobs,
                dataset_split: split,
                command,
                platform,
                docker_image: DockerImage {
                    name: image,
                    options: image_options,
                },
                jobs: Vec::new(),
            };
            let response = client
                .action(client.http.post(client.url("/api/sessions")).json(&record))
                .await?;
            print_action(output_format, &response, &format!("Session {} submitted", name))
        }
        SessionCommands::Cancel { id } => {
            let response = client
                .action(client.http.delete(client.url(&format!("/api/sessions/{}", id))))
                .await?;
            print_action(output_format, &response, &format!("Session {} canceled", id))
        }
        SessionCommands::Save { id, image } => {
            let response = client
                .action(
                    client
                        .http
                        .post(client.url(&format!("/api/sessions/{}/save", id)))
                        .json(&SaveSessionRequest {
                            image_name: image.clone(),
                        }),
                )
                .await?;
            print_action(
                output_format,
                &response,
                &format!("Saving session {} as {}", id, image),
            )
        }
    }
}

async fn handle_board(
    client: &ApiClient,
    command: BoardCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        BoardCommands::Add {
            platform,
            hostname,
            address,
        } => {
            let response = client
                .action(
                    client
                        .http
                        .post(client.url(&format!("/api/platforms/{}/boards", platform)))
                        .json(&AddBoardRequest {
                            hostname: hostname.clone(),
                            address,
                            id: 0,
                        }),
                )
                .await?;
            print_action(
                output_format,
                &response,
                &format!("Board {} added to {}", hostname, platform),
            )
        }
        BoardCommands::Remove { platform, hostname } => {
            let response = client
                .action(client.http.delete(client.url(&format!(
                    "/api/platforms/{}/boards/{}",
                    platform, hostname
                ))))
                .await?;
            print_action(
                output_format,
                &response,
                &format!("Board {} removed from {}", hostname, platform),
            )
        }
    }
}

#[derive(Serialize)]
struct StatusOutput<'a> {
    platforms: &'a [GridStatus],
}

fn print_grids(
    grids: &[GridStatus],
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&StatusOutput { platforms: grids })?
            );
        }
        OutputFormat::Table => {
            if grids.is_empty() {
                println!("No platforms found.");
            }
            for grid in grids {
                println!("Platform {}", grid.platform.name);
                println!("{}", "=".repeat(60));

                println!("{:<24} {:<24} STATUS", "BOARD", "ADDRESS");
                println!("{}", "-".repeat(60));
                for board in &grid.boards {
                    let status = if board.used { "[*] used" } else { "[ ] free" };
                    println!("{:<24} {:<24} {}", board.hostname, board.address, status);
                }
                println!();

                println!(
                    "{:<8} {:<20} {:<12} {:<11} {:>7} {:>7}",
                    "ID", "SESSION", "TYPE", "STATE", "PENDING", "RUNNING"
                );
                println!("{}", "-".repeat(70));
                for session in &grid.subscribers {
                    println!(
                        "{:<8} {:<20} {:<12} {:<11} {:>7} {:>7}",
                        session.id,
                        session.name,
                        format!("{:?}", session.kind).to_lowercase(),
                        session.state.to_string(),
                        session.pending,
                        session.running.len()
                    );
                }
                println!();

                println!("{:<8} {:<20} {:<24} CONTAINER", "JOB", "SESSION", "BOARD");
                println!("{}", "-".repeat(70));
                for job in &grid.running_jobs {
                    let container = job
                        .container
                        .as_deref()
                        .map(|c| c.chars().take(12).collect::<String>())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<8} {:<20} {:<24} {}",
                        job.id,
                        job.session,
                        job.board.as_deref().unwrap_or("-"),
                        container
                    );
                }
                println!();
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Session { client, command } => {
            let api = ApiClient::new(&client);
            handle_session(&api, command, &client.output).await?;
        }
        Commands::Board { client, command } => {
            let api = ApiClient::new(&client);
            handle_board(&api, command, &client.output).await?;
        }
        Commands::Status { client } => {
            let api = ApiClient::new(&client);
            let grids = api.grids("/api/platforms", false).await?;
            print_grids(&grids, &client.output)?;
        }
        Commands::Diagnostics { client } => {
            let api = ApiClient::new(&client);
            let grids = api.grids("/api/diagnostics", true).await?;
            print_grids(&grids, &client.output)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_argument_forms() {
        let board = parse_board("rpi:rpi-01").unwrap();
        assert_eq!(board.platform, "rpi");
        assert_eq!(board.hostname, "rpi-01");
        assert!(board.address.is_none());

        let board = parse_board("rpi:rpi-02=10.0.0.2").unwrap();
        assert_eq!(board.address.as_deref(), Some("10.0.0.2"));

        assert!(parse_board("rpi-01").is_err());
        assert!(parse_board(":rpi-01").is_err());
    }

    #[test]
    fn cli_parses_session_submit() {
        let args = Args::try_parse_from([
            "gridlet",
            "session",
            "submit",
            "--id",
            "7",
            "--name",
            "nightly",
            "--user",
            "alice",
            "--platform",
            "rpi",
            "--split",
            "4",
            "--image",
            "ubuntu-run",
            "--",
            "python3",
            "bench.py",
        ])
        .unwrap();
        match args.command {
            Commands::Session {
                command: SessionCommands::Submit { split, command, .. },
                ..
            } => {
                assert_eq!(split, 4);
                assert_eq!(command, vec!["python3", "bench.py"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
