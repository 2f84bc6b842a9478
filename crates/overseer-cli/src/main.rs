mod config;

use clap::{Parser, Subcommand};
use config::OverseerConfig;
use overseer_gateway::{GatewayServer, ObserverSession, ReconnectPolicy};
use overseer_orchestrator::{
    ConfigCatalog, Engine, ProcessSupervisor, ServerEvent, WorkspaceManager,
};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "overseer", about = "Overseer: supervise worker agents and the tasks they run")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "overseer.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestration server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List the configured worker types
    Configs,
    /// Follow a running server's state changes
    Watch {
        /// Observer socket URL
        #[arg(long, default_value = "ws://127.0.0.1:8765/ws")]
        url: String,
        /// Connection attempts before giving up
        #[arg(long, default_value_t = 5)]
        attempts: u32,
        /// Seconds between connection attempts
        #[arg(long, default_value_t = 2)]
        delay: u64,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Serve { host, port } => {
            let config = OverseerConfig::load(&cli.config)?;
            serve(config, host, port).await?;
        }
        Commands::Configs => {
            let config = OverseerConfig::load(&cli.config)?;
            if config.workers.is_empty() {
                println!("No worker configurations.");
                println!("Add them to {} under [[workers]]", cli.config.display());
            } else {
                println!("Worker configurations:");
                for worker in &config.workers {
                    println!("  {}: {} {}", worker.name, worker.command, worker.args.join(" "));
                }
                println!("\nTotal: {} configuration(s)", config.workers.len());
            }
        }
        Commands::Watch {
            url,
            attempts,
            delay,
        } => {
            let policy = ReconnectPolicy {
                max_attempts: attempts,
                delay: Duration::from_secs(delay),
            };
            watch(url, policy).await?;
        }
    }

    Ok(())
}

async fn serve(config: OverseerConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut server = config.server;
    if let Some(host) = host {
        server.host = host;
    }
    if let Some(port) = port {
        server.port = port;
    }

    let catalog = ConfigCatalog::new(config.workers)?;
    if catalog.is_empty() {
        warn!("No worker configurations; agents cannot be created");
    }

    let mut workspaces = WorkspaceManager::open(&config.engine.workspace_root)?;
    if let Err(e) = workspaces.set_count(config.engine.workspace_count) {
        warn!(
            requested = config.engine.workspace_count,
            kept = workspaces.len(),
            error = %e,
            "Workspace pool left at its current size"
        );
    }

    let (supervisor, events) =
        ProcessSupervisor::new(server.public_url(), &config.engine.workdir_root);
    let engine = Engine::new(
        config.engine.settings(),
        catalog,
        workspaces,
        Arc::new(supervisor),
        events,
    );

    let app = GatewayServer::build(Arc::clone(&engine));
    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, public_url = %server.public_url(), "Overseer listening");

    // Shutting the engine down closes every socket, which lets the server drain.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            engine.shutdown().await;
        })
        .await?;

    info!("Overseer stopped");
    Ok(())
}

async fn watch(url: String, policy: ReconnectPolicy) -> anyhow::Result<()> {
    let mut session = ObserverSession::new(url, policy);
    session
        .run(|event, state| {
            match event {
                ServerEvent::State { .. } => println!(
                    "[state] mode={} agents={} tasks={}",
                    state.mode,
                    state.agents.len(),
                    state.tasks.len()
                ),
                ServerEvent::AgentUpdate { agent_id, data } => {
                    println!("[agent] {agent_id} {}", data.status);
                }
                ServerEvent::TaskUpdate { task_id, data } => {
                    println!("[task] {task_id} {}", data.status);
                }
                ServerEvent::Error { message } => println!("[error] {message}"),
                other => println!("[{}]", other.kind()),
            }
            ControlFlow::Continue(())
        })
        .await?;
    Ok(())
}
