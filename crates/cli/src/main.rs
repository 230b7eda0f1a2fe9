use clap::{Parser, Subcommand};
use lib::client::RemoteClientFactory;
use lib::health::{HealthSupervisor, PidProcess};
use lib::logging::LogBus;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Switchboard: multi-session messaging gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory, a default config and the sessions directory.
    Init {
        /// Config file path (default: SWITCHBOARD_CONFIG_PATH or ~/.switchboard/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway (HTTP + WebSocket). A watchdog thread probes it unless disabled.
    Gateway {
        /// Config file path (default: SWITCHBOARD_CONFIG_PATH or ~/.switchboard/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP and WebSocket port (default from config or 9503)
        #[arg(long, short)]
        port: Option<u16>,

        /// Session to start at boot, in addition to sessions.autoload (repeatable).
        #[arg(long = "session", short, value_name = "NAME")]
        sessions: Vec<String>,

        /// Do not run the in-process watchdog.
        #[arg(long)]
        no_health: bool,
    },

    /// Watch a running gateway from a separate process and kill it when it stops answering.
    Watchdog {
        /// Config file path (default: SWITCHBOARD_CONFIG_PATH or ~/.switchboard/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Pid of the gateway process.
        #[arg(long)]
        pid: u32,
    },
}

#[tokio::main]
async fn main() {
    let logs = Arc::new(LogBus::new());
    if let Err(e) = lib::logging::init(logs.clone(), "info") {
        eprintln!("installing logger failed: {}", e);
    }

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("switchboard {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway {
            config,
            port,
            sessions,
            no_health,
        }) => {
            if let Err(e) = run_gateway(config, port, sessions, no_health, logs).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Watchdog { config, pid }) => {
            if let Err(e) = run_watchdog(config, pid).await {
                log::error!("watchdog failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    sessions: Vec<String>,
    no_health: bool,
    logs: Arc<LogBus>,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    for name in sessions {
        if !config.sessions.autoload.contains(&name) {
            config.sessions.autoload.push(name);
        }
    }
    if config.health.enabled && !no_health {
        HealthSupervisor::from_config(&config, Arc::new(PidProcess::current())).spawn_watchdog()?;
    } else {
        log::info!("health watchdog disabled");
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    lib::gateway::run_gateway(config, path, Arc::new(RemoteClientFactory), logs).await
}

async fn run_watchdog(config_path: Option<PathBuf>, pid: u32) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let outcome = HealthSupervisor::from_config(&config, Arc::new(PidProcess::new(pid)))
        .run()
        .await;
    log::info!("watchdog finished: {:?}", outcome);
    Ok(())
}
