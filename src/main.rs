//! Warden - challenge container orchestrator.
//!
//! Usage:
//!   warden serve [--port 8888] [--db ./warden.db]   # Start HTTP API and reaper
//!   warden sweep                                    # Run one expiry sweep and exit
//!   warden templates [--catalog file.json]          # Print the template catalog

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warden::auth::HttpAuthenticator;
use warden::clock::SystemClock;
use warden::runtime::DockerRuntime;
use warden::{http_server, Catalog, Config, Ledger, Warden};

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Per-user challenge containers with automatic expiry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP API and the expiry reaper
    Serve {
        #[command(flatten)]
        settings: Settings,
    },
    /// Run a single expiry sweep and exit
    Sweep {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        reaper: ReaperArgs,
    },
    /// Print the template catalog as JSON
    Templates {
        /// JSON file with the template list (built-in list when omitted)
        #[arg(long, env = "WARDEN_CATALOG")]
        catalog: Option<PathBuf>,
    },
}

/// Where instances are recorded and how they are run.
#[derive(Args, Debug)]
struct StoreArgs {
    /// SQLite ledger file
    #[arg(long, env = "WARDEN_DB", default_value = "./warden.db")]
    db: PathBuf,

    /// Keep the ledger in memory instead of on disk
    #[arg(long)]
    in_memory: bool,

    /// JSON file with the template list (built-in list when omitted)
    #[arg(long, env = "WARDEN_CATALOG")]
    catalog: Option<PathBuf>,

    /// Container runtime binary
    #[arg(long, env = "WARDEN_DOCKER", default_value = "docker")]
    docker: String,
}

#[derive(Args, Debug)]
struct ReaperArgs {
    /// Maximum concurrent reclamations per sweep
    #[arg(long, default_value = "8")]
    reclaim_concurrency: usize,

    /// Seconds to wait for the runtime to stop an instance
    #[arg(long, default_value = "10")]
    stop_timeout: u64,
}

#[derive(Args, Debug)]
struct Settings {
    /// Address to listen on
    #[arg(long, env = "WARDEN_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "WARDEN_PORT", default_value = "8888")]
    port: u16,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    reaper: ReaperArgs,

    /// Front-end page that answers 200 for logged-in sessions
    #[arg(long, env = "WARDEN_AUTH_URL", default_value = "http://127.0.0.1:4000/user")]
    auth_url: String,

    /// Host reported to players in instance URLs
    #[arg(long, env = "WARDEN_PUBLIC_HOST", default_value = "127.0.0.1")]
    public_host: String,

    /// First host port handed to instances
    #[arg(long, default_value = "10000")]
    port_min: u16,

    /// End of the host port range (exclusive)
    #[arg(long, default_value = "20000")]
    port_max: u16,

    /// Port challenges listen on inside their container
    #[arg(long, default_value = "8000")]
    internal_port: u16,

    /// Seconds to wait for the runtime to start an instance
    #[arg(long, default_value = "30")]
    spawn_timeout: u64,

    /// Seconds between expiry sweeps
    #[arg(long, default_value = "10")]
    sweep_interval: u64,
}

impl StoreArgs {
    fn apply(self, config: &mut Config) {
        config.db_path = (!self.in_memory).then_some(self.db);
        config.catalog_path = self.catalog;
        config.docker_bin = self.docker;
    }
}

impl ReaperArgs {
    fn apply(self, config: &mut Config) {
        config.reaper.concurrency = self.reclaim_concurrency;
        config.reaper.stop_timeout = Duration::from_secs(self.stop_timeout);
    }
}

impl Settings {
    fn into_config(self) -> Config {
        let mut config = Config {
            listen: SocketAddr::new(self.host, self.port),
            auth_url: self.auth_url,
            ports: self.port_min..self.port_max,
            ..Config::default()
        };
        self.store.apply(&mut config);
        self.reaper.apply(&mut config);
        config.provision.public_host = self.public_host;
        config.provision.internal_port = self.internal_port;
        config.provision.spawn_timeout = Duration::from_secs(self.spawn_timeout);
        config.reaper.interval = Duration::from_secs(self.sweep_interval);
        config
    }
}

fn sweep_config(store: StoreArgs, reaper: ReaperArgs) -> Config {
    let mut config = Config::default();
    store.apply(&mut config);
    reaper.apply(&mut config);
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { settings } => serve(settings.into_config()).await,
        Commands::Sweep { store, reaper } => sweep_once(sweep_config(store, reaper)).await,
        Commands::Templates { catalog } => {
            let catalog = load_catalog(catalog.as_ref())?;
            let mut templates: Vec<_> = catalog.iter().collect();
            templates.sort_by_key(|t| t.challenge_id);
            println!("{}", serde_json::to_string_pretty(&templates)?);
            Ok(())
        }
    }
}

fn load_catalog(path: Option<&PathBuf>) -> Result<Catalog> {
    match path {
        Some(path) => Catalog::from_file(path)
            .with_context(|| format!("Failed to load catalog from {}", path.display())),
        None => Ok(Catalog::builtin()),
    }
}

fn build(config: &Config) -> Result<Warden> {
    config.validate().context("Invalid configuration")?;

    let catalog = load_catalog(config.catalog_path.as_ref())?;
    let ledger = match &config.db_path {
        Some(path) => Ledger::open(path).context("Failed to open ledger")?,
        None => Ledger::open_in_memory().context("Failed to open in-memory ledger")?,
    };
    let auth = HttpAuthenticator::new(config.auth_url.clone(), config.auth_timeout)
        .context("Failed to build auth client")?;
    let runtime = DockerRuntime::new(config.docker_bin.clone());

    info!(templates = catalog.len(), "catalog loaded");
    Warden::new(
        config,
        catalog,
        ledger,
        Arc::new(auth),
        Arc::new(runtime),
        Arc::new(SystemClock),
    )
    .context("Failed to seed templates")
}

async fn serve(config: Config) -> Result<()> {
    let warden = build(&config)?;
    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for ctrl-c"),
            }
        }
    });

    let reaper = Arc::clone(&warden.reaper);
    let reaper_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { reaper.run(shutdown).await }
    });

    let served = http_server::run_server(config.listen, warden.app_state(), shutdown.clone())
        .await
        .context("Server error");

    shutdown.cancel();
    reaper_task.await.context("Reaper task failed")?;
    served
}

async fn sweep_once(config: Config) -> Result<()> {
    let warden = build(&config)?;
    let report = warden.reaper.sweep().await.context("Sweep failed")?;
    info!(
        inspected = report.inspected,
        reclaimed = report.reclaimed.len(),
        failed = report.failed.len(),
        "sweep finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_takes_only_store_and_reaper_flags() {
        let cli = Cli::try_parse_from([
            "warden",
            "sweep",
            "--in-memory",
            "--docker",
            "podman",
            "--stop-timeout",
            "3",
        ])
        .unwrap();
        let Commands::Sweep { store, reaper } = cli.command else {
            panic!("expected sweep");
        };
        let config = sweep_config(store, reaper);
        assert!(config.db_path.is_none());
        assert_eq!(config.docker_bin, "podman");
        assert_eq!(config.reaper.stop_timeout, Duration::from_secs(3));
        config.validate().unwrap();

        assert!(Cli::try_parse_from(["warden", "sweep", "--port", "9000"]).is_err());
    }

    #[test]
    fn serve_still_accepts_listen_flags() {
        let cli = Cli::try_parse_from(["warden", "serve", "--port", "9000", "--in-memory"]).unwrap();
        let Commands::Serve { settings } = cli.command else {
            panic!("expected serve");
        };
        let config = settings.into_config();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.reaper.stop_timeout, Duration::from_secs(10));
    }
}
