use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stemforge::catalog::Catalog;
use stemforge::config::{AppConfig, CliConfig, EnvConfig, FileConfig};
use stemforge::jobs::{CoverDeps, JobLauncher, DEFAULT_JOB_SLOTS};
use stemforge::kie::KieClient;
use stemforge::server::{run_server, RequestsLoggingLevel, ServerConfig};
use stemforge::storage::{GitHubStore, RemoteStore, StorageSync};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory the downloaded beats live in.
    #[clap(long, default_value = "downloads", value_parser = parse_path)]
    pub downloads_dir: PathBuf,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 8080)]
    pub port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Path to an optional TOML config file.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the frontend directory to be statically served.
    #[clap(long)]
    pub frontend_dir_path: Option<String>,

    /// How many jobs may run at the same time.
    #[clap(long, default_value_t = DEFAULT_JOB_SLOTS)]
    pub max_concurrent_jobs: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .ok();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        downloads_dir: cli_args.downloads_dir,
        port: cli_args.port,
        logging_level: cli_args.logging_level,
        frontend_dir_path: cli_args.frontend_dir_path,
        max_concurrent_jobs: cli_args.max_concurrent_jobs,
    };
    let config = AppConfig::resolve(&cli_config, file_config, &EnvConfig::load())?;

    tokio::fs::create_dir_all(&config.downloads_dir)
        .await
        .with_context(|| format!("cannot create downloads dir {:?}", config.downloads_dir))?;
    info!("Serving downloads from {:?}", config.downloads_dir);

    let remote: Option<Arc<dyn RemoteStore>> = match config.github_config() {
        Some(github) => {
            info!("Remote storage mirror enabled on {}", github.repo);
            Some(Arc::new(GitHubStore::new(github)?) as Arc<dyn RemoteStore>)
        }
        None => {
            info!("Remote storage mirror disabled (no token/repo configured)");
            None
        }
    };
    let sync = Arc::new(StorageSync::new(config.downloads_dir.clone(), remote));
    let catalog = Catalog::new(config.downloads_dir.clone());

    let kie = config.kie_api_key.clone().map(|key| {
        info!("Cover generation enabled");
        Arc::new(KieClient::new(key))
    });
    let cover_deps = CoverDeps {
        kie,
        public_base_url: config.public_base_url.clone(),
    };

    let shutdown = CancellationToken::new();
    let launcher = Arc::new(JobLauncher::new(
        catalog.clone(),
        sync.clone(),
        cover_deps,
        config.max_concurrent_jobs,
        shutdown.clone(),
    ));

    let server_config = ServerConfig {
        port: config.port,
        requests_logging_level: config.logging_level.clone(),
        frontend_dir_path: config.frontend_dir_path.clone(),
    };

    info!("Ready to serve at port {}!", config.port);
    run_server(server_config, catalog, sync, launcher, shutdown).await
}
