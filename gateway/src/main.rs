use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod cipher;
mod config;
mod oracle;

use api::AppState;
use cipher::AesCbcCipher;
use config::Config;
use oracle::HttpOracle;

use upstream::client::ApiClient;
use upstream::device::DeviceState;
use upstream::keys::KeyRegistry;
use upstream::prefetch::ChapterPrefetcher;
use upstream::restart::Supervisor;
use upstream::rotation::{self, DeviceRotator};
use upstream::search::SearchCoordinator;
use upstream::signing::SignatureClient;

#[derive(Parser)]
#[command(name = "gateway", about = "HTTP facade over the upstream novel API")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, path = %cli.config.display(), "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    upstream::metrics_defs::describe_metrics();

    let devices = Arc::new(DeviceState::from_config(&config.api)?);
    let oracle = Arc::new(HttpOracle::new(config.oracle.url.clone())?);
    let signer = SignatureClient::new(oracle);
    let client = Arc::new(ApiClient::new(
        config.api.clone(),
        &config.fetch,
        Arc::clone(&devices),
        signer,
    )?);
    let keys = Arc::new(KeyRegistry::new(Arc::clone(&client)));
    let rotator = Arc::new(DeviceRotator::new(
        Arc::clone(&devices),
        Arc::clone(&keys),
        &config.api,
    ));
    let (supervisor, mut shutdown_rx) = Supervisor::new(&config.fetch);
    let search = Arc::new(SearchCoordinator::new(
        Arc::clone(&client),
        Arc::clone(&rotator),
        Arc::clone(&supervisor),
        config.fetch.clone(),
        devices.pool_len(),
    ));
    let prefetcher = Arc::new(ChapterPrefetcher::new(
        Arc::clone(&client),
        Arc::clone(&search),
        Arc::clone(&keys),
        Arc::new(AesCbcCipher),
        &config.fetch,
    ));

    if config.api.device_pool_probe_on_startup {
        rotation::probe_startup(&search, &devices, &config.api).await;
    }

    let app = api::router(AppState { search, prefetcher });
    let listener = tokio::net::TcpListener::bind(config.listener).await?;
    info!(listener = %config.listener, oracle = %config.oracle.url, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                reason = shutdown_rx.recv() => {
                    info!(
                        reason = reason.as_deref().unwrap_or("unknown"),
                        "restart requested, shutting down"
                    );
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                }
            }
        })
        .await?;
    Ok(())
}
