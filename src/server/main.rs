//! HTTP/SSE entrypoint: wires configuration, the Overpass client, the land
//! dataset, and the job manager into an axum server.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use boundaryd::config::Config;
use boundaryd::http::{router, AppState};
use boundaryd::jobs::JobManager;
use boundaryd::land::LandDataset;
use boundaryd::overpass::OverpassClient;

#[derive(Parser, Debug)]
#[command(name = "boundaryd")]
#[command(about = "OSM administrative boundary download service")]
struct Args {
    /// Bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    bind: String,

    /// Bind port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("boundaryd=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::from_env()?);

    tracing::info!(data_dir = %config.data_dir.display(), "boundaryd starting up");

    std::fs::create_dir_all(config.geojson_dir())?;
    std::fs::create_dir_all(config.cache_dir())?;

    let overpass = Arc::new(OverpassClient::new(
        config.overpass_url.clone(),
        config.http_user_agent.clone(),
        config.http_timeout_sec,
    ));
    let land = Arc::new(LandDataset::new(config.land_polygons_zip_path()));
    let jobs = JobManager::new(config.clone(), overpass.clone(), land.clone());

    let state = Arc::new(AppState {
        config,
        overpass,
        land,
        jobs: Arc::new(jobs),
    });

    let app = router(state);

    let addr = format!("{}:{}", args.bind, args.port);
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
