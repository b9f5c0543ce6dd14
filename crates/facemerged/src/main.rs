use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

const BUS_NAME: &str = "org.facemerge.FaceMerge1";
const OBJECT_PATH: &str = "/org/facemerge/FaceMerge1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facemerged starting");

    let config = config::Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        timeout_secs = config.merge_timeout_secs,
        "configuration loaded"
    );

    let engine = engine::start(&config)?;
    let service = dbus_interface::FaceMergeService::new(engine, &config);

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "facemerged ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facemerged shutting down");

    Ok(())
}
