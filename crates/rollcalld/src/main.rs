use anyhow::Result;
use rollcall_core::AttendanceStore;
use rollcall_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::load()?;
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        storage = %config.storage_dir.display(),
        "configuration loaded"
    );

    let store: Arc<dyn AttendanceStore> = Arc::new(SqliteStore::open(&config.db_path)?);
    let engine = engine::spawn_engine(&config, Arc::clone(&store))?;
    let service = AttendanceService::new(engine, store, &config);

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(
        bus = if config.system_bus { "system" } else { "session" },
        name = BUS_NAME,
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
