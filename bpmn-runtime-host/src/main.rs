//! BPMN runtime host
//!
//! Loads the host config, deploys the definition documents it names,
//! reloads persisted timers and drives them until Ctrl-C.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bpmn_runtime_core::handler::{EchoHandler, ManualHandler};
use bpmn_runtime_core::{
    EntityStore, InMemoryDefinitionSource, MemoryStore, RuntimeEnvironment, RuntimeManager,
    TimerDriver, WorkItemHandlers,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{HostConfig, StoreConfig};

/// Default configuration path
const DEFAULT_CONFIG_PATH: &str = "config/bpmn-runtime.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BPMN_RUNTIME_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config_path = PathBuf::from(config_path);
    let config = if config_path.exists() {
        HostConfig::from_file(&config_path)?
    } else {
        HostConfig::default()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        path = %config_path.display(),
        deployment_id = %config.engine.deployment_id,
        strategy = %config.engine.strategy,
        "Configuration loaded"
    );

    let store = open_store(&config.store).await?;

    let definitions = Arc::new(InMemoryDefinitionSource::new());
    if config.definitions_dir.is_dir() {
        let deployed = definitions.load_dir(&config.definitions_dir)?;
        tracing::info!(dir = %config.definitions_dir.display(), deployed, "Definitions deployed");
    } else {
        tracing::warn!(dir = %config.definitions_dir.display(), "Definitions directory not found");
    }

    let handlers = Arc::new(WorkItemHandlers::new());
    handlers.register("echo", Arc::new(EchoHandler));
    handlers.register("manual", Arc::new(ManualHandler));

    let env = RuntimeEnvironment::builder()
        .config(config.engine.clone())
        .store(store)
        .definitions(definitions)
        .handlers(handlers)
        .build();

    let manager = Arc::new(RuntimeManager::new(env).await.context("Starting runtime manager")?);
    manager.recover_timers().await?;

    let (shutdown_tx, driver) = TimerDriver::new(manager.clone()).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Waiting for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    if let Err(e) = driver.await {
        tracing::error!(error = %e, "Timer driver task failed");
    }
    Ok(())
}

async fn open_store(config: &StoreConfig) -> Result<Arc<dyn EntityStore>> {
    match config {
        StoreConfig::Memory => {
            tracing::info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "postgres")]
        StoreConfig::Postgres { url } => {
            let store = bpmn_runtime_core::store::PgEntityStore::connect(url)
                .await
                .context("Connecting to Postgres")?;
            store.migrate().await.context("Creating bpmn_entities")?;
            tracing::info!("Using Postgres store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StoreConfig::Postgres { .. } => {
            anyhow::bail!("Postgres store configured but the host was built without the `postgres` feature")
        }
    }
}
