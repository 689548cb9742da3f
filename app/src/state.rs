use anyhow::Context;
use comet_config::{AppConfig, ConfigManager, StoreBackend};
use comet_runtime::{
    RenderSink, Runtime, SmtpTransport, Transport, UnconfiguredTransport,
};
use comet_storage::{MailStore, MemoryStore, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;

/// Overrides the platform config directory, mainly for portable installs.
const CONFIG_DIR_ENV: &str = "COMET_CONFIG_DIR";

pub struct AppState {
    pub config_manager: ConfigManager,
    pub config: AppConfig,
    pub runtime: Runtime,
}

impl AppState {
    pub fn load_config() -> anyhow::Result<(ConfigManager, AppConfig)> {
        let config_manager = match std::env::var_os(CONFIG_DIR_ENV) {
            Some(dir) => ConfigManager::at(PathBuf::from(dir))
                .context("initialize config manager from COMET_CONFIG_DIR")?,
            None => ConfigManager::new().context("initialize config manager")?,
        };
        let config = config_manager.load().context("load app config")?;
        Ok((config_manager, config))
    }

    pub async fn initialize(
        config_manager: ConfigManager,
        config: AppConfig,
        sink: Arc<dyn RenderSink>,
    ) -> anyhow::Result<Self> {
        let store: Arc<dyn MailStore> = match config.store.backend {
            StoreBackend::Memory => {
                tracing::warn!("using in-memory store; nothing will be persisted");
                Arc::new(MemoryStore::new())
            }
            StoreBackend::Sqlite => {
                let path = config_manager.store_path(&config);
                tracing::info!(path = %path.display(), "opening mail store");
                Arc::new(
                    SqliteStore::connect(&path)
                        .await
                        .context("connect sqlite store")?,
                )
            }
        };

        let transport: Arc<dyn Transport> = match &config.smtp {
            Some(smtp) => Arc::new(
                SmtpTransport::from_config(smtp).context("configure smtp transport")?,
            ),
            None => {
                tracing::info!("no smtp relay configured; sending is disabled");
                Arc::new(UnconfiguredTransport)
            }
        };

        let runtime = Runtime::start(&config, store, transport, sink);

        Ok(Self {
            config_manager,
            config,
            runtime,
        })
    }
}
