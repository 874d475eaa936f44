use anyhow::{Context, Result};
use homedir::my_home;
use std::{path::PathBuf, sync::Arc};

use crate::{
    app::{
        registry::{CollectionRegistry, OpenMode},
        service::AppService,
    },
    config::Config,
    semantic::{Embedder, HttpEmbedder},
};

/// Builds the application from the data directory.
pub struct AppFactory;

impl AppFactory {
    /// Resolve and create the data directory.
    ///
    /// `RVS_BASE_PATH` (or `--base-path`) wins; otherwise `~/.local/share/rvsearch`.
    pub fn base_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
        let base_path = match explicit {
            Some(path) => path,
            None => my_home()
                .context("could not determine home directory")?
                .context("home directory path is empty")?
                .join(".local/share/rvsearch"),
        };

        std::fs::create_dir_all(&base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        Ok(base_path)
    }

    pub fn create_embedder(config: &Config) -> Result<Arc<HttpEmbedder>> {
        let embedder = HttpEmbedder::new(&config.embedder).context("failed to build embedder client")?;
        Ok(Arc::new(embedder))
    }

    /// Open every collection and wire the service around `embedder`.
    pub fn create_app_service(config: &Config, embedder: Arc<dyn Embedder>) -> Result<AppService> {
        Self::build(config, embedder, OpenMode::ReadWrite)
    }

    /// Like `create_app_service`, for commands that never write: no table file is created.
    pub fn create_read_only_service(
        config: &Config,
        embedder: Arc<dyn Embedder>,
    ) -> Result<AppService> {
        Self::build(config, embedder, OpenMode::ReadOnly)
    }

    fn build(config: &Config, embedder: Arc<dyn Embedder>, mode: OpenMode) -> Result<AppService> {
        let registry = CollectionRegistry::open_with(config, embedder.model_id_hash(), mode)?;

        for status in registry.iter().map(|c| c.status()) {
            if let Some(reason) = &status.halted {
                log::error!("collection '{}' starts halted: {reason}", status.name);
            }
        }

        Ok(AppService::new(config, registry, embedder))
    }
}
