use std::sync::Arc;

use crate::{
    config::Config,
    metadata::MetadataRecord,
    semantic::{Embedder, Position},
};

use super::{
    bootstrap::{BootstrapOutcome, Bootstrapper, BulkSource},
    errors::AppError,
    registry::{CollectionRegistry, CollectionStatus},
    search::{SearchCoordinator, SearchResult},
    writer::{DualStoreWriter, ReconcileReport},
};

/// Everything a frontend (HTTP or CLI) needs, sharing one registry.
pub struct AppService {
    registry: Arc<CollectionRegistry>,
    writer: Arc<DualStoreWriter>,
    search: SearchCoordinator,
    bootstrapper: Bootstrapper,
}

impl AppService {
    pub fn new(config: &Config, registry: CollectionRegistry, embedder: Arc<dyn Embedder>) -> Self {
        let registry = Arc::new(registry);
        let timeout = config.embedder.timeout();

        let writer = Arc::new(DualStoreWriter::new(
            registry.clone(),
            embedder.clone(),
            timeout,
            config.persistence.strategy,
        ));
        let search = SearchCoordinator::new(registry.clone(), embedder, timeout, config.search.top_n);
        let bootstrapper =
            Bootstrapper::new(registry.clone(), writer.clone(), config.bootstrap.batch_size);

        Self {
            registry,
            writer,
            search,
            bootstrapper,
        }
    }

    pub async fn search(&self, collection: &str, text: &str) -> Result<SearchResult, AppError> {
        self.search.search(collection, text).await
    }

    pub async fn search_top(
        &self,
        collection: &str,
        text: &str,
        top_n: usize,
    ) -> Result<SearchResult, AppError> {
        self.search.search_top(collection, text, top_n).await
    }

    pub async fn add(&self, collection: &str, record: MetadataRecord) -> Result<Position, AppError> {
        self.writer.add(collection, record).await
    }

    pub async fn reconcile(&self, collection: &str) -> Result<ReconcileReport, AppError> {
        self.writer.reconcile(collection).await
    }

    pub async fn bootstrap(
        &self,
        sources: Vec<(String, Box<dyn BulkSource>)>,
    ) -> Result<BootstrapOutcome, AppError> {
        self.bootstrapper.run(sources).await
    }

    pub fn status(&self) -> Vec<CollectionStatus> {
        self.registry.iter().map(|c| c.status()).collect()
    }
}
