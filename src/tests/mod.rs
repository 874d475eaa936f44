mod search;

use async_trait::async_trait;
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    app::{
        registry::{Collection, CollectionRegistry},
        search::SearchCoordinator,
        writer::DualStoreWriter,
    },
    config::{CollectionConfig, Config, PersistStrategy},
    metadata::{CsvTable, MetadataError, MetadataRecord, MetadataStore},
    semantic::{Embedder, EmbeddingError, Position, TextProjection, VectorStorage},
};

pub const KEYWORDS: [&str; 4] = ["rust", "python", "java", "golang"];
pub const DIMENSIONS: usize = KEYWORDS.len();
pub const COLLECTION: &str = "docs";

/// Embeds text as keyword counts, one dimension per entry of `KEYWORDS`.
#[derive(Default)]
pub struct KeywordEmbedder {
    pub fail: AtomicBool,
    pub stall: AtomicBool,
    pub wrong_dimensions: AtomicBool,
    pub calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let text = text.to_lowercase();
        KEYWORDS
            .iter()
            .map(|k| text.matches(k).count() as f32)
            .collect()
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-count"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Status(reqwest::StatusCode::BAD_GATEWAY));
        }

        let mut vector = Self::vector(text);
        if self.wrong_dimensions.load(Ordering::SeqCst) {
            vector.push(0.0);
        }
        Ok(vector)
    }
}

/// Table wrapper whose inserts or commits can be made to fail, or inserts to stall.
pub struct FailingStore {
    pub inner: CsvTable,
    pub fail_insert: AtomicBool,
    pub fail_commit: AtomicBool,
    pub slow_insert: AtomicBool,
}

impl FailingStore {
    pub fn new(inner: CsvTable) -> Self {
        Self {
            inner,
            fail_insert: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            slow_insert: AtomicBool::new(false),
        }
    }

    fn stall(&self) {
        if self.slow_insert.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(300));
        }
    }

    fn injected() -> MetadataError {
        MetadataError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "injected failure",
        ))
    }
}

impl MetadataStore for FailingStore {
    fn fields(&self) -> &[String] {
        self.inner.fields()
    }

    fn insert_at(&self, position: Position, record: MetadataRecord) -> Result<(), MetadataError> {
        self.stall();
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.insert_at(position, record)
    }

    fn bulk_insert(&self, rows: Vec<(Position, MetadataRecord)>) -> Result<(), MetadataError> {
        self.stall();
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.bulk_insert(rows)
    }

    fn get(&self, position: Position) -> Result<MetadataRecord, MetadataError> {
        self.inner.get(position)
    }

    fn row_count(&self) -> usize {
        self.inner.row_count()
    }

    fn max_position(&self) -> Option<Position> {
        self.inner.max_position()
    }

    fn commit(&self) -> Result<(), MetadataError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.commit()
    }
}

pub fn record(pairs: &[(&str, &str)]) -> MetadataRecord {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// One `docs` collection (`title`, `body`) in a temp directory, keyword embedder.
pub fn test_config(base_path: &Path) -> Config {
    let mut config = Config::default().with_base_path(base_path);
    config.embedder.model = "keyword-count".to_string();
    config.embedder.dimensions = DIMENSIONS;
    config.embedder.timeout_secs = 1;
    config.search.top_n = 3;
    config.bootstrap.batch_size = 2;
    config.collections = vec![CollectionConfig {
        name: COLLECTION.to_string(),
        index_file: "docs.index".into(),
        table_file: "docs.csv".into(),
        fields: vec!["title".to_string(), "body".to_string()],
        projection: "{title} {body}".to_string(),
        source: None,
        field_bounds: Default::default(),
    }];
    config
}

pub struct TestEnv {
    pub tmp: tempfile::TempDir,
    pub config: Config,
    pub embedder: Arc<KeywordEmbedder>,
    pub store: Arc<FailingStore>,
    pub registry: Arc<CollectionRegistry>,
    pub writer: Arc<DualStoreWriter>,
    pub search: SearchCoordinator,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_strategy(PersistStrategy::Append)
    }

    pub fn with_strategy(strategy: PersistStrategy) -> Self {
        let tmp = tempfile::tempdir().expect("failed to create temp dir");
        Self::open(tmp, strategy)
    }

    /// Open (or reopen) the collection stored under `tmp`.
    pub fn open(tmp: tempfile::TempDir, strategy: PersistStrategy) -> Self {
        let mut config = test_config(tmp.path());
        config.persistence.strategy = strategy;

        let embedder = Arc::new(KeywordEmbedder::default());
        let model_id = embedder.model_id_hash();

        let collection_cfg = &config.collections[0];
        let storage = VectorStorage::new(config.resolve(&collection_cfg.index_file));
        let index = storage.load(&model_id, DIMENSIONS).unwrap();
        let table = CsvTable::load(
            &config.resolve(&collection_cfg.table_file),
            collection_cfg.fields.clone(),
        )
        .unwrap();
        let store = Arc::new(FailingStore::new(table));

        let mut registry = CollectionRegistry::new();
        registry.insert(Collection::new(
            COLLECTION,
            index,
            storage,
            store.clone(),
            TextProjection::parse(&collection_cfg.projection).unwrap(),
            model_id,
        ));
        let registry = Arc::new(registry);

        let writer = Arc::new(DualStoreWriter::new(
            registry.clone(),
            embedder.clone(),
            config.embedder.timeout(),
            strategy,
        ));
        let search = SearchCoordinator::new(
            registry.clone(),
            embedder.clone(),
            config.embedder.timeout(),
            config.search.top_n,
        );

        Self {
            tmp,
            config,
            embedder,
            store,
            registry,
            writer,
            search,
        }
    }

    pub fn collection(&self) -> Arc<Collection> {
        self.registry.get(COLLECTION).unwrap()
    }

    /// Drop every in-memory handle and load the collection again from disk.
    pub fn reopen(self) -> Self {
        let strategy = self.config.persistence.strategy;
        Self::open(self.tmp, strategy)
    }

    /// Vector count and row count must agree.
    pub fn assert_consistent(&self) {
        let collection = self.collection();
        assert_eq!(collection.len(), collection.table().row_count());
        assert_eq!(collection.check_consistency(), None);
    }
}
