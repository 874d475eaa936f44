//! Collections and the registry holding them.
//!
//! A `Collection` is one consistency domain: a vector index, its durable file,
//! the metadata table keyed by the same positions, and the projection used to
//! embed records. The registry is built once at startup and only read afterwards.

use indexmap::IndexMap;
use std::sync::{Arc, RwLock};

use crate::{
    config::{CollectionConfig, Config},
    metadata::{CsvTable, MetadataStore},
    semantic::{IndexError, Neighbor, Position, TextProjection, VectorIndex, VectorStorage},
};

use super::errors::AppError;

/// Whether opening a collection may create its files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    /// Missing files read as empty and nothing is written.
    ReadOnly,
}

pub struct Collection {
    name: String,
    index: RwLock<VectorIndex>,
    storage: VectorStorage,
    table: Arc<dyn MetadataStore>,
    projection: TextProjection,
    model_id: [u8; 32],
    /// Held across a whole write sequence; one writer per collection.
    write_lock: tokio::sync::Mutex<()>,
    /// Set when the two stores are known to disagree. Writes are refused until cleared.
    halted: RwLock<Option<String>>,
}

impl Collection {
    /// Assemble a collection from already-opened parts and check that they agree.
    pub fn new(
        name: &str,
        index: VectorIndex,
        storage: VectorStorage,
        table: Arc<dyn MetadataStore>,
        projection: TextProjection,
        model_id: [u8; 32],
    ) -> Self {
        let collection = Self {
            name: name.to_string(),
            index: RwLock::new(index),
            storage,
            table,
            projection,
            model_id,
            write_lock: tokio::sync::Mutex::new(()),
            halted: RwLock::new(None),
        };

        if let Some(reason) = collection.check_consistency() {
            collection.halt(&reason);
        }

        collection
    }

    /// Open the index file and table named by `config`.
    pub fn open(
        config: &Config,
        collection: &CollectionConfig,
        model_id: [u8; 32],
        mode: OpenMode,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let storage = VectorStorage::new(config.resolve(&collection.index_file));
        let index = storage
            .load(&model_id, config.embedder.dimensions)
            .with_context(|| format!("failed to load index {}", storage.path().display()))?;

        let table_path = config.resolve(&collection.table_file);
        let fields = collection.fields.clone();
        let table = match mode {
            OpenMode::ReadWrite => CsvTable::load(&table_path, fields),
            OpenMode::ReadOnly => CsvTable::load_read_only(&table_path, fields),
        }
        .with_context(|| format!("failed to load table {}", table_path.display()))?;

        let projection = TextProjection::parse(&collection.projection)?;

        log::info!(
            "collection '{}': {} vectors, {} rows",
            collection.name,
            index.len(),
            table.row_count()
        );

        Ok(Self::new(
            &collection.name,
            index,
            storage,
            Arc::new(table),
            projection,
            model_id,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &Arc<dyn MetadataStore> {
        &self.table
    }

    pub fn projection(&self) -> &TextProjection {
        &self.projection
    }

    pub fn storage(&self) -> &VectorStorage {
        &self.storage
    }

    pub fn model_id(&self) -> &[u8; 32] {
        &self.model_id
    }

    pub fn dimensions(&self) -> usize {
        self.read_index(|index| index.dimensions())
    }

    /// Current index size, which is also the next position to be assigned.
    pub fn len(&self) -> usize {
        self.read_index(|index| index.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.table.row_count() == 0
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        self.read_index(|index| index.search(query, k))
    }

    pub(crate) async fn lock_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Run `f` with shared access to the index.
    ///
    /// A poisoned lock still holds a usable index: appends either complete or
    /// leave the buffer unchanged.
    pub(crate) fn read_index<R>(&self, f: impl FnOnce(&VectorIndex) -> R) -> R {
        let guard = self.index.read().unwrap_or_else(|e| e.into_inner());
        f(&*guard)
    }

    pub(crate) fn write_index<R>(&self, f: impl FnOnce(&mut VectorIndex) -> R) -> R {
        let mut guard = self.index.write().unwrap_or_else(|e| e.into_inner());
        f(&mut *guard)
    }

    pub fn halted(&self) -> Option<String> {
        self.halted
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Refuse further writes and report at the highest severity.
    pub(crate) fn halt(&self, reason: &str) {
        log::error!(
            "consistency violation in collection '{}': {reason}; writes halted until reconciled",
            self.name
        );
        *self.halted.write().unwrap_or_else(|e| e.into_inner()) = Some(reason.to_string());
    }

    pub(crate) fn clear_halt(&self) {
        *self.halted.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Build the error for a broken invariant and halt the collection.
    pub(crate) fn violation(&self, reason: String) -> AppError {
        self.halt(&reason);
        AppError::ConsistencyViolation {
            collection: self.name.clone(),
            reason,
        }
    }

    /// Describe how the stores disagree, if they do.
    pub fn check_consistency(&self) -> Option<String> {
        let vectors = self.len();
        let rows = self.table.row_count();

        if let Some(max) = self.table.max_position() {
            if max + 1 != rows as Position {
                return Some(format!(
                    "table positions are not dense: {rows} rows, highest position {max}"
                ));
            }
        }

        if vectors != rows {
            return Some(format!("index holds {vectors} vectors but table holds {rows} rows"));
        }

        None
    }

    pub fn status(&self) -> CollectionStatus {
        CollectionStatus {
            name: self.name.clone(),
            vectors: self.len(),
            rows: self.table.row_count(),
            halted: self.halted(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct CollectionStatus {
    pub name: String,
    pub vectors: usize,
    pub rows: usize,
    pub halted: Option<String>,
}

/// Name -> collection, fixed after startup.
#[derive(Default)]
pub struct CollectionRegistry {
    collections: IndexMap<String, Arc<Collection>>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every configured collection, creating missing tables.
    pub fn open(config: &Config, model_id: [u8; 32]) -> anyhow::Result<Self> {
        Self::open_with(config, model_id, OpenMode::ReadWrite)
    }

    pub fn open_with(config: &Config, model_id: [u8; 32], mode: OpenMode) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for collection in &config.collections {
            registry.insert(Collection::open(config, collection, model_id, mode)?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, collection: Collection) {
        self.collections
            .insert(collection.name().to_string(), Arc::new(collection));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Collection>, AppError> {
        self.collections
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::UnknownCollection(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Collection>> {
        self.collections.values()
    }

    /// True when no collection holds a vector or a row.
    pub fn all_empty(&self) -> bool {
        self.iter().all(|c| c.is_empty())
    }
}
