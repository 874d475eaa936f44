//! One-time population of empty collections from bulk sources.
//!
//! Runs only when every collection is empty. Each source is read and checked
//! before anything is written, and rows go through `DualStoreWriter` like any
//! other add.

use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};

use crate::{config::Config, metadata::MetadataRecord};

use super::{errors::AppError, registry::CollectionRegistry, writer::DualStoreWriter};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to read {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path} has no column '{column}'")]
    MissingColumn { path: PathBuf, column: String },
}

/// Tabular rows used to populate one collection.
pub trait BulkSource: Send + Sync {
    /// Read rows holding the given fields. Empty cells are left out of the record.
    fn read(&self, fields: &[String]) -> Result<Vec<MetadataRecord>, BootstrapError>;
}

/// CSV file with a header row. Extra columns are ignored.
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
    sample_size: Option<usize>,
    seed: Option<u64>,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sample_size: None,
            seed: None,
        }
    }

    /// Keep at most `size` rows, drawn uniformly at random.
    pub fn sample(mut self, size: Option<usize>, seed: Option<u64>) -> Self {
        self.sample_size = size;
        self.seed = seed;
        self
    }

    fn csv_error(&self, source: csv::Error) -> BootstrapError {
        BootstrapError::Csv {
            path: self.path.clone(),
            source,
        }
    }
}

impl BulkSource for CsvSource {
    fn read(&self, fields: &[String]) -> Result<Vec<MetadataRecord>, BootstrapError> {
        let mut reader = csv::Reader::from_path(&self.path).map_err(|e| self.csv_error(e))?;
        let headers = reader.headers().map_err(|e| self.csv_error(e))?.clone();

        let mut columns = Vec::with_capacity(fields.len());
        for field in fields {
            match headers.iter().position(|h| h.trim() == field) {
                Some(idx) => columns.push((field, idx)),
                None => {
                    return Err(BootstrapError::MissingColumn {
                        path: self.path.clone(),
                        column: field.clone(),
                    })
                }
            }
        }

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|e| self.csv_error(e))?;
            let record = columns
                .iter()
                .filter_map(|(field, idx)| {
                    row.get(*idx)
                        .filter(|v| !v.is_empty())
                        .map(|v| (field.to_string(), v.to_string()))
                })
                .collect();
            records.push(record);
        }

        Ok(match self.sample_size {
            Some(size) if size < records.len() => sample(records, size, self.seed),
            _ => records,
        })
    }
}

/// Pick `size` records at random, keeping source order.
fn sample(records: Vec<MetadataRecord>, size: usize, seed: Option<u64>) -> Vec<MetadataRecord> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let mut picked = rand::seq::index::sample(&mut rng, records.len(), size).into_vec();
    picked.sort_unstable();

    let mut records: Vec<Option<MetadataRecord>> = records.into_iter().map(Some).collect();
    picked
        .into_iter()
        .filter_map(|idx| records[idx].take())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BootstrapOutcome {
    /// False when a non-empty collection made the run a no-op
    pub ran: bool,
    /// Rows written per collection
    pub written: Vec<(String, usize)>,
}

pub struct Bootstrapper {
    registry: Arc<CollectionRegistry>,
    writer: Arc<DualStoreWriter>,
    batch_size: usize,
}

impl Bootstrapper {
    pub fn new(
        registry: Arc<CollectionRegistry>,
        writer: Arc<DualStoreWriter>,
        batch_size: usize,
    ) -> Self {
        Self {
            registry,
            writer,
            batch_size: batch_size.max(1),
        }
    }

    /// CSV sources for every configured collection that names one.
    pub fn sources_from_config(config: &Config) -> Vec<(String, Box<dyn BulkSource>)> {
        config
            .collections
            .iter()
            .filter_map(|c| {
                let path = c.source.as_ref()?;
                let source = CsvSource::new(config.resolve(path))
                    .sample(config.bootstrap.sample_size, config.bootstrap.seed);
                Some((c.name.clone(), Box::new(source) as Box<dyn BulkSource>))
            })
            .collect()
    }

    pub async fn run(
        &self,
        sources: Vec<(String, Box<dyn BulkSource>)>,
    ) -> Result<BootstrapOutcome, AppError> {
        if !self.registry.all_empty() {
            log::info!("collections already hold data, skipping bootstrap");
            return Ok(BootstrapOutcome::default());
        }

        // Every source must be readable and non-empty before the first write.
        let mut batches = Vec::with_capacity(sources.len());
        for (name, source) in sources {
            let collection = self.registry.get(&name)?;
            let fields = collection.table().fields().to_vec();

            let records = tokio::task::spawn_blocking(move || source.read(&fields))
                .await
                .map_err(|e| anyhow::anyhow!("source reader for '{name}' failed: {e}"))??;

            if records.is_empty() {
                return Err(AppError::EmptySource(name));
            }
            batches.push((name, records));
        }

        let mut outcome = BootstrapOutcome {
            ran: true,
            written: Vec::with_capacity(batches.len()),
        };

        for (name, records) in batches {
            let total = records.len();
            log::info!("bootstrapping '{name}' with {total} rows");

            let mut records = records.into_iter().peekable();
            let mut written = 0;
            while records.peek().is_some() {
                let chunk: Vec<_> = records.by_ref().take(self.batch_size).collect();
                written += chunk.len();
                self.writer.add_batch(&name, chunk).await?;
                log::debug!("'{name}': {written}/{total} rows written");
            }

            outcome.written.push((name, written));
        }

        log::info!("bootstrap finished");
        Ok(outcome)
    }
}
