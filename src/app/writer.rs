//! The write path: add items to a collection while keeping the vector index
//! and the metadata table in lock-step.
//!
//! Per write, under the collection's writer lock and on a task of its own:
//! 1. read the next position from the index size
//! 2. embed every record (nothing is mutated if this fails)
//! 3. append the vectors, checking each assigned position
//! 4. insert the rows under the same positions
//! 5. persist the index and verify the durable count
//! 6. commit the table
//!
//! Any failure from step 3 on leaves the stores disagreeing. The collection is
//! halted and the caller gets `ConsistencyViolation`; `reconcile` repairs it.

use anyhow::bail;
use serde::Serialize;
use std::{fmt::Display, future::Future, ops::Range, sync::Arc, time::Duration};

use crate::{
    config::PersistStrategy,
    metadata::MetadataRecord,
    semantic::{embed_with_timeout, Embedder, Position},
};

use super::{
    errors::AppError,
    registry::{Collection, CollectionRegistry},
};

pub struct DualStoreWriter {
    registry: Arc<CollectionRegistry>,
    steps: WriteSteps,
}

/// Everything a write sequence needs besides the collection itself.
#[derive(Clone)]
struct WriteSteps {
    embedder: Arc<dyn Embedder>,
    embed_timeout: Duration,
    strategy: PersistStrategy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub collection: String,
    /// Vectors dropped from the end of the index
    pub truncated: usize,
    /// Rows whose vectors were missing and got embedded again
    pub reembedded: usize,
    pub size: usize,
}

impl DualStoreWriter {
    pub fn new(
        registry: Arc<CollectionRegistry>,
        embedder: Arc<dyn Embedder>,
        embed_timeout: Duration,
        strategy: PersistStrategy,
    ) -> Self {
        Self {
            registry,
            steps: WriteSteps {
                embedder,
                embed_timeout,
                strategy,
            },
        }
    }

    /// Add one record and return the position it was stored at.
    pub async fn add(&self, collection: &str, record: MetadataRecord) -> Result<Position, AppError> {
        let positions = self.add_batch(collection, vec![record]).await?;
        Ok(positions.start)
    }

    /// Add records under consecutive positions, as one locked write.
    pub async fn add_batch(
        &self,
        collection: &str,
        records: Vec<MetadataRecord>,
    ) -> Result<Range<Position>, AppError> {
        let col = self.registry.get(collection)?;

        for record in &records {
            check_fields(&col, record)?;
        }

        let steps = self.steps.clone();
        detach(async move { steps.write(&col, records).await }).await
    }

    /// Bring a collection's index back in line with its table and lift the halt.
    ///
    /// Extra vectors are truncated. Rows without a vector are embedded again
    /// from their stored text.
    pub async fn reconcile(&self, collection: &str) -> Result<ReconcileReport, AppError> {
        let col = self.registry.get(collection)?;

        let steps = self.steps.clone();
        detach(async move { steps.reconcile(&col).await }).await
    }
}

impl WriteSteps {
    async fn write(
        &self,
        col: &Arc<Collection>,
        records: Vec<MetadataRecord>,
    ) -> Result<Range<Position>, AppError> {
        let _guard = col.lock_writes().await;
        refuse_if_halted(col)?;

        let first = col.len();
        let count = records.len();
        if count == 0 {
            return Ok(first as Position..first as Position);
        }

        let mut embeddings = Vec::with_capacity(count);
        for record in &records {
            let text = col.projection().render(record);
            embeddings.push(self.embed(&text).await?);
        }
        check_embeddings(col, &embeddings)?;

        append_vectors(col, first, &embeddings)?;

        let rows: Vec<(Position, MetadataRecord)> = records
            .into_iter()
            .enumerate()
            .map(|(offset, record)| ((first + offset) as Position, record))
            .collect();
        run_blocking(col, move |col| {
            let mut rows = rows;
            if rows.len() == 1 {
                let (position, record) = rows.remove(0);
                col.table().insert_at(position, record)
            } else {
                col.table().bulk_insert(rows)
            }
        })
        .await
        .map_err(|err| {
            col.violation(format!(
                "metadata insert at {first}..{} failed after the index append: {err}",
                first + count
            ))
        })?;

        let strategy = self.strategy;
        run_blocking(col, move |col| persist_index(col, strategy, first))
            .await
            .map_err(|err| col.violation(format!("index persist failed: {err}")))?;

        run_blocking(col, |col| col.table().commit())
            .await
            .map_err(|err| col.violation(format!("table commit failed: {err}")))?;

        log::debug!(
            "collection '{}': wrote positions {first}..{}",
            col.name(),
            first + count
        );

        Ok(first as Position..(first + count) as Position)
    }

    async fn reconcile(&self, col: &Arc<Collection>) -> Result<ReconcileReport, AppError> {
        let _guard = col.lock_writes().await;
        let collection = col.name();

        let rows = col.table().row_count();
        if let Some(max) = col.table().max_position() {
            if max + 1 != rows as Position {
                return Err(AppError::ConsistencyViolation {
                    collection: collection.to_string(),
                    reason: format!(
                        "table positions are not dense ({rows} rows, highest {max}); repair the table first"
                    ),
                });
            }
        }

        let vectors = col.len();
        let mut report = ReconcileReport {
            collection: collection.to_string(),
            ..Default::default()
        };

        if vectors > rows {
            col.write_index(|index| index.truncate(rows));
            report.truncated = vectors - rows;
        } else if vectors < rows {
            let mut embeddings = Vec::with_capacity(rows - vectors);
            for position in vectors..rows {
                let record = col.table().get(position as Position)?;
                let text = col.projection().render(&record);
                embeddings.push(self.embed(&text).await?);
            }
            check_embeddings(col, &embeddings)?;
            append_vectors(col, vectors, &embeddings)?;
            report.reembedded = rows - vectors;
        }

        run_blocking(col, |col| -> anyhow::Result<()> {
            let dimensions = col.dimensions();
            let durable = col.storage().durable_len(col.model_id(), dimensions)?;
            if durable != col.len() {
                col.read_index(|index| col.storage().save(index, col.model_id()))?;
            }
            col.table().commit()?;
            Ok(())
        })
        .await
        .map_err(|err| AppError::Other(anyhow::anyhow!("reconcile of '{collection}' failed: {err}")))?;

        if let Some(reason) = col.check_consistency() {
            return Err(col.violation(reason));
        }

        col.clear_halt();
        report.size = col.len();

        log::warn!(
            "collection '{collection}' reconciled: {} truncated, {} re-embedded, size {}",
            report.truncated,
            report.reembedded,
            report.size
        );

        Ok(report)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        Ok(embed_with_timeout(self.embedder.as_ref(), text, self.embed_timeout).await?)
    }
}

/// Run a locked write sequence on its own task.
///
/// The sequence awaits between store steps. Dropping the caller's future
/// (a disconnected HTTP client, a timeout) must not stop it halfway, so the
/// task owns the collection and the writer lock until the last step is done.
async fn detach<T, F>(sequence: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, AppError>> + Send + 'static,
{
    match tokio::spawn(sequence).await {
        Ok(result) => result,
        Err(err) => Err(AppError::Other(anyhow::anyhow!("write task failed: {err}"))),
    }
}

fn refuse_if_halted(col: &Collection) -> Result<(), AppError> {
    match col.halted() {
        Some(reason) => Err(AppError::CollectionHalted {
            collection: col.name().to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

fn check_fields(col: &Collection, record: &MetadataRecord) -> Result<(), AppError> {
    let known = col.table().fields();
    match record.fields().find(|f| !known.iter().any(|k| k == f)) {
        Some(field) => Err(AppError::InvalidRecord(format!(
            "unknown field '{field}' for collection '{}'",
            col.name()
        ))),
        None => Ok(()),
    }
}

/// Reject the whole batch before anything is appended.
fn check_embeddings(col: &Collection, embeddings: &[Vec<f32>]) -> Result<(), AppError> {
    let expected = col.dimensions();
    for embedding in embeddings {
        if embedding.len() != expected {
            return Err(AppError::DimensionMismatch {
                expected,
                got: embedding.len(),
            });
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(AppError::InvalidRecord(
                "embedder returned NaN or infinite components".to_string(),
            ));
        }
    }
    Ok(())
}

fn append_vectors(col: &Collection, first: usize, embeddings: &[Vec<f32>]) -> Result<(), AppError> {
    let outcome = col.write_index(|index| -> Result<(), String> {
        if index.len() != first {
            return Err(format!(
                "index grew from {first} to {} while the writer lock was held",
                index.len()
            ));
        }
        for (offset, embedding) in embeddings.iter().enumerate() {
            let expected = (first + offset) as Position;
            let got = index.append(embedding).map_err(|e| e.to_string())?;
            if got != expected {
                return Err(format!("append returned position {got}, expected {expected}"));
            }
        }
        Ok(())
    });

    outcome.map_err(|reason| col.violation(reason))
}

/// Write the index to disk and check that the file holds exactly what memory holds.
fn persist_index(col: &Collection, strategy: PersistStrategy, from: usize) -> anyhow::Result<()> {
    let dimensions = col.dimensions();
    let expected = col.len();

    match strategy {
        PersistStrategy::Append => {
            col.read_index(|index| col.storage().append(index, from, col.model_id()))?;
        }
        PersistStrategy::Rewrite => {
            col.read_index(|index| col.storage().save(index, col.model_id()))?;
            let reloaded = col.storage().load(col.model_id(), dimensions)?;
            if reloaded.len() != expected {
                bail!(
                    "reloaded index holds {} vectors, expected {expected}",
                    reloaded.len()
                );
            }
            col.write_index(|index| *index = reloaded);
        }
    }

    let durable = col.storage().durable_len(col.model_id(), dimensions)?;
    if durable != expected {
        bail!("durable index holds {durable} vectors, expected {expected}");
    }

    Ok(())
}

/// Run blocking store I/O off the async workers.
async fn run_blocking<T, E, F>(col: &Arc<Collection>, f: F) -> Result<T, String>
where
    T: Send + 'static,
    E: Display,
    F: FnOnce(&Collection) -> Result<T, E> + Send + 'static,
{
    let col = col.clone();
    match tokio::task::spawn_blocking(move || f(&col).map_err(|e| e.to_string())).await {
        Ok(result) => result,
        Err(err) => Err(format!("blocking task failed: {err}")),
    }
}
