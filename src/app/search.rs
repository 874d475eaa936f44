use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

use crate::{
    metadata::{MetadataError, MetadataRecord},
    semantic::{embed_with_timeout, Embedder, Position},
};

use super::{errors::AppError, registry::CollectionRegistry};

/// Column-oriented search result.
///
/// Row `i` of every column describes the same neighbor, nearest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub positions: Vec<Position>,
    pub distances: Vec<f32>,
    #[serde(flatten)]
    pub columns: IndexMap<String, Vec<Option<String>>>,
}

impl SearchResult {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn column(&self, field: &str) -> Option<&[Option<String>]> {
        self.columns.get(field).map(Vec::as_slice)
    }

    fn from_rows(rows: Vec<(Position, f32, MetadataRecord)>) -> Self {
        let mut columns: IndexMap<String, Vec<Option<String>>> = IndexMap::new();
        for (_, _, record) in &rows {
            for field in record.fields() {
                if !columns.contains_key(field) {
                    columns.insert(field.to_string(), Vec::with_capacity(rows.len()));
                }
            }
        }

        let mut positions = Vec::with_capacity(rows.len());
        let mut distances = Vec::with_capacity(rows.len());
        for (position, distance, record) in &rows {
            positions.push(*position);
            distances.push(*distance);
            for (field, values) in columns.iter_mut() {
                values.push(record.get(field).map(str::to_string));
            }
        }

        Self {
            positions,
            distances,
            columns,
        }
    }
}

/// Read path: embed the query, find neighbors, join them against the table.
pub struct SearchCoordinator {
    registry: Arc<CollectionRegistry>,
    embedder: Arc<dyn Embedder>,
    embed_timeout: Duration,
    top_n: usize,
}

impl SearchCoordinator {
    pub fn new(
        registry: Arc<CollectionRegistry>,
        embedder: Arc<dyn Embedder>,
        embed_timeout: Duration,
        top_n: usize,
    ) -> Self {
        Self {
            registry,
            embedder,
            embed_timeout,
            top_n,
        }
    }

    pub async fn search(&self, collection: &str, text: &str) -> Result<SearchResult, AppError> {
        self.search_top(collection, text, self.top_n).await
    }

    pub async fn search_top(
        &self,
        collection: &str,
        text: &str,
        top_n: usize,
    ) -> Result<SearchResult, AppError> {
        let col = self.registry.get(collection)?;

        let embedding =
            embed_with_timeout(self.embedder.as_ref(), text, self.embed_timeout).await?;

        let neighbors = col.search(&embedding, top_n)?;

        let mut rows = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            match col.table().get(neighbor.position) {
                Ok(record) => rows.push((neighbor.position, neighbor.distance, record)),
                Err(MetadataError::NotFound(position)) => {
                    log::warn!(
                        "collection '{}': position {position} has a vector but no row, skipping",
                        col.name()
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(SearchResult::from_rows(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> MetadataRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_columns_stay_in_lock_step() {
        let result = SearchResult::from_rows(vec![
            (3, 0.5, record(&[("title", "a"), ("city", "Moscow")])),
            (1, 0.7, record(&[("title", "b")])),
            (7, 0.9, record(&[("salary", "100"), ("title", "c")])),
        ]);

        assert_eq!(result.positions, vec![3, 1, 7]);
        assert_eq!(result.distances, vec![0.5, 0.7, 0.9]);
        assert_eq!(
            result.columns.keys().collect::<Vec<_>>(),
            vec!["title", "city", "salary"]
        );
        assert_eq!(
            result.column("title").unwrap(),
            &[Some("a".into()), Some("b".into()), Some("c".into())]
        );
        assert_eq!(result.column("city").unwrap(), &[Some("Moscow".into()), None, None]);
        assert_eq!(result.column("salary").unwrap(), &[None, None, Some("100".into())]);
    }

    #[test]
    fn test_empty_rows() {
        let result = SearchResult::from_rows(Vec::new());
        assert!(result.is_empty());
        assert!(result.columns.is_empty());
    }

    #[test]
    fn test_serializes_flat() {
        let result = SearchResult::from_rows(vec![(0, 0.0, record(&[("title", "x")]))]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["positions"], serde_json::json!([0]));
        assert_eq!(json["title"], serde_json::json!(["x"]));
    }
}
