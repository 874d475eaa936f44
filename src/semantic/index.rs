//! Flat in-memory vector index with exhaustive L2 search.
//!
//! Vectors live in one contiguous buffer in position order. Appending only
//! grows the buffer, so a stored vector never changes its position.

use std::cmp::Ordering;

/// Dense, zero-based slot of a vector in the index.
pub type Position = u64;

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: Position,
    /// Squared Euclidean distance to the query
    pub distance: f32,
}

/// Exhaustive nearest-neighbor index over fixed-dimension vectors.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    /// Row-major storage, `len * dimensions` floats
    data: Vec<f32>,
    dimensions: usize,
}

impl VectorIndex {
    /// Create a new empty index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            data: Vec::new(),
            dimensions,
        }
    }

    /// Create an index with room for `capacity` vectors.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(dimensions.saturating_mul(capacity)),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of stored vectors, which is also the next position to be assigned.
    pub fn len(&self) -> usize {
        if self.dimensions == 0 {
            return 0;
        }
        self.data.len() / self.dimensions
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a vector and return the position it was stored at.
    ///
    /// The index is left untouched on error.
    pub fn append(&mut self, embedding: &[f32]) -> Result<Position, IndexError> {
        self.check_dimensions(embedding)?;
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::NonFinite);
        }

        let position = self.len() as Position;
        self.data.extend_from_slice(embedding);
        Ok(position)
    }

    /// Vector stored at `position`.
    pub fn get(&self, position: Position) -> Option<&[f32]> {
        let start = usize::try_from(position).ok()?.checked_mul(self.dimensions)?;
        self.data.get(start..start + self.dimensions)
    }

    /// Iterate over stored vectors in position order.
    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact panics on 0, an index without dimensions holds nothing
        self.data.chunks_exact(self.dimensions.max(1))
    }

    /// Return the `k` nearest vectors by squared L2 distance.
    ///
    /// Results are ordered by ascending distance, ties by ascending position.
    /// An empty index yields an empty list.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        self.check_dimensions(query)?;

        if k == 0 || self.is_empty() {
            return Ok(vec![]);
        }

        let mut results: Vec<Neighbor> = self
            .iter()
            .enumerate()
            .map(|(position, target)| Neighbor {
                position: position as Position,
                distance: squared_l2(query, target),
            })
            .collect();

        if k < results.len() {
            results.select_nth_unstable_by(k - 1, rank);
            results.truncate(k);
        }
        results.sort_unstable_by(rank);

        Ok(results)
    }

    /// Drop every vector at or after `len`. Used by reconciliation only.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len.saturating_mul(self.dimensions));
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }
}

fn rank(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then(a.position.cmp(&b.position))
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Vector contains NaN or infinite components")]
    NonFinite,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(results: &[Neighbor]) -> Vec<Position> {
        results.iter().map(|r| r.position).collect()
    }

    #[test]
    fn test_new_index() {
        let index = VectorIndex::new(384);
        assert_eq!(index.dimensions(), 384);
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_append_assigns_dense_positions() {
        let mut index = VectorIndex::new(3);

        assert_eq!(index.append(&[1.0, 0.0, 0.0]).unwrap(), 0);
        assert_eq!(index.append(&[0.0, 1.0, 0.0]).unwrap(), 1);
        assert_eq!(index.append(&[0.0, 0.0, 1.0]).unwrap(), 2);

        assert_eq!(index.len(), 3);
        assert_eq!(index.get(1).unwrap(), &[0.0, 1.0, 0.0]);
        assert!(index.get(3).is_none());
    }

    #[test]
    fn test_append_dimension_mismatch_leaves_size() {
        let mut index = VectorIndex::new(3);
        index.append(&[1.0, 0.0, 0.0]).unwrap();

        let result = index.append(&[1.0, 0.0, 0.0, 0.0]);
        assert!(matches!(
            result,
            Err(IndexError::DimensionMismatch { expected: 3, got: 4 })
        ));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_append_rejects_nan() {
        let mut index = VectorIndex::new(2);
        let result = index.append(&[f32::NAN, 0.0]);
        assert!(matches!(result, Err(IndexError::NonFinite)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_search_empty_index() {
        let index = VectorIndex::new(3);
        for k in [0, 1, 10] {
            assert!(index.search(&[1.0, 0.0, 0.0], k).unwrap().is_empty());
        }
    }

    #[test]
    fn test_search_nearest_first() {
        let mut index = VectorIndex::new(2);
        index.append(&[10.0, 10.0]).unwrap();
        index.append(&[1.0, 1.0]).unwrap();
        index.append(&[3.0, 3.0]).unwrap();

        let results = index.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(positions(&results), vec![1, 2]);
        assert!((results[0].distance - 2.0).abs() < f32::EPSILON);
        assert!((results[1].distance - 18.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_search_k_larger_than_size_returns_all_sorted() {
        let mut index = VectorIndex::new(1);
        for v in [5.0, -1.0, 2.0, 0.5] {
            index.append(&[v]).unwrap();
        }

        let results = index.search(&[0.0], 100).unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(positions(&results), vec![3, 1, 2, 0]);
        assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_search_ties_broken_by_position() {
        let mut index = VectorIndex::new(2);
        index.append(&[0.0, 1.0]).unwrap();
        index.append(&[1.0, 0.0]).unwrap();
        index.append(&[0.0, -1.0]).unwrap();
        index.append(&[-1.0, 0.0]).unwrap();

        let results = index.search(&[0.0, 0.0], 4).unwrap();
        assert_eq!(positions(&results), vec![0, 1, 2, 3]);

        // the partial selection path must keep the same tie order
        let results = index.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(positions(&results), vec![0, 1]);
    }

    #[test]
    fn test_search_dimension_mismatch() {
        let mut index = VectorIndex::new(3);
        index.append(&[1.0, 0.0, 0.0]).unwrap();
        let result = index.search(&[1.0, 0.0], 1);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_truncate() {
        let mut index = VectorIndex::new(2);
        for i in 0..5 {
            index.append(&[i as f32, 0.0]).unwrap();
        }

        index.truncate(3);
        assert_eq!(index.len(), 3);
        assert_eq!(index.append(&[9.0, 9.0]).unwrap(), 3);

        // truncating beyond the size is a no-op
        index.truncate(10);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_iter_in_position_order() {
        let mut index = VectorIndex::new(2);
        index.append(&[1.0, 2.0]).unwrap();
        index.append(&[3.0, 4.0]).unwrap();

        let all: Vec<&[f32]> = index.iter().collect();
        assert_eq!(all, vec![&[1.0, 2.0][..], &[3.0, 4.0][..]]);
    }
}
