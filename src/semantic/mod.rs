//! Vector side of a collection.
//!
//! # Architecture
//!
//! - `embeddings`: client for the external embedding service
//! - `index`: flat in-memory vector index with exhaustive L2 search
//! - `storage`: binary file I/O for index persistence
//! - `projection`: record -> text templates fed to the embedder

pub mod embeddings;
mod index;
mod projection;
mod storage;

pub use embeddings::{embed_with_timeout, Embedder, EmbeddingError, HttpEmbedder};
pub use index::{IndexError, Neighbor, Position, VectorIndex};
pub use projection::{ProjectionError, TextProjection};
pub use storage::{temp_path_for, VectorStorage, VectorStorageError};
