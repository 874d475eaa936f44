use std::sync::atomic::Ordering;

use super::{record, TestEnv, COLLECTION};
use crate::{app::errors::AppError, semantic::EmbeddingError};

#[tokio::test]
async fn test_empty_collection_returns_empty_result() {
    let env = TestEnv::new();

    let result = env.search.search(COLLECTION, "rust").await.unwrap();

    assert!(result.is_empty());
    assert!(result.columns.is_empty());
}

#[tokio::test]
async fn test_results_are_nearest_first_and_columns_in_lock_step() {
    let env = TestEnv::new();
    let docs = [
        record(&[("title", "python only"), ("body", "python python")]),
        record(&[("title", "rust once")]),
        record(&[("title", "rust twice"), ("body", "rust")]),
        record(&[("title", "java"), ("body", "java java")]),
    ];
    for doc in docs {
        env.writer.add(COLLECTION, doc).await.unwrap();
    }

    let result = env.search.search_top(COLLECTION, "rust rust", 10).await.unwrap();

    // k above the index size returns everything
    assert_eq!(result.len(), 4);
    assert_eq!(result.positions, vec![2, 1, 0, 3]);
    assert!(result.distances.windows(2).all(|w| w[0] <= w[1]));

    assert_eq!(
        result.column("title").unwrap(),
        &[
            Some("rust twice".to_string()),
            Some("rust once".to_string()),
            Some("python only".to_string()),
            Some("java".to_string()),
        ]
    );
    assert_eq!(
        result.column("body").unwrap(),
        &[
            Some("rust".to_string()),
            None,
            Some("python python".to_string()),
            Some("java java".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_equal_distances_break_ties_by_position() {
    let env = TestEnv::new();
    for title in ["golang a", "golang b", "golang c"] {
        env.writer
            .add(COLLECTION, record(&[("title", title)]))
            .await
            .unwrap();
    }

    let result = env.search.search_top(COLLECTION, "golang", 2).await.unwrap();
    assert_eq!(result.positions, vec![0, 1]);
    assert_eq!(result.distances, vec![0.0, 0.0]);
}

#[tokio::test]
async fn test_default_top_n_comes_from_config() {
    let env = TestEnv::new();
    for i in 0..5 {
        let title = format!("doc {i}");
        env.writer
            .add(COLLECTION, record(&[("title", title.as_str())]))
            .await
            .unwrap();
    }

    let result = env.search.search(COLLECTION, "anything").await.unwrap();
    assert_eq!(result.len(), env.config.search.top_n);
}

#[tokio::test]
async fn test_missing_row_is_skipped() {
    let env = TestEnv::new();
    env.writer
        .add(COLLECTION, record(&[("title", "rust")]))
        .await
        .unwrap();

    env.store.fail_insert.store(true, Ordering::SeqCst);
    env.writer
        .add(COLLECTION, record(&[("title", "rust rust")]))
        .await
        .unwrap_err();

    let result = env.search.search(COLLECTION, "rust rust").await.unwrap();
    assert_eq!(result.positions, vec![0]);
    assert_eq!(result.column("title").unwrap(), &[Some("rust".to_string())]);
}

#[tokio::test]
async fn test_embedder_failures() {
    let env = TestEnv::new();

    env.embedder.fail.store(true, Ordering::SeqCst);
    let err = env.search.search(COLLECTION, "rust").await.unwrap_err();
    assert!(matches!(err, AppError::EmbeddingUnavailable(_)));

    env.embedder.fail.store(false, Ordering::SeqCst);
    env.embedder.stall.store(true, Ordering::SeqCst);
    let err = env.search.search(COLLECTION, "rust").await.unwrap_err();
    assert!(matches!(err, AppError::EmbeddingUnavailable(EmbeddingError::Timeout(_))));
}

#[tokio::test]
async fn test_query_dimension_mismatch() {
    let env = TestEnv::new();
    env.writer
        .add(COLLECTION, record(&[("title", "rust")]))
        .await
        .unwrap();

    env.embedder.wrong_dimensions.store(true, Ordering::SeqCst);
    let err = env.search.search(COLLECTION, "rust").await.unwrap_err();
    assert!(matches!(err, AppError::DimensionMismatch { .. }));
}

#[tokio::test]
async fn test_unknown_collection() {
    let env = TestEnv::new();
    let err = env.search.search("nope", "rust").await.unwrap_err();
    assert!(matches!(err, AppError::UnknownCollection(_)));
}

#[tokio::test]
async fn test_empty_field_reads_the_same_after_restart() {
    let env = TestEnv::new();
    env.writer
        .add(COLLECTION, record(&[("title", "rust"), ("body", "")]))
        .await
        .unwrap();

    let before = env.search.search(COLLECTION, "rust").await.unwrap();
    assert_eq!(before.column("body"), None);

    let env = env.reopen();
    let after = env.search.search(COLLECTION, "rust").await.unwrap();
    assert_eq!(before, after);
}
