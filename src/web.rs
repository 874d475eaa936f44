use crate::{
    app::{errors::AppError, registry::CollectionStatus, search::SearchResult, AppService},
    config::Config,
    metadata::MetadataRecord,
    semantic::Position,
};
use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
pub struct SharedState {
    service: Arc<AppService>,
    config: Arc<Config>,
}

impl SharedState {
    pub fn new(service: Arc<AppService>, config: Arc<Config>) -> Self {
        Self { service, config }
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/collections", get(collections))
        .route("/api/:collection/search", get(search))
        .route("/api/:collection/add", post(add))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(Arc::new(state))
}

/// Serve until Ctrl+C or SIGTERM.
pub async fn serve(state: SharedState, addr: &str) -> anyhow::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    log::info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    log::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("shutting down");
}

#[derive(Debug)]
struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::UnknownCollection(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidRecord(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
            AppError::EmbeddingUnavailable(_) => {
                log::warn!("{}", self.0);
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::CollectionHalted { .. } => StatusCode::CONFLICT,
            err if err.is_fatal() => {
                log::error!("collection is inconsistent: {err:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::ConsistencyViolation { .. }
            | AppError::DuplicateKey(_)
            | AppError::EmptySource(_)
            | AppError::Source(_)
            | AppError::Storage(_)
            | AppError::Metadata(_)
            | AppError::Other(_) => {
                log::error!("{:?}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(json!({"error": self.0.to_string(), "success": false})),
        )
            .into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"success": true}))
}

#[derive(Debug, Serialize)]
pub struct CollectionsResponse {
    pub success: bool,
    pub collections: Vec<CollectionStatus>,
}

async fn collections(State(state): State<Arc<SharedState>>) -> Json<CollectionsResponse> {
    Json(CollectionsResponse {
        success: true,
        collections: state.service.status(),
    })
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub text: String,
    pub top_n: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub success: bool,
    #[serde(flatten)]
    pub result: SearchResult,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Path(collection): Path<String>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, HttpError> {
    log::debug!("search '{collection}': {params:?}");

    let result = match params.top_n {
        Some(top_n) => {
            state
                .service
                .search_top(&collection, &params.text, top_n)
                .await?
        }
        None => state.service.search(&collection, &params.text).await?,
    };

    Ok(Json(SearchResponse {
        success: true,
        result,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddResponse {
    pub success: bool,
    pub position: Position,
}

async fn add(
    State(state): State<Arc<SharedState>>,
    Path(collection): Path<String>,
    Json(payload): Json<IndexMap<String, String>>,
) -> Result<Json<AddResponse>, HttpError> {
    log::debug!("add '{collection}': {} fields", payload.len());

    check_bounds(&state.config, &collection, &payload)?;

    let record: MetadataRecord = payload.into_iter().collect();
    let position = state.service.add(&collection, record).await?;

    Ok(Json(AddResponse {
        success: true,
        position,
    }))
}

/// Check field lengths (in characters) against the collection's configured bounds.
fn check_bounds(
    config: &Config,
    collection: &str,
    payload: &IndexMap<String, String>,
) -> Result<(), AppError> {
    let collection_cfg = config
        .collection(collection)
        .ok_or_else(|| AppError::UnknownCollection(collection.to_string()))?;

    for field in &collection_cfg.fields {
        let bounds = collection_cfg.bounds(field);
        let len = payload.get(field).map_or(0, |v| v.chars().count());
        if len < bounds.min || len > bounds.max {
            return Err(AppError::InvalidRecord(format!(
                "field '{field}' must be {}..={} characters long, got {len}",
                bounds.min, bounds.max
            )));
        }
    }

    Ok(())
}
