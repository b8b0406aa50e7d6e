//! HTTP query API over stored documents.
//!
//! Endpoints (also mounted under `/api/v1`):
//! - `GET /health`: liveness
//! - `GET /products/:product_code`: one product
//! - `GET /products?limit&category&brand`: filtered product list
//! - `GET /stocks/:product_code`: stock level for a product
//! - `GET /prices/:product_code`: price for a product
//!
//! Errors are JSON objects of the form `{"detail": "..."}`.


use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::store::{DocumentStore, StoreError, StoredDocument, KEY_FIELD};
use crate::validation::Collection;

/// Shared state for axum handlers.
type AppState = Arc<dyn DocumentStore>;

/// Path prefix every route is also served under.
pub const API_PREFIX: &str = "/api/v1";

pub const DEFAULT_LIMIT: u32 = 10;
pub const MAX_LIMIT: u32 = 100;

/// Bind `address` and serve until `shutdown` resolves.
///
/// When the port is 0 the OS assigns one; the bound address is logged.
pub async fn serve<F>(store: Arc<dyn DocumentStore>, address: &str, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(address = %listener.local_addr()?, "Query API listening");

    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Build the axum router (separated for testing).
pub fn router(store: Arc<dyn DocumentStore>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .merge(routes())
        .nest(API_PREFIX, routes())
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(store)
}

fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/products", get(list_products))
        .route("/products/:product_code", get(get_product))
        .route("/stocks/:product_code", get(get_stock))
        .route("/prices/:product_code", get(get_price))
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    InvalidQuery(String),
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::InvalidQuery(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!(error = %e, "Document store query failed");
        ApiError::Internal
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Not Found".to_string())
}

async fn find_by_code(
    store: &AppState,
    collection: Collection,
    product_code: &str,
    missing: impl FnOnce() -> String,
) -> Result<Json<StoredDocument>, ApiError> {
    store
        .find_one(collection.as_str(), KEY_FIELD, product_code)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(missing()))
}

async fn get_product(
    State(store): State<AppState>,
    Path(product_code): Path<String>,
) -> Result<Json<StoredDocument>, ApiError> {
    find_by_code(&store, Collection::Products, &product_code, || {
        format!("Product not found: {}", product_code)
    })
    .await
}

async fn get_stock(
    State(store): State<AppState>,
    Path(product_code): Path<String>,
) -> Result<Json<StoredDocument>, ApiError> {
    find_by_code(&store, Collection::Stocks, &product_code, || {
        format!("Stock data not found for product: {}", product_code)
    })
    .await
}

async fn get_price(
    State(store): State<AppState>,
    Path(product_code): Path<String>,
) -> Result<Json<StoredDocument>, ApiError> {
    find_by_code(&store, Collection::Prices, &product_code, || {
        format!("Price data not found for product: {}", product_code)
    })
    .await
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<i64>,
    category: Option<String>,
    brand: Option<String>,
}

impl ListParams {
    fn limit(&self) -> Result<u32, ApiError> {
        match self.limit {
            None => Ok(DEFAULT_LIMIT),
            Some(limit) if (1..=i64::from(MAX_LIMIT)).contains(&limit) => Ok(limit as u32),
            Some(_) => Err(ApiError::InvalidQuery(format!(
                "limit must be between 1 and {}",
                MAX_LIMIT
            ))),
        }
    }

    fn filter(&self) -> StoredDocument {
        let mut filter = StoredDocument::new();
        if let Some(category) = &self.category {
            filter.insert("category".to_string(), Value::String(category.clone()));
        }
        if let Some(brand) = &self.brand {
            filter.insert("brand".to_string(), Value::String(brand.clone()));
        }
        filter
    }
}

async fn list_products(
    State(store): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<Vec<StoredDocument>>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::InvalidQuery(e.body_text()))?;
    let limit = params.limit()?;

    let products = store
        .find(Collection::Products.as_str(), &params.filter(), limit)
        .await?;
    Ok(Json(products))
}
