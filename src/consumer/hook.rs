//! Per-collection message processing.
//!
//! A hook turns one decoded payload into a stored document. Its error type
//! decides what happens to the delivery: validation errors are dead-lettered,
//! everything else is requeued.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::store::{DocumentStore, StoreError};
use crate::validation::{validate_str, Collection, Document, UnknownCollection};

/// Errors raised while processing one message.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Configuration error: {0}")]
    Configuration(#[from] UnknownCollection),

    #[error("Document store unavailable")]
    StoreUnavailable,

    #[error("Payload does not name a target collection")]
    MissingTargetCollection,

    #[error("Document store returned no id for the inserted document")]
    InsertFailed,

    #[error("Document store error: {0}")]
    Store(#[from] StoreError),
}

impl ProcessError {
    /// Whether the message itself is bad, as opposed to the environment.
    pub fn is_validation(&self) -> bool {
        matches!(self, ProcessError::Validation(_))
    }
}

/// Processes decoded payloads for one collection.
#[async_trait]
pub trait ProcessingHook: Send + Sync {
    fn collection(&self) -> Collection;

    async fn process(&self, payload: &str) -> Result<(), ProcessError>;
}

/// Where a validated document is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Always the named collection.
    Fixed(Collection),
    /// The collection named by the payload's `collection` field.
    FromPayload,
}

/// Validates payloads against one collection's schema and stores them.
pub struct CollectionHook {
    collection: Collection,
    target: Target,
    store: Arc<dyn DocumentStore>,
}

impl CollectionHook {
    pub fn new(collection: Collection, target: Target, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            collection,
            target,
            store,
        }
    }

    /// Products are always written to the `products` collection.
    pub fn products(store: Arc<dyn DocumentStore>) -> Self {
        Self::new(
            Collection::Products,
            Target::Fixed(Collection::Products),
            store,
        )
    }

    /// Stock updates are written to the collection named in the payload.
    pub fn stocks(store: Arc<dyn DocumentStore>) -> Self {
        Self::new(Collection::Stocks, Target::FromPayload, store)
    }

    /// Price updates are written to the collection named in the payload.
    pub fn prices(store: Arc<dyn DocumentStore>) -> Self {
        Self::new(Collection::Prices, Target::FromPayload, store)
    }

    pub fn for_collection(collection: Collection, store: Arc<dyn DocumentStore>) -> Self {
        match collection {
            Collection::Products => Self::products(store),
            Collection::Stocks => Self::stocks(store),
            Collection::Prices => Self::prices(store),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    async fn ensure_store(&self) -> Result<(), ProcessError> {
        if self.store.is_connected().await || self.store.connect().await {
            Ok(())
        } else {
            Err(ProcessError::StoreUnavailable)
        }
    }

    fn target_collection(&self, document: &Document) -> Result<String, ProcessError> {
        match &self.target {
            Target::Fixed(collection) => Ok(collection.as_str().to_string()),
            Target::FromPayload => document
                .target_collection()
                .map(str::to_string)
                .ok_or(ProcessError::MissingTargetCollection),
        }
    }
}

fn log_document(document: &Document, target: &str) {
    match document {
        Document::Product(p) => debug!(
            product_code = %p.product_code,
            name = %p.name,
            brand = %p.brand,
            target = %target,
            "Storing product"
        ),
        Document::Stock(s) => debug!(
            product_code = %s.product_code,
            warehouse_id = %s.warehouse_id,
            quantity = s.quantity,
            target = %target,
            "Storing stock level"
        ),
        Document::Price(p) => debug!(
            product_code = %p.product_code,
            currency = %p.currency,
            final_price = %p.final_price,
            target = %target,
            "Storing price"
        ),
    }
}

#[async_trait]
impl ProcessingHook for CollectionHook {
    fn collection(&self) -> Collection {
        self.collection
    }

    async fn process(&self, payload: &str) -> Result<(), ProcessError> {
        let document = validate_str(payload, self.collection.as_str())?
            .into_result()
            .map_err(ProcessError::Validation)?;

        self.ensure_store().await?;

        let target = self.target_collection(&document)?;
        log_document(&document, &target);

        let product_code = document.product_code().to_string();
        let id = self
            .store
            .insert_one(&target, document.into_map())
            .await?
            .ok_or(ProcessError::InsertFailed)?;

        info!(
            collection = %self.collection,
            target = %target,
            product_code = %product_code,
            id = %id,
            "Stored document"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockStore;
    use serde_json::json;

    fn stock_payload(collection: Option<&str>) -> String {
        let mut payload = json!({
            "product_code": "P1",
            "warehouse_id": "WH-1",
            "quantity": 7,
            "location": "A1"
        });
        if let Some(name) = collection {
            payload["collection"] = json!(name);
        }
        payload.to_string()
    }

    fn product_payload() -> String {
        json!({
            "product_code": "P1",
            "name": "Kettle",
            "description": "Steel kettle",
            "category": "Kitchen",
            "brand": "Acme"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_product_stored_in_products_collection() {
        let store = Arc::new(MockStore::new());
        let hook = CollectionHook::products(store.clone());

        hook.process(&product_payload()).await.unwrap();

        assert_eq!(store.count("products").await, 1);
        assert_eq!(store.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_store_connected_once() {
        let store = Arc::new(MockStore::new());
        let hook = CollectionHook::products(store.clone());

        hook.process(&product_payload()).await.unwrap();
        hook.process(&product_payload()).await.unwrap();

        assert_eq!(store.connect_calls(), 1);
        assert_eq!(store.count("products").await, 2);
    }

    #[tokio::test]
    async fn test_stock_stored_in_payload_collection() {
        let store = Arc::new(MockStore::new());
        let hook = CollectionHook::stocks(store.clone());

        hook.process(&stock_payload(Some("stock_levels"))).await.unwrap();

        let stored = store.documents("stock_levels").await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["collection"], json!("stock_levels"));
        assert_eq!(store.count("stocks").await, 0);
    }

    #[tokio::test]
    async fn test_missing_target_collection_is_not_validation() {
        let store = Arc::new(MockStore::new());
        let hook = CollectionHook::stocks(store.clone());

        let err = hook.process(&stock_payload(None)).await.unwrap_err();

        assert!(matches!(err, ProcessError::MissingTargetCollection));
        assert!(!err.is_validation());
    }

    #[tokio::test]
    async fn test_invalid_payload_raises_validation_without_touching_store() {
        let store = Arc::new(MockStore::new());
        let hook = CollectionHook::prices(store.clone());

        let err = hook.process(r#"{"product_code": "P1"}"#).await.unwrap_err();

        assert!(err.is_validation());
        match err {
            ProcessError::Validation(errors) => {
                assert_eq!(errors[0], "Missing required field: currency")
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(store.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_store() {
        let store = Arc::new(MockStore::new());
        store.set_fail_on_connect(true).await;
        let hook = CollectionHook::products(store);

        let err = hook.process(&product_payload()).await.unwrap_err();
        assert!(matches!(err, ProcessError::StoreUnavailable));
    }

    #[tokio::test]
    async fn test_insert_errors_are_transient() {
        let store = Arc::new(MockStore::new());
        store.connect().await;
        let hook = CollectionHook::products(store.clone());

        store.set_fail_on_insert(true).await;
        let err = hook.process(&product_payload()).await.unwrap_err();
        assert!(matches!(err, ProcessError::Store(_)));
        assert!(!err.is_validation());

        store.set_fail_on_insert(false).await;
        store.set_omit_inserted_id(true).await;
        let err = hook.process(&product_payload()).await.unwrap_err();
        assert!(matches!(err, ProcessError::InsertFailed));
    }

    #[test]
    fn test_for_collection_targets() {
        let store: Arc<dyn DocumentStore> = Arc::new(MockStore::new());
        assert_eq!(
            CollectionHook::for_collection(Collection::Products, store.clone()).target(),
            &Target::Fixed(Collection::Products)
        );
        assert_eq!(
            CollectionHook::for_collection(Collection::Prices, store).target(),
            &Target::FromPayload
        );
    }
}
