//! In-memory document store for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{matches_filter, DocumentStore, Result, StoreError, StoredDocument};

/// Mock store that keeps collections in memory.
///
/// Starts disconnected, like a real client. Failure toggles make individual
/// operations fail so callers' error paths can be exercised.
#[derive(Default)]
pub struct MockStore {
    collections: RwLock<HashMap<String, Vec<StoredDocument>>>,
    connected: RwLock<bool>,
    fail_on_connect: RwLock<bool>,
    fail_on_insert: RwLock<bool>,
    fail_on_find: RwLock<bool>,
    omit_inserted_id: RwLock<bool>,
    connect_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_connect(&self, fail: bool) {
        *self.fail_on_connect.write().await = fail;
    }

    pub async fn set_fail_on_insert(&self, fail: bool) {
        *self.fail_on_insert.write().await = fail;
    }

    pub async fn set_fail_on_find(&self, fail: bool) {
        *self.fail_on_find.write().await = fail;
    }

    /// Make inserts succeed without reporting an id.
    pub async fn set_omit_inserted_id(&self, omit: bool) {
        *self.omit_inserted_id.write().await = omit;
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Store a document directly, bypassing connection state and failure toggles.
    pub async fn seed(&self, collection: &str, document: StoredDocument) -> String {
        self.store(collection, document).await
    }

    /// All documents in `collection`, in insertion order.
    pub async fn documents(&self, collection: &str) -> Vec<StoredDocument> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, Vec::len)
    }

    async fn store(&self, collection: &str, mut document: StoredDocument) -> String {
        let id = format!("{:024x}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        document.insert("_id".to_string(), Value::String(id.clone()));
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(document);
        id
    }

    async fn ensure_connected(&self) -> Result<()> {
        if *self.connected.read().await {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }
}

#[async_trait]
impl DocumentStore for MockStore {
    async fn connect(&self) -> bool {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_on_connect.read().await {
            return false;
        }
        *self.connected.write().await = true;
        true
    }

    async fn disconnect(&self) {
        *self.connected.write().await = false;
    }

    async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    async fn insert_one(
        &self,
        collection: &str,
        document: StoredDocument,
    ) -> Result<Option<String>> {
        self.ensure_connected().await?;
        if *self.fail_on_insert.read().await {
            return Err(StoreError::Query("Mock insert failure".to_string()));
        }
        if *self.omit_inserted_id.read().await {
            return Ok(None);
        }
        Ok(Some(self.store(collection, document).await))
    }

    async fn find_one(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<StoredDocument>> {
        self.ensure_connected().await?;
        if *self.fail_on_find.read().await {
            return Err(StoreError::Query("Mock find failure".to_string()));
        }
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|documents| {
                documents
                    .iter()
                    .find(|d| d.get(field).and_then(Value::as_str) == Some(value))
                    .cloned()
            }))
    }

    async fn find(
        &self,
        collection: &str,
        filter: &StoredDocument,
        limit: u32,
    ) -> Result<Vec<StoredDocument>> {
        self.ensure_connected().await?;
        if *self.fail_on_find.read().await {
            return Err(StoreError::Query("Mock find failure".to_string()));
        }
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|documents| {
                documents
                    .iter()
                    .filter(|d| matches_filter(d, filter))
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product(code: &str, brand: &str) -> StoredDocument {
        match json!({"product_code": code, "brand": brand}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let store = MockStore::new();

        let result = store.insert_one("products", product("P1", "Acme")).await;
        assert!(matches!(result, Err(StoreError::NotConnected)));

        assert!(store.connect().await);
        assert!(store.is_connected().await);
        assert!(store
            .insert_one("products", product("P1", "Acme"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_find_one_by_key() {
        let store = MockStore::new();
        store.connect().await;
        let id = store.seed("products", product("P1", "Acme")).await;

        let found = store
            .find_one("products", "product_code", "P1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["_id"], json!(id));
        assert!(store
            .find_one("products", "product_code", "P2")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_one("stocks", "product_code", "P1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_filters_and_limits() {
        let store = MockStore::new();
        store.connect().await;
        for (code, brand) in [("P1", "Acme"), ("P2", "Other"), ("P3", "Acme"), ("P4", "Acme")] {
            store.seed("products", product(code, brand)).await;
        }

        let mut filter = product("ignored", "Acme");
        filter.remove("product_code");

        let found = store.find("products", &filter, 2).await.unwrap();
        let codes: Vec<_> = found.iter().map(|d| d["product_code"].clone()).collect();
        assert_eq!(codes, vec![json!("P1"), json!("P3")]);
    }

    #[tokio::test]
    async fn test_failure_toggles() {
        let store = MockStore::new();
        store.set_fail_on_connect(true).await;
        assert!(!store.connect().await);
        assert_eq!(store.connect_calls(), 1);

        store.set_fail_on_connect(false).await;
        assert!(store.connect().await);

        store.set_omit_inserted_id(true).await;
        assert_eq!(
            store.insert_one("products", product("P1", "A")).await.unwrap(),
            None
        );
        assert_eq!(store.count("products").await, 0);

        store.set_fail_on_find(true).await;
        assert!(store.find("products", &StoredDocument::new(), 10).await.is_err());
    }
}
