//! MongoDB document store.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document as BsonDocument};
use mongodb::{Client, Database};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use super::{DocumentStore, Result, StoreError, StoredDocument};
use crate::config::StoreConfig;
use crate::utils::bootstrap::connect_with_retry;
use crate::utils::retry::fixed_backoff;

/// MongoDB-backed [`DocumentStore`].
///
/// The client is established lazily by `connect()` and shared by every
/// caller through an internal lock. Concurrent `connect()` calls are
/// serialized; readers are only blocked while a new client is installed.
pub struct MongoStore {
    uri: String,
    database_name: String,
    connect_attempts: usize,
    connect_retry_delay: Duration,
    client: RwLock<Option<Client>>,
    connecting: Mutex<()>,
}

impl MongoStore {
    pub fn new(
        uri: impl Into<String>,
        database_name: impl Into<String>,
        connect_attempts: usize,
        connect_retry_delay: Duration,
    ) -> Self {
        Self {
            uri: uri.into(),
            database_name: database_name.into(),
            connect_attempts,
            connect_retry_delay,
            client: RwLock::new(None),
            connecting: Mutex::new(()),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(
            &config.uri,
            &config.database,
            config.connect_attempts,
            config.connect_retry_delay(),
        )
    }

    async fn database(&self) -> Result<Database> {
        self.client
            .read()
            .await
            .as_ref()
            .map(|client| client.database(&self.database_name))
            .ok_or(StoreError::NotConnected)
    }

    async fn open_client(uri: &str, database: &str) -> Result<Client> {
        let client = Client::with_uri_str(uri).await?;
        client
            .database(database)
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(client)
    }
}

/// Convert a JSON object to BSON for storage.
fn to_bson(document: &StoredDocument) -> Result<BsonDocument> {
    bson::to_document(document).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Convert a stored BSON document to JSON, rendering an ObjectId `_id` as hex.
fn to_json(mut document: BsonDocument) -> StoredDocument {
    if let Some(Bson::ObjectId(id)) = document.get("_id") {
        let hex = id.to_hex();
        document.insert("_id", hex);
    }
    match Bson::Document(document).into_relaxed_extjson() {
        serde_json::Value::Object(map) => map,
        _ => StoredDocument::new(),
    }
}

/// Render an inserted id as a string.
fn id_string(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn connect(&self) -> bool {
        let _connecting = self.connecting.lock().await;
        if self.client.read().await.is_some() {
            return true;
        }

        let uri = self.uri.clone();
        let database = self.database_name.clone();
        let result = connect_with_retry(
            "MongoDB",
            fixed_backoff(self.connect_retry_delay, self.connect_attempts),
            || Self::open_client(&uri, &database),
        )
        .await;

        match result {
            Ok(client) => {
                info!(database = %self.database_name, "Connected to MongoDB");
                *self.client.write().await = Some(client);
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to MongoDB");
                false
            }
        }
    }

    async fn disconnect(&self) {
        if let Some(client) = self.client.write().await.take() {
            client.shutdown().await;
            info!("Disconnected from MongoDB");
        }
    }

    async fn is_connected(&self) -> bool {
        self.client.read().await.is_some()
    }

    async fn insert_one(
        &self,
        collection: &str,
        document: StoredDocument,
    ) -> Result<Option<String>> {
        let document = to_bson(&document)?;
        let result = self
            .database()
            .await?
            .collection::<BsonDocument>(collection)
            .insert_one(document)
            .await?;

        let id = id_string(&result.inserted_id);
        debug!(collection = %collection, id = %id, "Inserted document");
        Ok(Some(id))
    }

    async fn find_one(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<StoredDocument>> {
        let found = self
            .database()
            .await?
            .collection::<BsonDocument>(collection)
            .find_one(doc! { field: value })
            .await?;

        Ok(found.map(to_json))
    }

    async fn find(
        &self,
        collection: &str,
        filter: &StoredDocument,
        limit: u32,
    ) -> Result<Vec<StoredDocument>> {
        let filter = to_bson(filter)?;
        let documents: Vec<BsonDocument> = self
            .database()
            .await?
            .collection::<BsonDocument>(collection)
            .find(filter)
            .limit(i64::from(limit))
            .await?
            .try_collect()
            .await?;

        Ok(documents.into_iter().map(to_json).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;
    use serde_json::json;

    #[test]
    fn test_to_json_renders_object_id_as_hex() {
        let oid = ObjectId::new();
        let document = doc! {
            "_id": oid,
            "product_code": "P1",
            "quantity": 12_i64,
            "base_price": 9.5,
        };

        let json = to_json(document);

        assert_eq!(json["_id"], json!(oid.to_hex()));
        assert_eq!(json["product_code"], json!("P1"));
        assert_eq!(json["quantity"], json!(12));
        assert_eq!(json["base_price"], json!(9.5));
    }

    #[test]
    fn test_to_bson_keeps_nested_fields() {
        let document = match json!({"product_code": "P1", "dims": {"w": 2}}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };

        let bson = to_bson(&document).unwrap();
        assert_eq!(bson.get_str("product_code").unwrap(), "P1");
        assert!(matches!(
            bson.get_document("dims").unwrap().get("w"),
            Some(Bson::Int32(2)) | Some(Bson::Int64(2))
        ));
    }

    #[test]
    fn test_id_string() {
        let oid = ObjectId::new();
        assert_eq!(id_string(&Bson::ObjectId(oid)), oid.to_hex());
        assert_eq!(id_string(&Bson::String("abc".into())), "abc");
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let store = MongoStore::new(
            "mongodb://localhost:27017",
            "data_ingestion",
            1,
            Duration::from_millis(1),
        );

        assert!(!store.is_connected().await);
        assert!(matches!(
            store.find_one("products", "product_code", "P1").await,
            Err(StoreError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_readers_not_blocked_while_connecting() {
        let store = std::sync::Arc::new(MongoStore::new(
            "mongodb://127.0.0.1:1/?serverSelectionTimeoutMS=2000",
            "data_ingestion",
            2,
            Duration::from_secs(1),
        ));

        let connecting = tokio::spawn({
            let store = store.clone();
            async move { store.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let connected = tokio::time::timeout(Duration::from_millis(500), store.is_connected())
            .await
            .expect("is_connected blocked behind connect");
        assert!(!connected);
        assert!(matches!(
            tokio::time::timeout(
                Duration::from_millis(500),
                store.find_one("products", "product_code", "P1")
            )
            .await
            .expect("find_one blocked behind connect"),
            Err(StoreError::NotConnected)
        ));

        connecting.abort();
    }

    #[tokio::test]
    #[ignore = "requires running MongoDB instance"]
    async fn test_insert_and_find_round_trip() {
        let uri = std::env::var("MONGODB_URI")
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
        let store = MongoStore::new(uri, "catalog_ingest_test", 1, Duration::from_secs(1));
        assert!(store.connect().await);

        let code = format!("P-{}", uuid::Uuid::new_v4());
        let document = match json!({"product_code": code, "brand": "Acme"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };

        let id = store.insert_one("products", document).await.unwrap();
        assert!(id.is_some());

        let found = store
            .find_one("products", "product_code", &code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["_id"], json!(id.unwrap()));
        assert_eq!(found["brand"], json!("Acme"));

        store.disconnect().await;
        assert!(!store.is_connected().await);
    }
}
