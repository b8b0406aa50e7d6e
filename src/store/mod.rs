//! Document store access.
//!
//! This module contains:
//! - `DocumentStore` trait: connection lifecycle plus insert/find on named collections
//! - Implementations: MongoDB, Mock
//!
//! Documents cross this boundary as JSON objects. Stores assign an `_id`
//! on insert and return it rendered as a string.

use async_trait::async_trait;
use serde_json::{Map, Value};

#[cfg(feature = "mongodb")]
pub mod mongodb;
pub mod mock;

#[cfg(feature = "mongodb")]
pub use self::mongodb::MongoStore;
pub use mock::MockStore;

/// A stored document: a JSON object.
pub type StoredDocument = Map<String, Value>;

/// Field every collection is keyed by.
pub const KEY_FIELD: &str = "product_code";

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not connected to the document store")]
    NotConnected,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Query error: {0}")]
    Query(String),

    #[cfg(feature = "mongodb")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] ::mongodb::error::Error),
}

/// Persistence for validated documents, shared by consumers and the query API.
///
/// `connect()` is idempotent and retries internally; it reports failure as
/// `false` rather than an error so callers can treat the store as unavailable.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn connect(&self) -> bool;

    async fn disconnect(&self);

    async fn is_connected(&self) -> bool;

    /// Insert one document, returning the identifier the store assigned.
    ///
    /// `Ok(None)` means the store accepted the call but reported no id.
    async fn insert_one(&self, collection: &str, document: StoredDocument)
        -> Result<Option<String>>;

    /// First document whose `field` equals `value`.
    async fn find_one(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<StoredDocument>>;

    /// Documents matching every equality in `filter`, at most `limit` of them.
    async fn find(
        &self,
        collection: &str,
        filter: &StoredDocument,
        limit: u32,
    ) -> Result<Vec<StoredDocument>>;
}

/// Whether `document` satisfies every equality in `filter`.
pub fn matches_filter(document: &StoredDocument, filter: &StoredDocument) -> bool {
    filter
        .iter()
        .all(|(field, expected)| document.get(field) == Some(expected))
}
