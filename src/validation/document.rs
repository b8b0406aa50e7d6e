//! Typed documents built from validated payloads.
//!
//! Each variant holds its required fields as typed values and keeps every
//! other payload field (optional fields and unknown extras) in `extra`, so a
//! document converts back to a map with exactly the fields it arrived with.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use super::schema::Collection;

/// Payload field naming the collection a document is stored in.
pub const TARGET_COLLECTION_FIELD: &str = "collection";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_code: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub brand: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Product {
    pub fn price(&self) -> Option<f64> {
        self.extra.get("price").and_then(Value::as_f64)
    }

    pub fn currency(&self) -> Option<&str> {
        self.extra.get("currency").and_then(Value::as_str)
    }

    pub fn sku(&self) -> Option<&str> {
        self.extra.get("sku").and_then(Value::as_str)
    }

    pub fn created_at(&self) -> Option<&str> {
        self.extra.get("created_at").and_then(Value::as_str)
    }

    pub fn updated_at(&self) -> Option<&str> {
        self.extra.get("updated_at").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    pub product_code: String,
    pub warehouse_id: String,
    pub quantity: i64,
    pub location: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Stock {
    pub fn updated_at(&self) -> Option<&str> {
        self.extra.get("updated_at").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub product_code: String,
    pub currency: String,
    pub base_price: Number,
    pub discount_percentage: Number,
    pub final_price: Number,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Price {
    pub fn effective_date(&self) -> Option<&str> {
        self.extra.get("effective_date").and_then(Value::as_str)
    }

    pub fn expires_at(&self) -> Option<&str> {
        self.extra.get("expires_at").and_then(Value::as_str)
    }

    pub fn promotion_id(&self) -> Option<&str> {
        self.extra.get("promotion_id").and_then(Value::as_str)
    }
}

/// A fully validated document.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Product(Product),
    Stock(Stock),
    Price(Price),
}

impl Document {
    /// Build the typed variant for `collection` from an already type-checked object.
    pub(crate) fn from_object(
        collection: Collection,
        object: Map<String, Value>,
    ) -> Result<Self, serde_json::Error> {
        let value = Value::Object(object);
        Ok(match collection {
            Collection::Products => Document::Product(serde_json::from_value(value)?),
            Collection::Stocks => Document::Stock(serde_json::from_value(value)?),
            Collection::Prices => Document::Price(serde_json::from_value(value)?),
        })
    }

    pub fn collection(&self) -> Collection {
        match self {
            Document::Product(_) => Collection::Products,
            Document::Stock(_) => Collection::Stocks,
            Document::Price(_) => Collection::Prices,
        }
    }

    pub fn product_code(&self) -> &str {
        match self {
            Document::Product(p) => &p.product_code,
            Document::Stock(s) => &s.product_code,
            Document::Price(p) => &p.product_code,
        }
    }

    /// Fields outside the required schema.
    pub fn extra(&self) -> &Map<String, Value> {
        match self {
            Document::Product(p) => &p.extra,
            Document::Stock(s) => &s.extra,
            Document::Price(p) => &p.extra,
        }
    }

    /// The `collection` field carried in the payload, if it is a non-empty string.
    pub fn target_collection(&self) -> Option<&str> {
        self.extra()
            .get(TARGET_COLLECTION_FIELD)
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Flatten back into a JSON object for storage.
    pub fn into_map(self) -> Map<String, Value> {
        match self {
            Document::Product(p) => {
                let mut map = p.extra;
                map.insert("product_code".into(), p.product_code.into());
                map.insert("name".into(), p.name.into());
                map.insert("description".into(), p.description.into());
                map.insert("category".into(), p.category.into());
                map.insert("brand".into(), p.brand.into());
                map
            }
            Document::Stock(s) => {
                let mut map = s.extra;
                map.insert("product_code".into(), s.product_code.into());
                map.insert("warehouse_id".into(), s.warehouse_id.into());
                map.insert("quantity".into(), s.quantity.into());
                map.insert("location".into(), s.location.into());
                map
            }
            Document::Price(p) => {
                let mut map = p.extra;
                map.insert("product_code".into(), p.product_code.into());
                map.insert("currency".into(), p.currency.into());
                map.insert("base_price".into(), p.base_price.into());
                map.insert("discount_percentage".into(), p.discount_percentage.into());
                map.insert("final_price".into(), p.final_price.into());
                map
            }
        }
    }
}
