//! Collection names and their required-field schemas.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A collection name that does not map to any known schema.
///
/// This is a routing/configuration error, never a property of message content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown collection: {0}")]
pub struct UnknownCollection(pub String);

/// The fixed set of ingested collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Products,
    Stocks,
    Prices,
}

impl Collection {
    /// All collections, in startup order.
    pub const ALL: [Collection; 3] = [Collection::Products, Collection::Stocks, Collection::Prices];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Products => "products",
            Collection::Stocks => "stocks",
            Collection::Prices => "prices",
        }
    }

    /// Required fields, in declaration order.
    pub fn schema(&self) -> &'static [FieldSpec] {
        match self {
            Collection::Products => PRODUCT_FIELDS,
            Collection::Stocks => STOCK_FIELDS,
            Collection::Prices => PRICE_FIELDS,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = UnknownCollection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "products" => Ok(Collection::Products),
            "stocks" => Ok(Collection::Stocks),
            "prices" => Ok(Collection::Prices),
            other => Err(UnknownCollection(other.to_string())),
        }
    }
}

/// JSON type a required field must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    /// Integral JSON number.
    Integer,
    /// Any JSON number.
    Number,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
        }
    }
}

/// Name of the runtime JSON type of `value`, as reported in type errors.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A required field and its expected type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
}

impl FieldSpec {
    const fn string(name: &'static str) -> Self {
        Self {
            name,
            field_type: FieldType::String,
        }
    }

    const fn integer(name: &'static str) -> Self {
        Self {
            name,
            field_type: FieldType::Integer,
        }
    }

    const fn number(name: &'static str) -> Self {
        Self {
            name,
            field_type: FieldType::Number,
        }
    }
}

const PRODUCT_FIELDS: &[FieldSpec] = &[
    FieldSpec::string("product_code"),
    FieldSpec::string("name"),
    FieldSpec::string("description"),
    FieldSpec::string("category"),
    FieldSpec::string("brand"),
];

const STOCK_FIELDS: &[FieldSpec] = &[
    FieldSpec::string("product_code"),
    FieldSpec::string("warehouse_id"),
    FieldSpec::integer("quantity"),
    FieldSpec::string("location"),
];

const PRICE_FIELDS: &[FieldSpec] = &[
    FieldSpec::string("product_code"),
    FieldSpec::string("currency"),
    FieldSpec::number("base_price"),
    FieldSpec::number("discount_percentage"),
    FieldSpec::number("final_price"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_round_trips_through_name() {
        for collection in Collection::ALL {
            assert_eq!(collection.as_str().parse::<Collection>(), Ok(collection));
            assert_eq!(collection.to_string(), collection.as_str());
        }
    }

    #[test]
    fn test_unknown_collection_name() {
        let err = "orders".parse::<Collection>().unwrap_err();
        assert_eq!(err, UnknownCollection("orders".to_string()));
        assert_eq!(err.to_string(), "Unknown collection: orders");
    }

    #[test]
    fn test_schema_declaration_order() {
        let names: Vec<_> = Collection::Stocks.schema().iter().map(|f| f.name).collect();
        assert_eq!(names, ["product_code", "warehouse_id", "quantity", "location"]);
    }

    #[test]
    fn test_integer_rejects_fractional_numbers() {
        assert!(FieldType::Integer.matches(&json!(3)));
        assert!(!FieldType::Integer.matches(&json!(3.5)));
        assert!(!FieldType::Integer.matches(&json!("3")));
    }

    #[test]
    fn test_number_accepts_integers_and_floats() {
        assert!(FieldType::Number.matches(&json!(10)));
        assert!(FieldType::Number.matches(&json!(10.25)));
        assert!(!FieldType::Number.matches(&json!(true)));
    }

    #[test]
    fn test_json_type_names() {
        assert_eq!(json_type_name(&json!(null)), "null");
        assert_eq!(json_type_name(&json!(false)), "boolean");
        assert_eq!(json_type_name(&json!(7)), "integer");
        assert_eq!(json_type_name(&json!(7.5)), "number");
        assert_eq!(json_type_name(&json!("x")), "string");
        assert_eq!(json_type_name(&json!([])), "array");
        assert_eq!(json_type_name(&json!({})), "object");
    }
}
