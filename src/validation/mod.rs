//! Schema validation for incoming queue messages.
//!
//! `validate` is a pure function: it decodes the payload, parses it as JSON,
//! requires an object, and checks every required field of the target
//! collection's schema. All field errors are collected; earlier stages
//! (decoding, parsing, shape) short-circuit with a single error.
//!
//! An unknown collection name is returned as `Err(UnknownCollection)` rather
//! than as a validation error: it means the caller is misrouted, not that the
//! message is bad.

mod document;
mod schema;

pub use document::{Document, Price, Product, Stock, TARGET_COLLECTION_FIELD};
pub use schema::{json_type_name, Collection, FieldSpec, FieldType, UnknownCollection};

use serde_json::{Map, Value};

/// Error reported for payloads that parse to something other than an object.
pub const NOT_AN_OBJECT: &str = "Message must be a JSON object";

/// Outcome of validating one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    /// Every required field is present and correctly typed.
    Valid(Document),
    /// Non-empty, ordered list of human-readable errors.
    Invalid(Vec<String>),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }

    pub fn errors(&self) -> &[String] {
        match self {
            Validation::Valid(_) => &[],
            Validation::Invalid(errors) => errors,
        }
    }

    pub fn into_result(self) -> Result<Document, Vec<String>> {
        match self {
            Validation::Valid(document) => Ok(document),
            Validation::Invalid(errors) => Err(errors),
        }
    }
}

/// Validate a raw payload against the schema of `collection_name`.
pub fn validate(raw: &[u8], collection_name: &str) -> Result<Validation, UnknownCollection> {
    match std::str::from_utf8(raw) {
        Ok(text) => validate_str(text, collection_name),
        Err(e) => Ok(Validation::Invalid(vec![format!("Invalid UTF-8: {}", e)])),
    }
}

/// Validate an already decoded payload against the schema of `collection_name`.
pub fn validate_str(text: &str, collection_name: &str) -> Result<Validation, UnknownCollection> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return Ok(Validation::Invalid(vec![format!("Invalid JSON: {}", e)])),
    };

    let Value::Object(object) = value else {
        return Ok(Validation::Invalid(vec![NOT_AN_OBJECT.to_string()]));
    };

    let collection: Collection = collection_name.parse()?;

    let errors = check_fields(&object, collection.schema());
    if !errors.is_empty() {
        return Ok(Validation::Invalid(errors));
    }

    // The type gate passed; this only fails for values the typed fields
    // cannot hold (e.g. an integer beyond i64).
    Ok(match Document::from_object(collection, object) {
        Ok(document) => Validation::Valid(document),
        Err(e) => Validation::Invalid(vec![format!("Invalid value in document: {}", e)]),
    })
}

/// Check presence and type of every field in `schema`, in declaration order.
pub fn check_fields(object: &Map<String, Value>, schema: &[FieldSpec]) -> Vec<String> {
    schema
        .iter()
        .filter_map(|field| match object.get(field.name) {
            None => Some(format!("Missing required field: {}", field.name)),
            Some(value) if !field.field_type.matches(value) => Some(format!(
                "Invalid type for field {}: expected {}, got {}",
                field.name,
                field.field_type.name(),
                json_type_name(value)
            )),
            Some(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product_payload() -> Value {
        json!({
            "product_code": "TEST-001",
            "name": "Test Product",
            "description": "This is a test product",
            "category": "Test Category",
            "brand": "TestBrand"
        })
    }

    fn stock_payload() -> Value {
        json!({
            "product_code": "TEST-001",
            "warehouse_id": "WH-MAIN",
            "quantity": 100,
            "location": "A1-B2-C3"
        })
    }

    fn price_payload() -> Value {
        json!({
            "product_code": "TEST-001",
            "currency": "USD",
            "base_price": 120.0,
            "discount_percentage": 10.0,
            "final_price": 108.0
        })
    }

    fn run(payload: &Value, collection: &str) -> Validation {
        validate(payload.to_string().as_bytes(), collection).expect("known collection")
    }

    #[test]
    fn test_valid_payloads_for_every_collection() {
        for (payload, collection) in [
            (product_payload(), "products"),
            (stock_payload(), "stocks"),
            (price_payload(), "prices"),
        ] {
            let result = run(&payload, collection);
            assert!(result.errors().is_empty(), "{collection}: {:?}", result.errors());

            let document = result.into_result().unwrap();
            assert_eq!(document.collection().as_str(), collection);
            assert_eq!(Value::Object(document.into_map()), payload);
        }
    }

    #[test]
    fn test_extra_fields_are_kept_not_rejected() {
        let mut payload = product_payload();
        payload["price"] = json!(99.99);
        payload["warehouse_note"] = json!({"aisle": 4});

        let document = run(&payload, "products").into_result().unwrap();
        assert_eq!(Value::Object(document.into_map()), payload);
    }

    #[test]
    fn test_missing_fields_reported_once_each_in_schema_order() {
        let result = run(&json!({"product_code": "P2"}), "products");

        assert_eq!(
            result.errors(),
            [
                "Missing required field: name",
                "Missing required field: description",
                "Missing required field: category",
                "Missing required field: brand",
            ]
        );
    }

    #[test]
    fn test_wrong_type_names_expected_and_actual() {
        let mut payload = stock_payload();
        payload["quantity"] = json!("100");

        let result = run(&payload, "stocks");
        assert_eq!(
            result.errors(),
            ["Invalid type for field quantity: expected integer, got string"]
        );
    }

    #[test]
    fn test_fractional_quantity_is_a_type_error() {
        let mut payload = stock_payload();
        payload["quantity"] = json!(1.5);

        let result = run(&payload, "stocks");
        assert_eq!(
            result.errors(),
            ["Invalid type for field quantity: expected integer, got number"]
        );
    }

    #[test]
    fn test_integer_prices_are_numbers() {
        let mut payload = price_payload();
        payload["base_price"] = json!(120);
        payload["discount_percentage"] = json!(0);
        payload["final_price"] = json!(120);

        let document = run(&payload, "prices").into_result().unwrap();
        match &document {
            Document::Price(price) => assert_eq!(price.base_price.as_f64(), Some(120.0)),
            other => panic!("expected price, got {other:?}"),
        }
        assert_eq!(Value::Object(document.into_map()), payload);
    }

    #[test]
    fn test_missing_and_mistyped_fields_collected_together() {
        let payload = json!({
            "product_code": 42,
            "currency": "USD",
            "base_price": "free",
            "final_price": null
        });

        let result = run(&payload, "prices");
        assert_eq!(
            result.errors(),
            [
                "Invalid type for field product_code: expected string, got integer",
                "Invalid type for field base_price: expected number, got string",
                "Missing required field: discount_percentage",
                "Invalid type for field final_price: expected number, got null",
            ]
        );
    }

    #[test]
    fn test_malformed_json_yields_single_error() {
        let result = validate(b"{\"product_code\": ", "products").unwrap();

        assert_eq!(result.errors().len(), 1);
        assert!(result.errors()[0].starts_with("Invalid JSON"));
    }

    #[test]
    fn test_non_object_json_rejected() {
        for text in ["[1, 2, 3]", "\"text\"", "42", "null"] {
            let result = validate_str(text, "products").unwrap();
            assert_eq!(result.errors(), [NOT_AN_OBJECT], "input: {text}");
        }
    }

    #[test]
    fn test_invalid_utf8_yields_single_error() {
        let result = validate(&[0xff, 0xfe, b'{'], "products").unwrap();

        assert_eq!(result.errors().len(), 1);
        assert!(result.errors()[0].starts_with("Invalid UTF-8"));
    }

    #[test]
    fn test_unknown_collection_is_a_configuration_error() {
        let err = validate_str(&product_payload().to_string(), "unknown_collection").unwrap_err();
        assert_eq!(err, UnknownCollection("unknown_collection".to_string()));
    }

    #[test]
    fn test_out_of_range_integer_is_invalid_not_panicking() {
        let mut payload = stock_payload();
        payload["quantity"] = json!(u64::MAX);

        let result = run(&payload, "stocks");
        assert!(!result.is_valid());
        assert!(result.errors()[0].starts_with("Invalid value in document"));
    }

    #[test]
    fn test_validation_does_not_mutate_input() {
        let text = product_payload().to_string();
        let before = text.clone();
        let _ = validate_str(&text, "products");
        assert_eq!(text, before);
    }
}
