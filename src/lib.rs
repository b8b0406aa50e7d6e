//! catalog-ingest - queue-driven catalog ingestion
//!
//! Consumes product, stock and price updates from a message broker, validates
//! each message against its collection schema and stores it in a document
//! store. Invalid messages are dead-lettered; transient failures are
//! requeued. A small HTTP API serves the stored documents.

pub mod api;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod store;
pub mod supervisor;
pub mod utils;
pub mod validation;
