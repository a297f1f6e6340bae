//! Model catalog: per-model pricing and availability.
//!
//! The catalog is an external read from the pipeline's point of view; this
//! crate defines the seam (and an in-memory implementation for tests/dev).

pub mod catalog;

pub use catalog::{CatalogError, InMemoryModelCatalog, ModelCatalog, ModelInfo};
