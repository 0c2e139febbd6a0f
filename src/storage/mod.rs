//! Storage contracts for explora
//!
//! The exploration layer never talks to a document store directly. It goes
//! through three narrow traits:
//!
//! - [`MappingSource`] returns backend-native mappings of indices
//! - [`QueryBackend`] executes an accumulated [`SearchRequest`]
//! - [`DescriptorStore`] persists collection descriptors
//!
//! [`MemoryBackend`] implements the first two over JSON documents;
//! [`FileDescriptorStore`] persists descriptors as YAML files.

pub mod file;
pub mod memory;

pub use file::FileDescriptorStore;
pub use memory::{MemoryBackend, MemoryDescriptorStore};

use crate::query::request::{MetricKind, SearchRequest};
use crate::schema::CollectionDescriptor;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Backend-native mapping of one index: `{ "properties": { ... } }`
pub type RawFieldTree = Value;

/// Failures reported by a backend
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("Index '{index}' does not exist")]
    IndexNotFound { index: String },

    #[error("Field '{field}' holds non-numeric values")]
    NonNumericField { field: String },

    #[error("Unsupported request: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// Fetches raw mappings
#[async_trait]
pub trait MappingSource: Send + Sync + 'static {
    /// Mappings of the index, or of every index behind the alias
    async fn get_mapping(&self, index: &str) -> Result<BTreeMap<String, RawFieldTree>, BackendError>;

    /// Mappings of every index matching a `*` pattern
    async fn get_all_mappings(
        &self,
        pattern: &str,
    ) -> Result<BTreeMap<String, RawFieldTree>, BackendError>;
}

/// Executes search requests
#[async_trait]
pub trait QueryBackend: Send + Sync + 'static {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, BackendError>;
}

/// Persists collection descriptors
#[async_trait]
pub trait DescriptorStore: Send + Sync + 'static {
    async fn get(&self, name: &str) -> crate::Result<Option<CollectionDescriptor>>;

    async fn put(&self, descriptor: &CollectionDescriptor) -> crate::Result<()>;

    /// Returns false when there was nothing to delete
    async fn delete(&self, name: &str) -> crate::Result<bool>;

    async fn list_all(&self) -> crate::Result<Vec<CollectionDescriptor>>;
}

/// Raw backend answer to a [`SearchRequest`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchResponse {
    /// Number of matching documents, regardless of paging
    pub total: u64,
    /// Projected documents of the requested page
    pub hits: Vec<Value>,
    pub aggregations: Vec<RawAggregation>,
}

/// One named aggregation result
#[derive(Debug, Clone, PartialEq)]
pub enum RawAggregation {
    Buckets {
        name: String,
        sum_other_doc_count: Option<u64>,
        buckets: Vec<RawBucket>,
    },
    Metric {
        name: String,
        kind: MetricKind,
        value: RawMetricValue,
    },
    TopHits {
        name: String,
        hits: Vec<Value>,
    },
}

impl RawAggregation {
    pub fn name(&self) -> &str {
        match self {
            RawAggregation::Buckets { name, .. }
            | RawAggregation::Metric { name, .. }
            | RawAggregation::TopHits { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawBucket {
    pub key: Value,
    pub key_as_string: Option<String>,
    pub doc_count: u64,
    pub aggregations: Vec<RawAggregation>,
}

/// Value of a metric aggregation as the backend reports it
#[derive(Debug, Clone, PartialEq)]
pub enum RawMetricValue {
    /// `None` when no document carried the field
    Single(Option<f64>),
    Bounds(Option<RawBounds>),
    Centroid { lat: f64, lon: f64, count: u64 },
}

/// The four corner scalars of a geo-bounds metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawBounds {
    pub top: f64,
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
}
