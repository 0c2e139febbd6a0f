//! Backend-neutral search request
//!
//! The [`QueryBuilder`](super::QueryBuilder) accumulates one of these; a
//! [`QueryBackend`](crate::storage::QueryBackend) executes it.

use exql::{FilterClause, FullTextClause, Interval, SortOrder, SortTerm};
use serde::Serialize;

pub use exql::CollectionFunction as MetricKind;

/// Suffix of the geo metrics that carry a bucket's representative geometry
pub const BUCKET_GEOMETRY_SUFFIX: &str = "-bucket";

/// Name of the top-hits list carrying `fetch_hits` documents
pub const FETCHED_HITS: &str = "fetched_hits";

/// Prefix of the top-hits lists electing raw geometries
pub const RAW_GEOMETRIES_PREFIX: &str = "raw_geometries:";

/// Name of a user metric, `{function}:{field}`
pub fn metric_name(function: MetricKind, field: &str) -> String {
    format!("{}:{}", function, field)
}

/// Name of the geo metric computing a bucket geometry over `centroid_path`
pub fn bucket_geometry_name(function: MetricKind, centroid_path: &str) -> String {
    format!("{}:{}{}", function, centroid_path, BUCKET_GEOMETRY_SUFFIX)
}

/// A request the backend evaluates in one round-trip
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    /// Index, alias or pattern to search
    pub index: String,
    /// Every predicate must hold
    pub predicates: Vec<Predicate>,
    /// Every clause must match
    pub full_text: Vec<FullTextClause>,
    /// Source patterns to return; `*` returns everything, empty returns nothing
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub sort: Vec<SortTerm>,
    pub size: usize,
    pub from: usize,
    /// Sort values of the last hit of the previous page
    pub search_after: Option<Vec<String>>,
    pub aggregation: Option<BucketRequest>,
    /// Metrics computed over every matching document
    pub metrics: Vec<MetricRequest>,
}

impl SearchRequest {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            predicates: Vec::new(),
            full_text: Vec::new(),
            includes: vec!["*".to_string()],
            excludes: Vec::new(),
            sort: Vec::new(),
            size: 10,
            from: 0,
            search_after: None,
            aggregation: None,
            metrics: Vec::new(),
        }
    }
}

/// A filter clause with the date format its literals are written in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Predicate {
    pub clause: FilterClause,
    pub date_format: Option<String>,
}

/// One level of a bucket aggregation, with its nested level if any
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketRequest {
    pub name: String,
    pub kind: BucketKind,
    pub field: String,
    pub order: Option<BucketOrder>,
    pub metrics: Vec<MetricRequest>,
    pub top_hits: Vec<TopHitsRequest>,
    pub sub: Option<Box<BucketRequest>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BucketKind {
    DateHistogram {
        interval: Interval,
        format: Option<String>,
    },
    Histogram {
        interval: f64,
    },
    Terms {
        size: usize,
        include: Option<String>,
    },
    Geohash {
        precision: usize,
        size: usize,
    },
    Geotile {
        precision: u32,
        size: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BucketOrder {
    Key(SortOrder),
    Count(SortOrder),
    Metric { name: String, order: SortOrder },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRequest {
    pub name: String,
    pub kind: MetricKind,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopHitsRequest {
    pub name: String,
    pub size: usize,
    pub sort: Vec<SortTerm>,
    pub includes: Vec<String>,
}
