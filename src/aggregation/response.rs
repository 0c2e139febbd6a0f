//! Typed result of an aggregation request

use crate::geo::to_geojson;
use crate::query::request::MetricKind;
use geo_types::Geometry;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// One node of the response tree.
///
/// The root carries the total count and the first level's buckets; every
/// bucket node carries the buckets of the next level. A bucket of the last
/// level has `elements: None`, which is kept distinct from an empty level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationNode {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_as_string: Option<String>,
    pub count: u64,
    /// Documents left out of a truncated terms level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum_other_doc_count: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricResult>,
    pub elements: Option<Vec<AggregationNode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometries: Option<Vec<FetchedGeometry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hits: Option<Vec<Value>>,
}

impl AggregationNode {
    pub fn new(name: impl Into<String>, count: u64) -> Self {
        Self {
            name: name.into(),
            key: None,
            key_as_string: None,
            count,
            sum_other_doc_count: None,
            metrics: Vec::new(),
            elements: None,
            geometries: None,
            hits: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.elements.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricResult {
    pub field: String,
    #[serde(rename = "type")]
    pub function: MetricKind,
    pub value: MetricValue,
}

/// Scalar value, or the geometry of a geo metric
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// `None` when no document carried the field
    Scalar(Option<f64>),
    Geometry(Geometry<f64>),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(value) => *value,
            MetricValue::Geometry(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            MetricValue::Scalar(Some(value)) => serde_json::json!(value),
            MetricValue::Scalar(None) => Value::Null,
            MetricValue::Geometry(geometry) => to_geojson(geometry),
        }
    }
}

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// A geometry attached to a bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchedGeometry {
    /// `bbox`, `centroid`, `cell`, `cell_center`, or the source field of a raw geometry
    pub reference: String,
    /// GeoJSON
    pub geometry: Value,
    pub is_raw: bool,
    /// Sort that elected a raw geometry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
}
