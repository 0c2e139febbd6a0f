//! Turns raw backend buckets into the response tree
//!
//! The walk follows the lowered [`BucketRequest`] chain next to the
//! [`Aggregation`] levels it came from, so every raw result is found by the
//! name it was requested under.

use super::response::{AggregationNode, FetchedGeometry, MetricResult, MetricValue};
use crate::error::{Error, Result};
use crate::geo::{self, geohash, tile};
use crate::query::filter::field_value;
use crate::query::request::{
    BucketKind, BucketRequest, MetricKind, BUCKET_GEOMETRY_SUFFIX, FETCHED_HITS,
    RAW_GEOMETRIES_PREFIX,
};
use crate::storage::{RawAggregation, RawBucket, RawMetricValue};
use exql::{AggregatedGeometry, Aggregation};
use geo_types::{coord, Geometry, Point, Rect};
use serde_json::Value;

/// Build the response tree of a bucket aggregation.
///
/// The root counts every matching document and always lists the buckets
/// of the first level.
pub fn assemble(
    raw: &RawAggregation,
    request: &BucketRequest,
    aggregations: &[Aggregation],
    total: u64,
) -> Result<AggregationNode> {
    let (elements, sum_other_doc_count) = level(raw, request, aggregations)?;
    let mut root = AggregationNode::new(request.name.clone(), total);
    root.sum_other_doc_count = sum_other_doc_count;
    root.elements = Some(elements);
    Ok(root)
}

/// Value of a metric aggregation; geo metrics carry their geometry
pub fn metric_value(raw: &RawAggregation) -> Result<MetricValue> {
    match raw {
        RawAggregation::Metric { value, .. } => Ok(match value {
            RawMetricValue::Single(value) => MetricValue::Scalar(*value),
            RawMetricValue::Bounds(Some(bounds)) => MetricValue::Geometry(Geometry::Rect(Rect::new(
                coord! { x: bounds.left, y: bounds.bottom },
                coord! { x: bounds.right, y: bounds.top },
            ))),
            RawMetricValue::Bounds(None) => MetricValue::Scalar(None),
            RawMetricValue::Centroid { count: 0, .. } => MetricValue::Scalar(None),
            RawMetricValue::Centroid { lat, lon, .. } => {
                MetricValue::Geometry(Geometry::Point(Point::new(*lon, *lat)))
            }
        }),
        other => Err(unexpected(other.name(), "a metric")),
    }
}

fn level(
    raw: &RawAggregation,
    request: &BucketRequest,
    aggregations: &[Aggregation],
) -> Result<(Vec<AggregationNode>, Option<u64>)> {
    let Some((aggregation, rest)) = aggregations.split_first() else {
        return Err(Error::Backend {
            message: format!("No aggregation level matches '{}'", request.name),
        });
    };
    let RawAggregation::Buckets {
        buckets,
        sum_other_doc_count,
        ..
    } = raw
    else {
        return Err(unexpected(raw.name(), "buckets"));
    };

    let nodes = buckets
        .iter()
        .map(|bucket| bucket_node(bucket, request, aggregation, rest))
        .collect::<Result<Vec<_>>>()?;
    Ok((nodes, *sum_other_doc_count))
}

fn bucket_node(
    bucket: &RawBucket,
    request: &BucketRequest,
    aggregation: &Aggregation,
    rest: &[Aggregation],
) -> Result<AggregationNode> {
    let mut node = AggregationNode::new(request.name.clone(), bucket.doc_count);
    let cell = cell_bounds(&request.kind, bucket);

    match (&request.kind, &cell) {
        (BucketKind::Geohash { .. }, Some(bounds)) => {
            node.key = Some(geo::to_geojson(&Geometry::Point(bounds.center().into())));
            node.key_as_string = bucket.key.as_str().map(str::to_string);
        }
        _ => {
            node.key = Some(bucket.key.clone());
            node.key_as_string = bucket.key_as_string.clone();
        }
    }

    // user metrics come first, in request order
    for (metric, lowered) in aggregation.metrics.iter().zip(&request.metrics) {
        node.metrics.push(MetricResult {
            field: metric.field.clone(),
            function: metric.function,
            value: metric_value(find(&bucket.aggregations, &lowered.name)?)?,
        });
    }

    if !aggregation.aggregated_geometries.is_empty() || !aggregation.raw_geometries.is_empty() {
        let mut geometries = Vec::new();
        for kind in &aggregation.aggregated_geometries {
            if let Some(geometry) = aggregated_geometry(*kind, bucket, request, cell)? {
                geometries.push(FetchedGeometry {
                    reference: kind.as_str().to_string(),
                    geometry,
                    is_raw: false,
                    sort: None,
                });
            }
        }
        geometries.extend(raw_geometries(bucket, request, aggregation)?);
        node.geometries = Some(geometries);
    }

    if aggregation.fetch_hits.is_some() {
        match find(&bucket.aggregations, FETCHED_HITS)? {
            RawAggregation::TopHits { hits, .. } => node.hits = Some(hits.clone()),
            other => return Err(unexpected(other.name(), "top hits")),
        }
    }

    if let Some(sub) = &request.sub {
        let (elements, sum_other_doc_count) = level(find(&bucket.aggregations, &sub.name)?, sub, rest)?;
        node.elements = Some(elements);
        node.sum_other_doc_count = sum_other_doc_count;
    }

    Ok(node)
}

/// Bounds of a geohash or geotile bucket, decoded from its key
fn cell_bounds(kind: &BucketKind, bucket: &RawBucket) -> Option<Rect<f64>> {
    let key = bucket.key.as_str()?;
    match kind {
        BucketKind::Geohash { .. } => geohash::decode_bounds(key),
        BucketKind::Geotile { .. } => {
            let (z, x, y) = tile::parse_key(key)?;
            tile::bounds(z, x, y)
        }
        _ => None,
    }
}

fn aggregated_geometry(
    kind: AggregatedGeometry,
    bucket: &RawBucket,
    request: &BucketRequest,
    cell: Option<Rect<f64>>,
) -> Result<Option<Value>> {
    let from_metric = |function: MetricKind| -> Result<Option<Value>> {
        let Some(lowered) = request
            .metrics
            .iter()
            .find(|m| m.kind == function && m.name.ends_with(BUCKET_GEOMETRY_SUFFIX))
        else {
            return Ok(None);
        };
        Ok(match metric_value(find(&bucket.aggregations, &lowered.name)?)? {
            MetricValue::Geometry(geometry) => Some(geo::to_geojson(&geometry)),
            MetricValue::Scalar(_) => None,
        })
    };

    match kind {
        AggregatedGeometry::Bbox => from_metric(MetricKind::GeoBbox),
        AggregatedGeometry::Centroid => from_metric(MetricKind::GeoCentroid),
        AggregatedGeometry::Cell => Ok(cell.map(|rect| geo::to_geojson(&Geometry::Rect(rect)))),
        AggregatedGeometry::CellCenter => {
            Ok(cell.map(|rect| geo::to_geojson(&Geometry::Point(rect.center().into()))))
        }
    }
}

/// Geometries of the top document of each raw-geometry group, in request order
fn raw_geometries(
    bucket: &RawBucket,
    request: &BucketRequest,
    aggregation: &Aggregation,
) -> Result<Vec<FetchedGeometry>> {
    let mut used: Vec<(&str, &str)> = Vec::new();
    let mut geometries = Vec::new();

    for raw in &aggregation.raw_geometries {
        // a field listed twice maps to the next group holding it
        let Some(group) = request.top_hits.iter().find(|hits| {
            hits.name.starts_with(RAW_GEOMETRIES_PREFIX)
                && hits.includes.contains(&raw.field)
                && !used.contains(&(hits.name.as_str(), raw.field.as_str()))
        }) else {
            continue;
        };
        used.push((group.name.as_str(), raw.field.as_str()));

        let hits = match find(&bucket.aggregations, &group.name)? {
            RawAggregation::TopHits { hits, .. } => hits,
            other => return Err(unexpected(other.name(), "top hits")),
        };
        if let Some(geometry) = hits.first().and_then(|hit| field_value(hit, &raw.field)) {
            geometries.push(FetchedGeometry {
                reference: raw.field.clone(),
                geometry: geometry.clone(),
                is_raw: true,
                sort: group.name.strip_prefix(RAW_GEOMETRIES_PREFIX).map(str::to_string),
            });
        }
    }
    Ok(geometries)
}

fn find<'r>(aggregations: &'r [RawAggregation], name: &str) -> Result<&'r RawAggregation> {
    aggregations
        .iter()
        .find(|raw| raw.name() == name)
        .ok_or_else(|| Error::Backend {
            message: format!("Aggregation '{}' missing from the response", name),
        })
}

fn unexpected(name: &str, expected: &str) -> Error {
    Error::Backend {
        message: format!("Aggregation '{}' is not {}", name, expected),
    }
}
