//! Aggregation request validation and lowering
//!
//! An aggregation spec is a list of [`Aggregation`] levels, each nested under
//! the previous one. [`validate`] checks it against the collection schema and
//! [`to_bucket_request`] lowers it to the backend's [`BucketRequest`] chain.

use crate::config::ExplorerConfig;
use crate::error::{Error, Result};
use crate::query::bind_geo_distance;
use crate::query::date::DateFormat;
use crate::query::request::{
    bucket_geometry_name, metric_name, BucketKind, BucketOrder, BucketRequest, MetricKind,
    MetricRequest, TopHitsRequest, FETCHED_HITS, RAW_GEOMETRIES_PREFIX,
};
use crate::schema::{CollectionDescriptor, FieldNode, FieldTree, FieldType};
use exql::{
    AggregatedGeometry, Aggregation, AggregationType, CalendarUnit, Metric, OrderOn, SortTerm,
};

/// Maximum geohash length
pub const MAX_GEOHASH_PRECISION: u32 = 12;

/// Maximum geotile zoom
pub const MAX_GEOTILE_PRECISION: u32 = 29;

/// Maximum h3 resolution
pub const MAX_H3_RESOLUTION: u32 = 15;

/// Default bucket count of a terms level
pub const DEFAULT_TERMS_SIZE: usize = 10;

/// Everything an aggregation is checked and lowered against
#[derive(Clone, Copy)]
pub struct AggregationContext<'a> {
    pub descriptor: &'a CollectionDescriptor,
    pub fields: &'a FieldTree,
    pub config: &'a ExplorerConfig,
}

impl<'a> AggregationContext<'a> {
    fn field(&self, path: &str) -> Result<&'a FieldNode> {
        self.fields.lookup(path).ok_or_else(|| Error::FieldNotFound {
            collection: self.descriptor.name.clone(),
            field: path.to_string(),
        })
    }
}

/// Name of the response node of a level
pub fn level_name(aggregation: &Aggregation) -> String {
    format!("{}:{}", aggregation.agg_type, aggregation.field)
}

/// Check every level of an aggregation request.
///
/// Geo-aggregations must start with a geohash or geotile level.
pub fn validate(aggregations: &[Aggregation], geo: bool, ctx: AggregationContext<'_>) -> Result<()> {
    let Some(first) = aggregations.first() else {
        return Err(Error::bad_request("At least one aggregation is required"));
    };
    if geo && !matches!(first.agg_type, AggregationType::Geohash | AggregationType::Geotile) {
        return Err(Error::invalid_parameter(format!(
            "A geo-aggregation must start with a geohash or geotile level, found {}",
            first.agg_type
        )));
    }
    for aggregation in aggregations {
        validate_level(aggregation, ctx)?;
    }
    Ok(())
}

fn validate_level(agg: &Aggregation, ctx: AggregationContext<'_>) -> Result<()> {
    let node = ctx.field(&agg.field)?;
    let kind = agg.agg_type;

    let type_ok = match kind {
        AggregationType::DateHistogram => node.field_type == FieldType::Date,
        AggregationType::Histogram => node.field_type.is_numeric() || node.field_type == FieldType::Date,
        AggregationType::Term => !matches!(
            node.field_type,
            FieldType::Object | FieldType::Text | FieldType::GeoPoint | FieldType::GeoShape
        ),
        AggregationType::Geohash | AggregationType::Geotile => node.field_type == FieldType::GeoPoint,
        AggregationType::H3 => node.field_type != FieldType::GeoShape,
    };
    if !type_ok {
        return Err(Error::invalid_parameter(format!(
            "A {} aggregation cannot use '{}' ({:?})",
            kind, agg.field, node.field_type
        )));
    }

    validate_interval(agg)?;

    if let Some(format) = &agg.format {
        if kind != AggregationType::DateHistogram {
            return Err(Error::bad_request("'format' only applies to datehistogram aggregations"));
        }
        if DateFormat::parse(format).is_none() {
            return Err(Error::invalid_parameter(format!("Invalid date format '{}'", format)));
        }
    }
    if agg.include.is_some() && kind != AggregationType::Term {
        return Err(Error::bad_request("'include' only applies to term aggregations"));
    }
    if let Some(size) = agg.size {
        if matches!(kind, AggregationType::DateHistogram | AggregationType::Histogram) {
            return Err(Error::bad_request(format!("'size' does not apply to {} aggregations", kind)));
        }
        if size == 0 || size > ctx.config.max_bucket_size {
            return Err(Error::invalid_parameter(format!(
                "'size' must be in 1..={}",
                ctx.config.max_bucket_size
            )));
        }
    }

    for metric in &agg.metrics {
        check_metric(metric, ctx)?;
    }

    validate_order(agg)?;

    for geometry in &agg.aggregated_geometries {
        if geometry.is_cell() && !matches!(kind, AggregationType::Geohash | AggregationType::Geotile) {
            return Err(Error::invalid_parameter(format!(
                "'{}' geometries need a geohash or geotile aggregation",
                geometry.as_str()
            )));
        }
        if !geometry.is_cell() {
            ctx.field(&ctx.descriptor.centroid_path)?;
        }
    }

    for raw in &agg.raw_geometries {
        let field = ctx.field(&raw.field)?;
        if !field.field_type.is_geo() {
            return Err(Error::invalid_parameter(format!(
                "Raw geometry '{}' is not a geo field",
                raw.field
            )));
        }
        validate_sort_fields(&raw.sort, ctx)?;
    }

    if let Some(fetch) = &agg.fetch_hits {
        if fetch.size == 0 || fetch.size > ctx.config.max_fetch_hits {
            return Err(Error::invalid_parameter(format!(
                "'fetch_hits' size must be in 1..={}",
                ctx.config.max_fetch_hits
            )));
        }
        validate_sort_fields(&fetch.sort, ctx)?;
    }
    Ok(())
}

/// Check a metric function suits its field
pub fn check_metric(metric: &Metric, ctx: AggregationContext<'_>) -> Result<()> {
    let field = ctx.field(&metric.field)?;
    let ok = match metric.function {
        MetricKind::Avg | MetricKind::Sum => field.field_type.is_numeric(),
        MetricKind::Min | MetricKind::Max => {
            field.field_type.is_numeric() || field.field_type == FieldType::Date
        }
        MetricKind::Cardinality => field.field_type != FieldType::Object,
        MetricKind::GeoBbox | MetricKind::GeoCentroid => field.field_type == FieldType::GeoPoint,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::invalid_parameter(format!(
            "'{}' cannot be computed on '{}' ({:?})",
            metric.function, metric.field, field.field_type
        )))
    }
}

/// Backend request of a user metric; cardinality targets the hash sub-field
pub fn lower_metric(metric: &Metric, ctx: AggregationContext<'_>) -> Result<MetricRequest> {
    let field = match metric.function {
        MetricKind::Cardinality => match ctx.field(&metric.field)?.hash_field.as_deref() {
            Some(hash) => format!("{}.{}", metric.field, hash),
            None => metric.field.clone(),
        },
        _ => metric.field.clone(),
    };
    Ok(MetricRequest {
        name: metric_name(metric.function, &metric.field),
        kind: metric.function,
        field,
    })
}

fn validate_sort_fields(sort: &[SortTerm], ctx: AggregationContext<'_>) -> Result<()> {
    for term in sort {
        if let Some(field) = term.field() {
            ctx.field(field)?;
        }
    }
    Ok(())
}

fn validate_interval(agg: &Aggregation) -> Result<()> {
    let kind = agg.agg_type;
    let Some(interval) = agg.interval else {
        return match kind {
            AggregationType::Term | AggregationType::H3 => Ok(()),
            _ => Err(Error::bad_request(format!("A {} aggregation needs an interval", kind))),
        };
    };

    let precision_in = |max: u32| -> Result<()> {
        match interval.as_precision() {
            Some(p) if p <= max => Ok(()),
            _ => Err(Error::invalid_parameter(format!(
                "A {} interval must be an integer in 0..={}",
                kind, max
            ))),
        }
    };

    match kind {
        AggregationType::DateHistogram => {
            let Some(unit) = interval.unit else {
                return Err(Error::bad_request("A datehistogram interval needs a calendar unit"));
            };
            if interval.value < 1.0 || interval.value.fract() != 0.0 {
                return Err(Error::invalid_parameter("A datehistogram interval must be a positive integer"));
            }
            if matches!(unit, CalendarUnit::Month | CalendarUnit::Quarter | CalendarUnit::Year)
                && interval.value != 1.0
            {
                return Err(Error::invalid_parameter(format!(
                    "Only 1{} is supported for calendar intervals",
                    unit.as_str()
                )));
            }
            Ok(())
        }
        AggregationType::Histogram => {
            if interval.unit.is_some() || interval.value <= 0.0 {
                return Err(Error::invalid_parameter("A histogram interval must be a positive number"));
            }
            Ok(())
        }
        AggregationType::Geohash => {
            precision_in(MAX_GEOHASH_PRECISION)?;
            if interval.value < 1.0 {
                return Err(Error::invalid_parameter("A geohash precision starts at 1"));
            }
            Ok(())
        }
        AggregationType::Geotile => precision_in(MAX_GEOTILE_PRECISION),
        AggregationType::H3 => precision_in(MAX_H3_RESOLUTION),
        AggregationType::Term => Err(Error::bad_request("A term aggregation takes no interval")),
    }
}

fn validate_order(agg: &Aggregation) -> Result<()> {
    match (agg.order, agg.on) {
        (None, None) => Ok(()),
        (Some(_), None) | (None, Some(_)) => {
            Err(Error::bad_request("'order' and 'on' must be given together"))
        }
        (Some(_), Some(OrderOn::Field)) if agg.agg_type.is_geo() => Err(Error::bad_request(
            "Geo aggregations cannot be ordered on their key",
        )),
        (Some(_), Some(OrderOn::Result)) if first_scalar_metric(agg).is_none() => Err(
            Error::bad_request("Ordering on the result needs a non-geo metric"),
        ),
        _ => Ok(()),
    }
}

fn first_scalar_metric(agg: &Aggregation) -> Option<&Metric> {
    agg.metrics.iter().find(|m| !m.function.is_geo())
}

/// Field a level buckets on; h3 levels use the resolution sub-field
pub fn bucket_field(agg: &Aggregation) -> String {
    match (agg.agg_type, agg.interval.and_then(|i| i.as_precision())) {
        (AggregationType::H3, Some(resolution)) => format!("{}.{}", agg.field, resolution),
        _ => agg.field.clone(),
    }
}

/// Lower validated levels to the backend bucket chain
pub fn to_bucket_request(aggregations: &[Aggregation], ctx: AggregationContext<'_>) -> Result<BucketRequest> {
    let mut lowered: Option<BucketRequest> = None;
    for agg in aggregations.iter().rev() {
        let mut level = lower_level(agg, ctx)?;
        level.sub = lowered.map(Box::new);
        lowered = Some(level);
    }
    lowered.ok_or_else(|| Error::bad_request("At least one aggregation is required"))
}

fn lower_level(agg: &Aggregation, ctx: AggregationContext<'_>) -> Result<BucketRequest> {
    let config = ctx.config;
    let centroid = ctx.descriptor.centroid_path.as_str();
    let precision = agg.interval.and_then(|i| i.as_precision()).unwrap_or(0);

    let kind = match agg.agg_type {
        AggregationType::DateHistogram => BucketKind::DateHistogram {
            interval: agg
                .interval
                .ok_or_else(|| Error::bad_request("A datehistogram aggregation needs an interval"))?,
            format: agg.format.clone(),
        },
        AggregationType::Histogram => BucketKind::Histogram {
            interval: agg.interval.map(|i| i.value).unwrap_or(1.0),
        },
        AggregationType::Term | AggregationType::H3 => BucketKind::Terms {
            size: agg.size.unwrap_or(DEFAULT_TERMS_SIZE),
            include: agg.include.clone(),
        },
        AggregationType::Geohash => BucketKind::Geohash {
            precision: precision as usize,
            size: agg.size.unwrap_or(config.max_bucket_size),
        },
        AggregationType::Geotile => BucketKind::Geotile {
            precision,
            size: agg.size.unwrap_or(config.max_bucket_size),
        },
    };

    let mut metrics = agg
        .metrics
        .iter()
        .map(|metric| lower_metric(metric, ctx))
        .collect::<Result<Vec<_>>>()?;
    for geometry in &agg.aggregated_geometries {
        let function = match geometry {
            AggregatedGeometry::Bbox => MetricKind::GeoBbox,
            AggregatedGeometry::Centroid => MetricKind::GeoCentroid,
            AggregatedGeometry::Cell | AggregatedGeometry::CellCenter => continue,
        };
        metrics.push(MetricRequest {
            name: bucket_geometry_name(function, centroid),
            kind: function,
            field: centroid.to_string(),
        });
    }

    let mut top_hits: Vec<TopHitsRequest> = Vec::new();
    for raw in &agg.raw_geometries {
        let sort = if raw.sort.is_empty() {
            default_geometry_sort(ctx)?
        } else {
            bind_geo_distance(&raw.sort, centroid)
        };
        let name = format!("{}{}", RAW_GEOMETRIES_PREFIX, exql::sort_to_string(&sort));
        match top_hits.iter_mut().find(|hits| hits.name == name) {
            Some(group) => group.includes.push(raw.field.clone()),
            None => top_hits.push(TopHitsRequest {
                name,
                size: 1,
                sort,
                includes: vec![raw.field.clone()],
            }),
        }
    }
    if let Some(fetch) = &agg.fetch_hits {
        top_hits.push(TopHitsRequest {
            name: FETCHED_HITS.to_string(),
            size: fetch.size,
            sort: bind_geo_distance(&fetch.sort, centroid),
            includes: if fetch.include.is_empty() {
                vec!["*".to_string()]
            } else {
                fetch.include.clone()
            },
        });
    }

    let order = match (agg.order, agg.on) {
        (Some(order), Some(OrderOn::Field)) => Some(BucketOrder::Key(order)),
        (Some(order), Some(OrderOn::Count)) => Some(BucketOrder::Count(order)),
        (Some(order), Some(OrderOn::Result)) => first_scalar_metric(agg).map(|m| BucketOrder::Metric {
            name: metric_name(m.function, &m.field),
            order,
        }),
        _ => None,
    };

    Ok(BucketRequest {
        name: level_name(agg),
        kind,
        field: bucket_field(agg),
        order,
        metrics,
        top_hits,
        sub: None,
    })
}

fn default_geometry_sort(ctx: AggregationContext<'_>) -> Result<Vec<SortTerm>> {
    let sort = match &ctx.config.default_geometry_sort {
        Some(sort) => exql::parse_sort(sort)?,
        None => exql::parse_sort(&format!("-{}", ctx.descriptor.timestamp_path))?,
    };
    Ok(bind_geo_distance(&sort, &ctx.descriptor.centroid_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields() -> FieldTree {
        FieldTree::from_mapping(&json!({
            "properties": {
                "id": { "type": "keyword", "fields": { "hash": { "type": "murmur3" } } },
                "ts": { "type": "date" },
                "speed": { "type": "float" },
                "name": { "type": "text" },
                "h3": { "properties": { "7": { "type": "keyword" } } },
                "geo": { "properties": {
                    "centroid": { "type": "geo_point" },
                    "track": { "type": "geo_shape" }
                } }
            }
        }))
    }

    fn descriptor() -> CollectionDescriptor {
        let mut descriptor = CollectionDescriptor::new("ais", "ais");
        descriptor.centroid_path = "geo.centroid".into();
        descriptor.geometry_path = "geo.track".into();
        descriptor.timestamp_path = "ts".into();
        descriptor
    }

    fn check(spec: &[&str], geo: bool) -> Result<()> {
        let aggs = exql::parse_aggregations(spec)?;
        let (descriptor, fields, config) = (descriptor(), fields(), ExplorerConfig::default());
        validate(
            &aggs,
            geo,
            AggregationContext {
                descriptor: &descriptor,
                fields: &fields,
                config: &config,
            },
        )
    }

    fn lower(spec: &[&str]) -> BucketRequest {
        let aggs = exql::parse_aggregations(spec).unwrap();
        let (descriptor, fields, config) = (descriptor(), fields(), ExplorerConfig::default());
        to_bucket_request(
            &aggs,
            AggregationContext {
                descriptor: &descriptor,
                fields: &fields,
                config: &config,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_valid_requests() {
        assert!(check(&["datehistogram:ts:interval-1day:format-yyyy-MM-dd"], false).is_ok());
        assert!(matches!(
            check(&["datehistogram:ts:interval-1day:format-yyyy-QQ"], false),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(check(&["term:id:size-5", "histogram:speed:interval-10"], false).is_ok());
        assert!(check(&["geohash:geo.centroid:interval-5:aggregated_geometries-bbox,cell"], true).is_ok());
        assert!(check(&["h3:h3:interval-7"], false).is_ok());
    }

    #[test]
    fn test_geo_request_must_start_with_a_grid() {
        assert!(matches!(
            check(&["term:id"], true),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_missing_interval() {
        assert!(matches!(check(&["histogram:speed"], false), Err(Error::BadRequest { .. })));
        assert!(check(&["geohash:geo.centroid:interval-13"], false).is_err());
        assert!(check(&["datehistogram:ts:interval-2month"], false).is_err());
    }

    #[test]
    fn test_field_checks() {
        assert!(matches!(check(&["term:nope"], false), Err(Error::FieldNotFound { .. })));
        assert!(matches!(check(&["term:name"], false), Err(Error::InvalidParameter { .. })));
        assert!(check(&["term:id:collect_field-id:collect_fct-avg"], false).is_err());
        assert!(check(&["term:id:raw_geometries-speed"], false).is_err());
    }

    #[test]
    fn test_cell_geometries_need_a_grid() {
        assert!(matches!(
            check(&["term:id:aggregated_geometries-cell"], false),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(check(&["term:id:aggregated_geometries-centroid"], false).is_ok());
    }

    #[test]
    fn test_order_combinations() {
        assert!(check(&["term:id:order-asc"], false).is_err());
        assert!(check(&["term:id:order-asc:on-count"], false).is_ok());
        assert!(check(&["geohash:geo.centroid:interval-3:order-asc:on-field"], false).is_err());
        assert!(check(&["term:id:order-desc:on-result"], false).is_err());
        assert!(check(&["term:id:order-desc:on-result:collect_field-speed:collect_fct-max"], false).is_ok());
    }

    #[test]
    fn test_fetch_hits_bounds() {
        assert!(check(&["term:id:fetch_hits-100"], false).is_ok());
        assert!(matches!(
            check(&["term:id:fetch_hits-101"], false),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_lowering_nests_levels() {
        let request = lower(&["term:id:size-3", "datehistogram:ts:interval-1hour"]);
        assert_eq!(request.name, "term:id");
        assert_eq!(request.kind, BucketKind::Terms { size: 3, include: None });
        let sub = request.sub.unwrap();
        assert_eq!(sub.field, "ts");
        assert!(sub.sub.is_none());
    }

    #[test]
    fn test_lowering_metrics_and_geometries() {
        let request = lower(&[
            "geohash:geo.centroid:interval-4:collect_field-id:collect_fct-cardinality:aggregated_geometries-bbox,cell",
        ]);
        assert_eq!(request.metrics.len(), 2);
        assert_eq!(request.metrics[0].name, "cardinality:id");
        assert_eq!(request.metrics[0].field, "id.hash");
        assert_eq!(request.metrics[1].name, "geobbox:geo.centroid-bucket");
        assert_eq!(request.metrics[1].kind, MetricKind::GeoBbox);
    }

    #[test]
    fn test_lowering_raw_geometries_groups_by_sort() {
        let request = lower(&["geohash:geo.centroid:interval-4:raw_geometries-geo.track,geo.centroid;geo.track(-speed)"]);
        assert_eq!(request.top_hits.len(), 2);
        assert_eq!(request.top_hits[0].name, "raw_geometries:-ts");
        assert_eq!(request.top_hits[0].includes, vec!["geo.track", "geo.centroid"]);
        assert_eq!(request.top_hits[1].name, "raw_geometries:-speed");
    }

    #[test]
    fn test_h3_buckets_on_resolution_field() {
        let request = lower(&["h3:h3:interval-7"]);
        assert_eq!(request.field, "h3.7");
    }

    #[test]
    fn test_order_on_result_targets_first_metric() {
        let request = lower(&["term:id:order-desc:on-result:collect_field-speed:collect_fct-max"]);
        assert_eq!(
            request.order,
            Some(BucketOrder::Metric {
                name: "max:speed".into(),
                order: exql::SortOrder::Desc
            })
        );
    }
}
