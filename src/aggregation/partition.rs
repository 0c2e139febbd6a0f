//! Spatial partitioning of over-precise geo-aggregations
//!
//! A geohash level much finer than the requested cell, or a geotile level
//! seven zooms below it, is split into the four quadrants of the cell. Each
//! quadrant runs as an independent query restricted to documents whose
//! centroid lies in it; the resulting trees are concatenated, not
//! re-bucketed.

use super::response::AggregationNode;
use crate::error::{Error, Result};
use crate::geo::{self, GeoCell};
use crate::query::PreparedQuery;
use exql::{Aggregation, AggregationType};
use geo_types::Rect;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Geohash levels deeper than this below the cell are split
pub const GEOHASH_SPLIT_DEPTH: u32 = 2;

/// Geotile depth below the cell that is split; deeper is rejected
pub const GEOTILE_SPLIT_DEPTH: u32 = 7;

/// Partition boxes of a geo-aggregation scoped to `cell`, in dispatch order
pub fn plan(aggregation: &Aggregation, cell: &GeoCell) -> Result<Vec<Rect<f64>>> {
    let fits = match cell {
        GeoCell::Geohash(_) => aggregation.agg_type == AggregationType::Geohash,
        GeoCell::Tile { .. } => aggregation.agg_type == AggregationType::Geotile,
    };
    if !fits {
        return Err(Error::bad_request(format!(
            "Cell '{}' cannot scope a {} aggregation",
            cell, aggregation.agg_type
        )));
    }
    let precision = aggregation
        .interval
        .and_then(|interval| interval.as_precision())
        .ok_or_else(|| Error::bad_request("A geo aggregation needs an integer precision"))?;
    let (bounds, level) = (cell.bounds()?, cell.level());

    let split = match aggregation.agg_type {
        AggregationType::Geotile => {
            let depth = precision.saturating_sub(level);
            if depth > GEOTILE_SPLIT_DEPTH {
                return Err(Error::invalid_parameter(format!(
                    "Geotile precision {} is more than {} levels below zoom {}",
                    precision, GEOTILE_SPLIT_DEPTH, level
                )));
            }
            depth == GEOTILE_SPLIT_DEPTH
        }
        _ => precision.saturating_sub(level) > GEOHASH_SPLIT_DEPTH,
    };

    let partitions = if split {
        geo::split_quadrants(&bounds).to_vec()
    } else {
        vec![bounds]
    };
    debug!(
        kind = %aggregation.agg_type,
        precision,
        level,
        partitions = partitions.len(),
        "Planned geo aggregation"
    );
    Ok(partitions)
}

/// Run one query per partition concurrently and merge the trees.
///
/// Any failing partition fails the whole request.
pub async fn execute(
    query: &PreparedQuery,
    partitions: &[Rect<f64>],
    epsilon: f64,
) -> Result<AggregationNode> {
    let mut tasks = JoinSet::new();
    for (i, rect) in partitions.iter().enumerate() {
        let partition = query.within(&geo::shrink(rect, epsilon));
        tasks.spawn(async move { (i, partition.execute().await) });
    }

    let mut trees: Vec<Option<AggregationNode>> = vec![None; partitions.len()];
    while let Some(joined) = tasks.join_next().await {
        let (i, outcome) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                tasks.abort_all();
                return Err(Error::Partition {
                    message: format!("Partition task failed: {}", e),
                });
            }
        };
        match outcome.map(|outcome| outcome.aggregation) {
            Ok(Some(tree)) => trees[i] = Some(tree),
            Ok(None) => {
                tasks.abort_all();
                return Err(Error::Partition {
                    message: format!("Partition {} returned no aggregation", i),
                });
            }
            Err(e) => {
                warn!(partition = i, error = %e, "Partition query failed");
                tasks.abort_all();
                return Err(e);
            }
        }
    }

    merge(trees.into_iter().flatten().collect())
}

/// Concatenate partition trees in dispatch order.
///
/// Counts are summed; buckets of the same key in two partitions stay apart.
pub fn merge(mut trees: Vec<AggregationNode>) -> Result<AggregationNode> {
    if trees.len() == 1 {
        return Ok(trees.remove(0));
    }
    let mut trees = trees.into_iter();
    let Some(first) = trees.next() else {
        return Err(Error::Partition {
            message: "No partition to merge".to_string(),
        });
    };

    let mut merged = AggregationNode::new(first.name.clone(), 0);
    for tree in std::iter::once(first).chain(trees) {
        merged.count += tree.count;
        if let Some(other) = tree.sum_other_doc_count {
            *merged.sum_other_doc_count.get_or_insert(0) += other;
        }
        merged.metrics.extend(tree.metrics);
        append(&mut merged.elements, tree.elements);
        append(&mut merged.hits, tree.hits);
        append(&mut merged.geometries, tree.geometries);
    }
    Ok(merged)
}

fn append<T>(into: &mut Option<Vec<T>>, from: Option<Vec<T>>) {
    if let Some(from) = from {
        into.get_or_insert_with(Vec::new).extend(from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExplorerConfig;
    use crate::geo::geohash;
    use crate::query::request::SearchRequest;
    use crate::query::QueryBuilder;
    use crate::schema::{CollectionDescriptor, FieldTree};
    use crate::security::ColumnFilter;
    use crate::storage::{BackendError, MemoryBackend, QueryBackend, SearchResponse};
    use async_trait::async_trait;
    use exql::FilterValue;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    /// One document per quadrant of cell `s` (0..45 in both axes), in
    /// south-west, south-east, north-west, north-east order
    const POINTS: [(f64, f64); 4] = [(10.0, 10.0), (30.0, 10.0), (10.0, 30.0), (30.0, 30.0)];

    /// Delegates to a memory backend after a per-quadrant delay; the first
    /// quadrant is the slowest, so completion order is the reverse of
    /// dispatch order
    struct QuadrantBackend {
        inner: MemoryBackend,
        failing: Option<usize>,
        dispatched: Mutex<Vec<exql::BoundingBox>>,
        completed: Mutex<Vec<usize>>,
    }

    impl QuadrantBackend {
        fn new(failing: Option<usize>) -> Self {
            let inner = MemoryBackend::new();
            inner.create_index(
                "ais",
                json!({ "properties": {
                    "id": { "type": "keyword" },
                    "geo": { "properties": { "centroid": { "type": "geo_point" } } }
                } }),
            );
            let docs: Vec<Value> = POINTS
                .iter()
                .enumerate()
                .map(|(i, (lon, lat))| json!({ "id": i.to_string(), "geo": { "centroid": { "lat": lat, "lon": lon } } }))
                .collect();
            inner.index_documents("ais", docs).unwrap();
            Self {
                inner,
                failing,
                dispatched: Mutex::new(Vec::new()),
                completed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl QueryBackend for QuadrantBackend {
        async fn search(&self, request: &SearchRequest) -> std::result::Result<SearchResponse, BackendError> {
            let bbox = request
                .predicates
                .last()
                .and_then(|p| match &p.clause.any_of[0].value {
                    FilterValue::BoundingBox(bbox) => Some(*bbox),
                    _ => None,
                })
                .ok_or_else(|| BackendError::Other("missing partition box".into()))?;
            self.dispatched.lock().push(bbox);

            let east = (bbox.west + bbox.east) / 2.0 > 22.5;
            let north = (bbox.south + bbox.north) / 2.0 > 22.5;
            let quadrant = usize::from(east) + 2 * usize::from(north);
            if self.failing == Some(quadrant) {
                return Err(BackendError::Other(format!("quadrant {} is down", quadrant)));
            }
            tokio::time::sleep(Duration::from_millis(40 - 10 * quadrant as u64)).await;
            let response = self.inner.search(request).await;
            self.completed.lock().push(quadrant);
            response
        }
    }

    fn prepared(backend: Arc<QuadrantBackend>) -> PreparedQuery {
        let mut descriptor = CollectionDescriptor::new("ais", "ais");
        descriptor.centroid_path = "geo.centroid".into();
        let fields = FieldTree::from_mapping(&json!({ "properties": {
            "id": { "type": "keyword" },
            "geo": { "properties": { "centroid": { "type": "geo_point" } } }
        } }));
        let config = ExplorerConfig::default();
        let open = ColumnFilter::unrestricted();
        let mut builder = QueryBuilder::new(&descriptor, &fields, &open, &config, backend).unwrap();
        builder.aggregate(&[agg("geohash:geo.centroid:interval-4")], true).unwrap();
        builder.build().unwrap()
    }

    fn agg(spec: &str) -> Aggregation {
        exql::parse_aggregation(spec).unwrap()
    }

    #[test]
    fn test_geohash_split_threshold() {
        let cell = GeoCell::parse("u4").unwrap();
        assert_eq!(plan(&agg("geohash:geo:interval-4"), &cell).unwrap().len(), 1);
        let quadrants = plan(&agg("geohash:geo:interval-5"), &cell).unwrap();
        assert_eq!(quadrants.len(), 4);

        let bounds = cell.bounds().unwrap();
        assert_eq!(quadrants[0].min(), bounds.min());
        assert_eq!(quadrants[3].max(), bounds.max());
    }

    #[test]
    fn test_geotile_split_rules() {
        let cell = GeoCell::parse("3/4/2").unwrap();
        assert_eq!(plan(&agg("geotile:geo:interval-9"), &cell).unwrap().len(), 1);
        assert_eq!(plan(&agg("geotile:geo:interval-10"), &cell).unwrap().len(), 4);
        assert!(matches!(
            plan(&agg("geotile:geo:interval-11"), &cell),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_cell_kind_must_match() {
        let tile = GeoCell::parse("3/4/2").unwrap();
        assert!(matches!(
            plan(&agg("geohash:geo:interval-5"), &tile),
            Err(Error::BadRequest { .. })
        ));
        let hash = GeoCell::parse("u4").unwrap();
        assert!(plan(&agg("term:kind"), &hash).is_err());
    }

    #[test]
    fn test_merge_concatenates() {
        let mut a = AggregationNode::new("geohash:geo", 3);
        let mut bucket = AggregationNode::new("geohash:geo", 3);
        bucket.key_as_string = Some("u4pr".into());
        a.elements = Some(vec![bucket.clone()]);

        let mut b = AggregationNode::new("geohash:geo", 2);
        b.elements = Some(vec![bucket.clone(), bucket]);
        b.hits = Some(vec![json!({ "id": 1 })]);

        let merged = merge(vec![a, b]).unwrap();
        assert_eq!(merged.count, 5);
        assert_eq!(merged.elements.as_ref().unwrap().len(), 3);
        assert_eq!(merged.hits.as_ref().unwrap().len(), 1);
        assert!(merged.geometries.is_none());
    }

    #[test]
    fn test_merge_single_is_unchanged() {
        let mut only = AggregationNode::new("geotile:geo", 4);
        only.elements = Some(Vec::new());
        assert_eq!(merge(vec![only.clone()]).unwrap(), only);
        assert!(merge(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_execute_concatenates_in_dispatch_order() {
        let backend = Arc::new(QuadrantBackend::new(None));
        let cell = GeoCell::parse("s").unwrap();
        let partitions = plan(&agg("geohash:geo.centroid:interval-4"), &cell).unwrap();
        assert_eq!(partitions.len(), 4);

        let tree = execute(&prepared(backend.clone()), &partitions, 1e-6).await.unwrap();
        assert_eq!(tree.count, 4);
        let keys: Vec<String> = tree
            .elements
            .unwrap()
            .into_iter()
            .filter_map(|bucket| bucket.key_as_string)
            .collect();
        let expected: Vec<String> = POINTS.iter().map(|(lon, lat)| geohash::encode(*lon, *lat, 4)).collect();
        assert_eq!(keys, expected);

        assert_eq!(*backend.completed.lock(), vec![3, 2, 1, 0]);
        let dispatched = backend.dispatched.lock();
        assert_eq!(dispatched.len(), 4);
        for rect in &partitions {
            let shrunk = geo::to_bounding_box(&geo::shrink(rect, 1e-6));
            assert!(dispatched.contains(&shrunk));
        }
    }

    #[tokio::test]
    async fn test_execute_fails_fast() {
        let backend = Arc::new(QuadrantBackend::new(Some(3)));
        let cell = GeoCell::parse("s").unwrap();
        let partitions = plan(&agg("geohash:geo.centroid:interval-4"), &cell).unwrap();

        let err = execute(&prepared(backend.clone()), &partitions, 1e-6).await.unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
        assert!(backend.completed.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(backend.completed.lock().is_empty());
    }
}
