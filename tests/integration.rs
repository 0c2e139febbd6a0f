//! Integration tests for Explora
//!
//! Drive the explorer end to end over the in-memory backend: schema
//! resolution, column filtering, paging, aggregations and partitioning.

use explora::schema::OrganisationPolicy;
use explora::storage::{FileDescriptorStore, MemoryBackend, MemoryDescriptorStore};
use explora::{
    AggregateParams, CallerContext, CollectionDescriptor, Error, ErrorKind, Explorer, ExplorerConfig,
    Filters, GeoCell, MetricKind, MetricValue, SearchParams,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

fn mapping() -> Value {
    json!({
        "properties": {
            "id": { "type": "keyword" },
            "ts": { "type": "date" },
            "speed": { "type": "float" },
            "kind": { "type": "keyword" },
            "name": { "type": "text" },
            "geometry": { "type": "geo_shape" },
            "geo": { "properties": {
                "centroid": { "type": "geo_point" },
                "box": { "properties": {
                    "w": { "type": "double" },
                    "e": { "type": "double" },
                    "n": { "type": "double" },
                    "s": { "type": "double" }
                } }
            } }
        }
    })
}

fn vessel(id: &str, ts: i64, speed: f64, kind: &str, lat: f64, lon: f64) -> Value {
    json!({
        "id": id,
        "ts": ts,
        "speed": speed,
        "kind": kind,
        "name": format!("{} {}", kind, id),
        "geometry": { "type": "Point", "coordinates": [lon, lat] },
        "geo": {
            "centroid": { "lat": lat, "lon": lon },
            "box": { "w": lon, "e": lon, "n": lat, "s": lat }
        }
    })
}

fn documents() -> Vec<Value> {
    vec![
        vessel("a", 1000, 10.0, "cargo", 43.6, 1.44),
        vessel("b", 2000, 20.0, "cargo", 45.7, 4.8),
        vessel("c", 3000, 30.0, "tanker", 48.85, 2.35),
        vessel("d", 4000, 40.0, "tanker", 43.3, 5.37),
        vessel("e", 5000, 50.0, "fishing", 47.2, -1.55),
    ]
}

fn descriptor() -> CollectionDescriptor {
    let mut descriptor = CollectionDescriptor::new("ais", "ais-*");
    descriptor.centroid_path = "geo.centroid".into();
    descriptor.timestamp_path = "ts".into();
    descriptor
}

fn backend() -> Arc<MemoryBackend> {
    let backend = MemoryBackend::new();
    backend.create_index("ais-2020", mapping());
    backend.index_documents("ais-2020", documents()).unwrap();
    Arc::new(backend)
}

/// Helper to build an explorer with the `ais` collection registered
async fn setup_explorer() -> Explorer {
    let backend = backend();
    let explorer = Explorer::new(
        ExplorerConfig::default(),
        Arc::new(MemoryDescriptorStore::new()),
        backend.clone(),
        backend,
    )
    .unwrap();
    explorer.register(descriptor(), true).await.unwrap();
    explorer
}

fn filters(clauses: &[&str]) -> Filters {
    Filters {
        clauses: clauses.iter().map(|c| exql::parse_filter(c).unwrap()).collect(),
        ..Filters::default()
    }
}

fn aggregations(specs: &[&str]) -> AggregateParams {
    AggregateParams {
        aggregations: exql::parse_aggregations(specs).unwrap(),
        filters: Filters::default(),
    }
}

fn ids(hits: &[Value]) -> Vec<&str> {
    hits.iter().map(|hit| hit["id"].as_str().unwrap()).collect()
}

fn search_params(sort: &str) -> SearchParams {
    SearchParams {
        sort: exql::parse_sort(sort).unwrap(),
        ..SearchParams::default()
    }
}

// =============================================================================
// Schema and visibility
// =============================================================================

#[tokio::test]
async fn test_describe_applies_column_filter() {
    let explorer = setup_explorer().await;
    let anonymous = explorer.describe("ais", &CallerContext::anonymous()).await.unwrap();
    assert!(anonymous.fields.lookup("speed").is_some());
    assert!(anonymous.fields.lookup("geo.box.w").is_some());

    let ctx = CallerContext::anonymous().with_column_filter("id,geo.centroid");
    let restricted = explorer.describe("ais", &ctx).await.unwrap();
    assert!(restricted.fields.lookup("id").is_some());
    assert!(restricted.fields.lookup("geo.centroid").is_some());
    assert!(restricted.fields.lookup("geo.box").is_none());
    assert!(restricted.fields.lookup("speed").is_none());
}

#[tokio::test]
async fn test_unknown_collection_is_not_found() {
    let explorer = setup_explorer().await;
    let err = explorer.describe("ports", &CallerContext::anonymous()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_register_invalidates_cached_descriptor() {
    let explorer = setup_explorer().await;
    let cached = explorer.resolver().resolve("ais").await.unwrap();
    assert_eq!(cached.description, None);

    let mut updated = descriptor();
    updated.description = Some("AIS positions".into());
    explorer.register(updated, true).await.unwrap();

    let resolved = explorer.resolver().resolve("ais").await.unwrap();
    assert_eq!(resolved.description.as_deref(), Some("AIS positions"));
}

#[tokio::test]
async fn test_register_checks_declared_paths() {
    let explorer = setup_explorer().await;
    let mut broken = descriptor();
    broken.name = "broken".into();
    broken.timestamp_path = "missing".into();

    let err = explorer.register(broken.clone(), true).await.unwrap_err();
    assert!(matches!(err, Error::FieldNotFound { .. }));
    explorer.register(broken, false).await.unwrap();
}

#[tokio::test]
async fn test_organisation_visibility() {
    let explorer = setup_explorer().await;
    let mut private = descriptor();
    private.name = "private".into();
    private.organisations = OrganisationPolicy {
        owner: Some("acme".into()),
        shared: vec!["partner".into()],
        public: false,
    };
    explorer.register(private, true).await.unwrap();

    let outsider = CallerContext::anonymous().with_organisations(["other"]);
    let err = explorer.describe("private", &outsider).await.unwrap_err();
    assert!(matches!(err, Error::CollectionUnavailable { .. }));

    let names: Vec<String> = explorer.list(&outsider).await.unwrap().into_iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["ais"]);

    let partner = CallerContext::anonymous().with_organisations(["partner"]);
    assert!(explorer.describe("private", &partner).await.is_ok());
    assert_eq!(explorer.list(&CallerContext::anonymous()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_column_header_without_entry_hides_collection() {
    let explorer = setup_explorer().await;
    let ctx = CallerContext::anonymous().with_column_filter("ports:id");
    let err = explorer.count("ais", &Filters::default(), &ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CollectionUnavailable);
    assert!(explorer.list(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let backend = backend();
    let open = || {
        Explorer::new(
            ExplorerConfig::default(),
            Arc::new(FileDescriptorStore::open(tmp.path().join("collections"))),
            backend.clone(),
            backend.clone(),
        )
        .unwrap()
    };

    open().register(descriptor(), true).await.unwrap();
    assert!(tmp.path().join("collections/ais.yaml").exists());

    let reopened = open();
    let description = reopened.describe("ais", &CallerContext::anonymous()).await.unwrap();
    assert_eq!(description.descriptor, descriptor());

    reopened.delete("ais").await.unwrap();
    assert!(reopened.list(&CallerContext::anonymous()).await.unwrap().is_empty());
}

// =============================================================================
// Search, count and paging
// =============================================================================

#[tokio::test]
async fn test_count_with_filters() {
    let explorer = setup_explorer().await;
    let ctx = CallerContext::anonymous();
    assert_eq!(explorer.count("ais", &filters(&[]), &ctx).await.unwrap(), 5);
    assert_eq!(explorer.count("ais", &filters(&["speed:gte:20"]), &ctx).await.unwrap(), 4);
    assert_eq!(
        explorer
            .count("ais", &filters(&["kind:eq:cargo;kind:eq:fishing", "speed:lt:50"]), &ctx)
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn test_count_with_formatted_dates() {
    let explorer = setup_explorer().await;
    let ctx = CallerContext::anonymous();
    let dated = |clauses: &[&str]| Filters {
        date_format: Some("yyyy-MM-dd HH:mm:ss".into()),
        ..filters(clauses)
    };

    assert_eq!(explorer.count("ais", &dated(&["ts:gt:1969-12-31 00:00:00"]), &ctx).await.unwrap(), 5);
    assert_eq!(explorer.count("ais", &dated(&["ts:gte:1970-01-01 00:00:03"]), &ctx).await.unwrap(), 3);
    assert_eq!(explorer.count("ais", &dated(&["ts:lt:now"]), &ctx).await.unwrap(), 5);

    let err = explorer
        .count("ais", &dated(&["ts:gt:01/01/1970"]), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

#[tokio::test]
async fn test_filter_on_forbidden_field_is_rejected() {
    let explorer = setup_explorer().await;
    let ctx = CallerContext::anonymous().with_column_filter("id,ts");
    let err = explorer.count("ais", &filters(&["speed:gte:20"]), &ctx).await.unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { .. }));
}

#[tokio::test]
async fn test_search_pages_after_and_before() {
    let explorer = setup_explorer().await;
    let ctx = CallerContext::anonymous();

    let mut params = search_params("ts,id");
    params.size = Some(2);
    params.after = Some(vec!["2000".into(), "b".into()]);
    let page = explorer.search("ais", &params, &ctx).await.unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(ids(&page.hits), vec!["c", "d"]);

    params.after = None;
    params.before = Some(vec!["4000".into(), "d".into()]);
    let page = explorer.search("ais", &params, &ctx).await.unwrap();
    assert_eq!(ids(&page.hits), vec!["b", "c"]);
}

#[tokio::test]
async fn test_cursor_follows_filtered_sort() {
    let explorer = setup_explorer().await;
    let ctx = CallerContext::anonymous().with_column_filter("id,speed");

    let mut params = search_params("-ts,id");
    params.after = Some(vec!["5000".into(), "b".into()]);
    let page = explorer.search("ais", &params, &ctx).await.unwrap();
    assert_eq!(ids(&page.hits), vec!["c", "d", "e"]);
    assert!(page.hits.iter().all(|hit| hit.get("ts").is_none()));
}

#[tokio::test]
async fn test_cursor_misuse_is_bad_request() {
    let explorer = setup_explorer().await;
    let ctx = CallerContext::anonymous();

    let mut both = search_params("ts,id");
    both.after = Some(vec!["1000".into(), "a".into()]);
    both.before = Some(vec!["3000".into(), "c".into()]);
    let err = explorer.search("ais", &both, &ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let mut no_id = search_params("ts");
    no_id.after = Some(vec!["1000".into()]);
    let err = explorer.search("ais", &no_id, &ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let mut with_from = search_params("ts,id");
    with_from.from = 1;
    with_from.after = Some(vec!["1000".into(), "a".into()]);
    assert!(explorer.search("ais", &with_from, &ctx).await.is_err());
}

#[tokio::test]
async fn test_search_projection_keeps_well_known_paths() {
    let explorer = setup_explorer().await;
    let mut params = search_params("id");
    params.includes = Some("speed".into());
    params.size = Some(1);

    let page = explorer.search("ais", &params, &CallerContext::anonymous()).await.unwrap();
    let hit = &page.hits[0];
    assert_eq!(hit["speed"], json!(10.0));
    assert_eq!(hit["id"], json!("a"));
    assert!(hit.get("ts").is_some());
    assert!(hit["geo"].get("centroid").is_some());
    assert!(hit.get("kind").is_none());
}

// =============================================================================
// Aggregations
// =============================================================================

#[tokio::test]
async fn test_forbidden_aggregation_field_is_rejected() {
    let explorer = setup_explorer().await;
    let ctx = CallerContext::anonymous().with_column_filter("id,ts");
    let err = explorer
        .aggregate("ais", &aggregations(&["term:geo.box"]), &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { .. }));
}

#[tokio::test]
async fn test_centroid_geometries_respect_column_filter() {
    let explorer = setup_explorer().await;
    let params = aggregations(&["term:kind:aggregated_geometries-centroid,bbox"]);

    let hidden = CallerContext::anonymous().with_column_filter("id,kind");
    let err = explorer.aggregate("ais", &params, &hidden).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    let located = CallerContext::anonymous().with_column_filter("id,kind,geo.centroid");
    let tree = explorer.aggregate("ais", &params, &located).await.unwrap();
    assert_eq!(tree.elements.as_ref().unwrap().len(), 3);
}

#[tokio::test]
async fn test_term_aggregation_with_metric() {
    let explorer = setup_explorer().await;
    let tree = explorer
        .aggregate(
            "ais",
            &aggregations(&["term:kind:collect_field-speed:collect_fct-avg"]),
            &CallerContext::anonymous(),
        )
        .await
        .unwrap();

    assert_eq!(tree.count, 5);
    let buckets = tree.elements.as_ref().unwrap();
    assert_eq!(buckets.len(), 3);
    assert_eq!(buckets[0].key_as_string.as_deref(), Some("cargo"));
    assert_eq!(buckets[0].count, 2);
    assert_eq!(buckets[0].metrics[0].value.as_f64(), Some(15.0));
    assert!(buckets[0].is_leaf());
    assert!(buckets[0].elements.is_none());
}

#[tokio::test]
async fn test_date_histogram_formats_keys() {
    let explorer = setup_explorer().await;
    let ctx = CallerContext::anonymous();

    let daily = explorer
        .aggregate("ais", &aggregations(&["datehistogram:ts:interval-1day:format-yyyy-MM-dd"]), &ctx)
        .await
        .unwrap();
    let buckets = daily.elements.as_ref().unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].key_as_string.as_deref(), Some("1970-01-01"));
    assert_eq!(buckets[0].count, 5);

    let yearly = explorer
        .aggregate("ais", &aggregations(&["datehistogram:ts:interval-1year"]), &ctx)
        .await
        .unwrap();
    let buckets = yearly.elements.as_ref().unwrap();
    assert_eq!(buckets[0].key_as_string.as_deref(), Some("1970-01-01T00:00:00.000Z"));
}

#[tokio::test]
async fn test_flatten_leaf_bucket() {
    let explorer = setup_explorer().await;
    let tree = explorer
        .aggregate(
            "ais",
            &aggregations(&["term:kind:collect_field-speed:collect_fct-avg"]),
            &CallerContext::anonymous(),
        )
        .await
        .unwrap();

    let leaf = &tree.elements.as_ref().unwrap()[0];
    let flat = explorer.flatten(leaf);
    let keys: Vec<&str> = flat.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["count", "key", "key_as_string", "metrics_speed_avg"]);

    let whole = explorer.flatten(&tree);
    assert_eq!(whole["0_key"], json!("cargo"));
    assert!(whole.keys().all(|key| !key.contains("elements")));
}

#[tokio::test]
async fn test_compute_metrics() {
    let explorer = setup_explorer().await;
    let ctx = CallerContext::anonymous();

    let avg = explorer
        .compute("ais", &filters(&["kind:eq:tanker"]), "speed", MetricKind::Avg, &ctx)
        .await
        .unwrap();
    assert_eq!(avg.total, 2);
    assert_eq!(avg.metric.value.as_f64(), Some(35.0));

    let bbox = explorer
        .compute("ais", &Filters::default(), "geo.centroid", MetricKind::GeoBbox, &ctx)
        .await
        .unwrap();
    assert!(matches!(bbox.metric.value, MetricValue::Geometry(_)));

    let err = explorer
        .compute("ais", &Filters::default(), "kind", MetricKind::Avg, &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

#[tokio::test]
async fn test_geo_aggregate_partitions_conserve_counts() {
    let explorer = setup_explorer().await;
    let ctx = CallerContext::anonymous();
    let params = aggregations(&["geohash:geo.centroid:interval-4"]);
    let cell = GeoCell::parse("u").unwrap();

    let merged = explorer.geo_aggregate("ais", &params, Some(&cell), &ctx).await.unwrap();
    let inside = explorer
        .count("ais", &filters(&["geo.centroid:within:0,45,45,90"]), &ctx)
        .await
        .unwrap();
    assert_eq!(inside, 2);
    assert_eq!(merged.count, inside);

    let buckets = merged.elements.as_ref().unwrap();
    assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), inside);
    let mut keys: Vec<&str> = buckets.iter().filter_map(|b| b.key_as_string.as_deref()).collect();
    keys.sort();
    assert_eq!(keys.len(), 2);
    assert!(keys.iter().all(|key| key.starts_with('u') && key.len() == 4));
}

#[tokio::test]
async fn test_geo_aggregate_without_cell_is_not_partitioned() {
    let explorer = setup_explorer().await;
    let tree = explorer
        .geo_aggregate(
            "ais",
            &aggregations(&["geohash:geo.centroid:interval-1"]),
            None,
            &CallerContext::anonymous(),
        )
        .await
        .unwrap();
    assert_eq!(tree.count, 5);
    assert_eq!(tree.elements.as_ref().unwrap().iter().map(|b| b.count).sum::<u64>(), 5);
}

#[tokio::test]
async fn test_geo_aggregate_needs_geo_first_level() {
    let explorer = setup_explorer().await;
    let err = explorer
        .geo_aggregate("ais", &aggregations(&["term:kind"]), None, &CallerContext::anonymous())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}
