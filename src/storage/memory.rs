//! In-memory backend over JSON documents
//!
//! Evaluates a [`SearchRequest`] the way a document store would: predicates
//! and full-text clauses select documents, the selection is sorted, paged
//! and projected, and bucket aggregations group it recursively. Dates are
//! stored as epoch millis; date histograms bucket them on the UTC calendar.
//!
//! Indices can be loaded from a directory of `{index}.json` files:
//!
//! ```json
//! {
//!   "mapping": { "properties": { "id": { "type": "keyword" } } },
//!   "documents": [ { "id": "a" } ],
//!   "aliases": [ "all" ]
//! }
//! ```

use super::{
    BackendError, DescriptorStore, MappingSource, QueryBackend, RawAggregation, RawBounds,
    RawBucket, RawFieldTree, RawMetricValue, SearchResponse,
};
use crate::error::{Error, Result};
use crate::geo::{self, geohash, tile};
use crate::query::date::{self, DateFormat};
use crate::query::filter::{
    self, as_number, compare_docs, compare_values, field_values, is_after_cursor, value_to_string,
};
use crate::query::request::{
    BucketKind, BucketOrder, BucketRequest, MetricKind, MetricRequest, SearchRequest,
    TopHitsRequest,
};
use crate::schema::{glob_to_regex, CollectionDescriptor};
use async_trait::async_trait;
use exql::SortOrder;
use geo_types::Point;
use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

type BackendResult<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Default)]
struct MemoryIndex {
    mapping: Value,
    documents: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct IndexFile {
    #[serde(default)]
    mapping: Value,
    #[serde(default)]
    documents: Vec<Value>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Document store held in memory
#[derive(Debug, Default)]
pub struct MemoryBackend {
    indices: RwLock<BTreeMap<String, MemoryIndex>>,
    aliases: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index, or replace the mapping of an existing one
    pub fn create_index(&self, name: impl Into<String>, mapping: Value) {
        self.indices.write().entry(name.into()).or_default().mapping = mapping;
    }

    pub fn index_documents<I>(&self, index: &str, documents: I) -> BackendResult<()>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut indices = self.indices.write();
        let target = indices
            .get_mut(index)
            .ok_or_else(|| BackendError::IndexNotFound {
                index: index.to_string(),
            })?;
        target.documents.extend(documents);
        Ok(())
    }

    pub fn add_alias(&self, alias: impl Into<String>, index: impl Into<String>) {
        self.aliases
            .write()
            .entry(alias.into())
            .or_default()
            .insert(index.into());
    }

    /// Load every `{index}.json` file of a directory
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let backend = Self::new();
        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.extension().map_or(false, |ext| ext == "json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let content = std::fs::read_to_string(path).map_err(|source| Error::StoreReadError {
                path: path.to_path_buf(),
                source,
            })?;
            let file: IndexFile = serde_json::from_str(&content)
                .map_err(|e| Error::Other(format!("{}: {}", path.display(), e)))?;

            let count = file.documents.len();
            backend.create_index(name, file.mapping);
            backend.index_documents(name, file.documents)?;
            for alias in file.aliases {
                backend.add_alias(alias, name);
            }
            debug!(index = name, documents = count, "Loaded index");
        }
        Ok(backend)
    }

    /// Index names behind a name, an alias, a `*` pattern or a comma list
    fn resolve(&self, pattern: &str) -> Vec<String> {
        let indices = self.indices.read();
        let aliases = self.aliases.read();
        let mut names = BTreeSet::new();

        for part in pattern.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if let Some(targets) = aliases.get(part) {
                names.extend(targets.iter().filter(|t| indices.contains_key(*t)).cloned());
            } else if part.contains('*') {
                if let Ok(re) = glob_to_regex(part) {
                    names.extend(indices.keys().filter(|name| re.is_match(name)).cloned());
                }
            } else if indices.contains_key(part) {
                names.insert(part.to_string());
            }
        }
        names.into_iter().collect()
    }

    fn mappings(&self, pattern: &str) -> BTreeMap<String, RawFieldTree> {
        let names = self.resolve(pattern);
        let indices = self.indices.read();
        names
            .into_iter()
            .filter_map(|name| {
                let mapping = indices.get(&name)?.mapping.clone();
                Some((name, mapping))
            })
            .collect()
    }

    fn run(&self, request: &SearchRequest) -> BackendResult<SearchResponse> {
        let names = self.resolve(&request.index);
        if names.is_empty() {
            return Err(BackendError::IndexNotFound {
                index: request.index.clone(),
            });
        }

        let indices = self.indices.read();
        let matching: Vec<&Value> = names
            .iter()
            .filter_map(|name| indices.get(name))
            .flat_map(|index| index.documents.iter())
            .filter(|doc| request.predicates.iter().all(|p| filter::matches(p, doc)))
            .filter(|doc| {
                request
                    .full_text
                    .iter()
                    .all(|clause| filter::matches_full_text(clause, doc))
            })
            .collect();

        let mut aggregations = Vec::new();
        if let Some(bucket) = &request.aggregation {
            aggregations.push(buckets(bucket, &matching)?);
        }
        for metric in &request.metrics {
            aggregations.push(metric_aggregation(metric, &matching)?);
        }

        let hits = if request.size == 0 {
            Vec::new()
        } else {
            let projection = Projection::new(&request.includes, &request.excludes)?;
            let mut sorted = matching.clone();
            sorted.sort_by(|a, b| compare_docs(a, b, &request.sort));
            sorted
                .into_iter()
                .filter(|doc| {
                    request
                        .search_after
                        .as_ref()
                        .map_or(true, |cursor| is_after_cursor(doc, &request.sort, cursor))
                })
                .skip(request.from)
                .take(request.size)
                .map(|doc| projection.apply(doc))
                .collect()
        };

        Ok(SearchResponse {
            total: matching.len() as u64,
            hits,
            aggregations,
        })
    }
}

#[async_trait]
impl MappingSource for MemoryBackend {
    async fn get_mapping(&self, index: &str) -> BackendResult<BTreeMap<String, RawFieldTree>> {
        Ok(self.mappings(index))
    }

    async fn get_all_mappings(&self, pattern: &str) -> BackendResult<BTreeMap<String, RawFieldTree>> {
        Ok(self.mappings(pattern))
    }
}

#[async_trait]
impl QueryBackend for MemoryBackend {
    async fn search(&self, request: &SearchRequest) -> BackendResult<SearchResponse> {
        self.run(request)
    }
}

/// Source filtering of returned documents
struct Projection {
    everything: bool,
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl Projection {
    fn new(includes: &[String], excludes: &[String]) -> BackendResult<Self> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| glob_to_regex(p).map_err(|e| BackendError::Unsupported(e.to_string())))
                .collect::<BackendResult<Vec<_>>>()
        };
        Ok(Self {
            everything: excludes.is_empty() && includes.iter().any(|p| p == "*"),
            includes: compile(includes)?,
            excludes: compile(excludes)?,
        })
    }

    fn apply(&self, doc: &Value) -> Value {
        match doc {
            _ if self.everything => doc.clone(),
            Value::Object(map) => Value::Object(self.level(map, "", false)),
            other => other.clone(),
        }
    }

    fn level(&self, map: &Map<String, Value>, prefix: &str, included: bool) -> Map<String, Value> {
        let mut out = Map::new();
        for (key, value) in map {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            if covered(&path, &self.excludes) {
                continue;
            }
            let included = included || covered(&path, &self.includes);
            match value {
                Value::Object(children) => {
                    let projected = self.level(children, &path, included);
                    if included || !projected.is_empty() {
                        out.insert(key.clone(), Value::Object(projected));
                    }
                }
                leaf if included => {
                    out.insert(key.clone(), leaf.clone());
                }
                _ => {}
            }
        }
        out
    }
}

fn covered(path: &str, patterns: &[Regex]) -> bool {
    patterns.iter().any(|re| re.is_match(path))
}

/// Array items count as separate values
fn scalars<'a>(values: &[&'a Value]) -> Vec<&'a Value> {
    values
        .iter()
        .flat_map(|value| match value {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![*other],
        })
        .collect()
}

fn number(value: &Value, field: &str) -> BackendResult<f64> {
    match value {
        Value::Number(_) => as_number(value),
        _ => None,
    }
    .ok_or_else(|| BackendError::NonNumericField {
        field: field.to_string(),
    })
}

fn points(values: &[&Value]) -> Vec<Point<f64>> {
    values.iter().filter_map(|v| geo::point_from_value(v)).collect()
}

fn directed(ordering: Ordering, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Asc => ordering,
        SortOrder::Desc => ordering.reverse(),
    }
}

struct Group<'d> {
    key: Value,
    docs: Vec<&'d Value>,
}

fn buckets(request: &BucketRequest, docs: &[&Value]) -> BackendResult<RawAggregation> {
    let include = match &request.kind {
        BucketKind::Terms {
            include: Some(pattern),
            ..
        } => Some(
            Regex::new(&format!("^(?:{})$", pattern))
                .map_err(|e| BackendError::Unsupported(format!("include '{}': {}", pattern, e)))?,
        ),
        _ => None,
    };

    let date_format = match &request.kind {
        BucketKind::DateHistogram { format: Some(format), .. } => Some(
            DateFormat::parse(format)
                .ok_or_else(|| BackendError::Unsupported(format!("date format '{}'", format)))?,
        ),
        BucketKind::DateHistogram { format: None, .. } => Some(DateFormat::iso()),
        _ => None,
    };

    let mut groups: BTreeMap<String, Group> = BTreeMap::new();
    for &doc in docs {
        let mut seen = BTreeSet::new();
        for key in bucket_keys(request, doc)? {
            let id = value_to_string(&key);
            if include.as_ref().map_or(false, |re| !re.is_match(&id)) || !seen.insert(id.clone()) {
                continue;
            }
            groups
                .entry(id)
                .or_insert_with(|| Group {
                    key,
                    docs: Vec::new(),
                })
                .docs
                .push(doc);
        }
    }

    let mut buckets = groups
        .into_values()
        .map(|group| {
            let mut aggregations = Vec::new();
            for metric in &request.metrics {
                aggregations.push(metric_aggregation(metric, &group.docs)?);
            }
            for hits in &request.top_hits {
                aggregations.push(top_hits(hits, &group.docs)?);
            }
            if let Some(sub) = &request.sub {
                aggregations.push(buckets(sub, &group.docs)?);
            }
            let key_as_string = date_format
                .as_ref()
                .zip(group.key.as_i64())
                .and_then(|(format, millis)| format.format_millis(millis));
            Ok(RawBucket {
                key: group.key,
                key_as_string,
                doc_count: group.docs.len() as u64,
                aggregations,
            })
        })
        .collect::<BackendResult<Vec<_>>>()?;
    sort_buckets(&mut buckets, request);

    let mut sum_other_doc_count = None;
    match request.kind {
        BucketKind::Terms { size, .. } => {
            let dropped = buckets.split_off(size.min(buckets.len()));
            sum_other_doc_count = Some(dropped.iter().map(|b| b.doc_count).sum());
        }
        BucketKind::Geohash { size, .. } | BucketKind::Geotile { size, .. } => buckets.truncate(size),
        _ => {}
    }

    Ok(RawAggregation::Buckets {
        name: request.name.clone(),
        sum_other_doc_count,
        buckets,
    })
}

fn bucket_keys(request: &BucketRequest, doc: &Value) -> BackendResult<Vec<Value>> {
    let values = field_values(doc, &request.field);
    match &request.kind {
        BucketKind::Terms { .. } => Ok(scalars(&values).into_iter().cloned().collect()),
        BucketKind::Histogram { interval } => scalars(&values)
            .into_iter()
            .map(|v| Ok(json!((number(v, &request.field)? / interval).floor() * interval)))
            .collect(),
        BucketKind::DateHistogram { interval, .. } => {
            let unit = interval
                .unit
                .filter(|_| interval.value >= 1.0 && interval.value.fract() == 0.0)
                .ok_or_else(|| BackendError::Unsupported(format!("date interval {}", interval)))?;
            scalars(&values)
                .into_iter()
                .map(|v| {
                    let millis = number(v, &request.field)? as i64;
                    date::bucket_start(millis, unit, interval.value as i64)
                        .map(|start| json!(start))
                        .ok_or_else(|| BackendError::Unsupported(format!("date {} out of range", millis)))
                })
                .collect()
        }
        BucketKind::Geohash { precision, .. } => Ok(points(&values)
            .into_iter()
            .map(|p| Value::String(geohash::encode(p.x(), p.y(), *precision)))
            .collect()),
        BucketKind::Geotile { precision, .. } => Ok(points(&values)
            .into_iter()
            .map(|p| {
                let (x, y) = tile::tile_of(p.x(), p.y(), *precision);
                Value::String(format!("{}/{}/{}", precision, x, y))
            })
            .collect()),
    }
}

fn sort_buckets(buckets: &mut [RawBucket], request: &BucketRequest) {
    let by_key = |a: &RawBucket, b: &RawBucket| compare_values(&a.key, &b.key);
    let by_count = |a: &RawBucket, b: &RawBucket, order: SortOrder| {
        directed(a.doc_count.cmp(&b.doc_count), order).then_with(|| by_key(a, b))
    };

    match &request.order {
        Some(BucketOrder::Key(order)) => buckets.sort_by(|a, b| directed(by_key(a, b), *order)),
        Some(BucketOrder::Count(order)) => buckets.sort_by(|a, b| by_count(a, b, *order)),
        Some(BucketOrder::Metric { name, order }) => buckets.sort_by(|a, b| {
            let (x, y) = (bucket_metric(a, name), bucket_metric(b, name));
            directed(x.partial_cmp(&y).unwrap_or(Ordering::Equal), *order).then_with(|| by_key(a, b))
        }),
        None => match request.kind {
            BucketKind::Histogram { .. } | BucketKind::DateHistogram { .. } => buckets.sort_by(by_key),
            _ => buckets.sort_by(|a, b| by_count(a, b, SortOrder::Desc)),
        },
    }
}

fn bucket_metric(bucket: &RawBucket, name: &str) -> Option<f64> {
    bucket.aggregations.iter().find_map(|raw| match raw {
        RawAggregation::Metric {
            name: metric,
            value: RawMetricValue::Single(value),
            ..
        } if metric == name => *value,
        _ => None,
    })
}

fn metric_aggregation(request: &MetricRequest, docs: &[&Value]) -> BackendResult<RawAggregation> {
    let values: Vec<&Value> = docs
        .iter()
        .flat_map(|&doc| field_values(doc, &request.field))
        .collect();
    let numbers = || -> BackendResult<Vec<f64>> {
        scalars(&values)
            .into_iter()
            .map(|v| number(v, &request.field))
            .collect()
    };

    let value = match request.kind {
        MetricKind::Avg => {
            let numbers = numbers()?;
            RawMetricValue::Single(
                (!numbers.is_empty()).then(|| numbers.iter().sum::<f64>() / numbers.len() as f64),
            )
        }
        MetricKind::Sum => RawMetricValue::Single(Some(numbers()?.iter().sum())),
        MetricKind::Min => RawMetricValue::Single(numbers()?.into_iter().reduce(f64::min)),
        MetricKind::Max => RawMetricValue::Single(numbers()?.into_iter().reduce(f64::max)),
        MetricKind::Cardinality => {
            let distinct: BTreeSet<String> = scalars(&values).into_iter().map(value_to_string).collect();
            RawMetricValue::Single(Some(distinct.len() as f64))
        }
        MetricKind::GeoBbox => RawMetricValue::Bounds(points(&values).iter().fold(None, |acc, p| {
            Some(match acc {
                None => RawBounds {
                    top: p.y(),
                    left: p.x(),
                    bottom: p.y(),
                    right: p.x(),
                },
                Some(b) => RawBounds {
                    top: b.top.max(p.y()),
                    left: b.left.min(p.x()),
                    bottom: b.bottom.min(p.y()),
                    right: b.right.max(p.x()),
                },
            })
        })),
        MetricKind::GeoCentroid => {
            let points = points(&values);
            let count = points.len();
            let (lon, lat) = points
                .iter()
                .fold((0.0, 0.0), |(lon, lat), p| (lon + p.x(), lat + p.y()));
            let n = count.max(1) as f64;
            RawMetricValue::Centroid {
                lat: lat / n,
                lon: lon / n,
                count: count as u64,
            }
        }
    };

    Ok(RawAggregation::Metric {
        name: request.name.clone(),
        kind: request.kind,
        value,
    })
}

fn top_hits(request: &TopHitsRequest, docs: &[&Value]) -> BackendResult<RawAggregation> {
    let projection = Projection::new(&request.includes, &[])?;
    let mut sorted = docs.to_vec();
    sorted.sort_by(|a, b| compare_docs(a, b, &request.sort));
    Ok(RawAggregation::TopHits {
        name: request.name.clone(),
        hits: sorted
            .into_iter()
            .take(request.size)
            .map(|doc| projection.apply(doc))
            .collect(),
    })
}

/// Descriptor store held in memory
#[derive(Debug, Default)]
pub struct MemoryDescriptorStore {
    descriptors: RwLock<BTreeMap<String, CollectionDescriptor>>,
}

impl MemoryDescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DescriptorStore for MemoryDescriptorStore {
    async fn get(&self, name: &str) -> Result<Option<CollectionDescriptor>> {
        Ok(self.descriptors.read().get(name).cloned())
    }

    async fn put(&self, descriptor: &CollectionDescriptor) -> Result<()> {
        self.descriptors
            .write()
            .insert(descriptor.name.clone(), descriptor.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.descriptors.write().remove(name).is_some())
    }

    async fn list_all(&self) -> Result<Vec<CollectionDescriptor>> {
        Ok(self.descriptors.read().values().cloned().collect())
    }
}
