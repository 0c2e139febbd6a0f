//! Single-level rendering of a response tree
//!
//! Keys are the path of segments from the root to each scalar:
//! `elements`/`i` for nested buckets, `metrics`/`field`/`function` for metric
//! values, `hits`/`i`/... for fetched documents. The part filter only sees
//! the structural segments of the tree; bucket and hit indices, metric
//! names and keys inside values are always kept so that keys stay unique.

use super::response::AggregationNode;
use serde_json::Value;
use std::collections::BTreeMap;

/// Flatten `node`, turning each kept segment path into a key with `stringify`
pub fn flatten<S, F>(node: &AggregationNode, stringify: S, keep_part: F) -> BTreeMap<String, Value>
where
    S: Fn(&[&str]) -> String,
    F: Fn(&str) -> bool,
{
    let mut out = BTreeMap::new();
    let flattener = Flattener {
        stringify: &stringify,
        keep_part: &keep_part,
    };
    flattener.node(node, &[], &mut out);
    out
}

/// Flatten with keys joined by `separator`, without `elements` segments
pub fn flatten_with_separator(node: &AggregationNode, separator: &str) -> BTreeMap<String, Value> {
    flatten(node, |parts| parts.join(separator), |part| part != "elements")
}

struct Flattener<'f> {
    stringify: &'f dyn Fn(&[&str]) -> String,
    keep_part: &'f dyn Fn(&str) -> bool,
}

/// A key segment. Only structural segments go through the part filter;
/// field names and keys taken from values are always kept.
#[derive(Debug, Clone)]
enum Segment {
    Structural(String),
    Data(String),
}

impl Flattener<'_> {
    fn node(&self, node: &AggregationNode, path: &[Segment], out: &mut BTreeMap<String, Value>) {
        self.emit(&structural(path, ["count"]), Value::from(node.count), out);
        if let Some(key) = &node.key {
            self.value(key, &structural(path, ["key"]), out);
        }
        if let Some(key) = &node.key_as_string {
            self.emit(&structural(path, ["key_as_string"]), Value::from(key.as_str()), out);
        }
        if let Some(other) = node.sum_other_doc_count {
            self.emit(&structural(path, ["sum_other_doc_count"]), Value::from(other), out);
        }
        for metric in &node.metrics {
            let function = metric.function.to_string();
            let metric_path = data(&structural(path, ["metrics"]), [metric.field.as_str(), function.as_str()]);
            self.value(&metric.value.to_json(), &metric_path, out);
        }
        for (i, child) in node.elements.iter().flatten().enumerate() {
            self.node(child, &structural(path, ["elements", i.to_string().as_str()]), out);
        }
        for (i, hit) in node.hits.iter().flatten().enumerate() {
            self.value(hit, &structural(path, ["hits", i.to_string().as_str()]), out);
        }
    }

    fn value(&self, value: &Value, path: &[Segment], out: &mut BTreeMap<String, Value>) {
        match value {
            Value::Null => {}
            Value::Object(map) => {
                for (key, child) in map {
                    self.value(child, &data(path, [key.as_str()]), out);
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.value(item, &data(path, [i.to_string().as_str()]), out);
                }
            }
            scalar => self.emit(path, scalar.clone(), out),
        }
    }

    fn emit(&self, path: &[Segment], value: Value, out: &mut BTreeMap<String, Value>) {
        let kept: Vec<&str> = path
            .iter()
            .filter_map(|segment| match segment {
                Segment::Structural(part) if !is_index(part) && !(self.keep_part)(part) => None,
                Segment::Structural(part) | Segment::Data(part) => Some(part.as_str()),
            })
            .collect();
        out.insert((self.stringify)(&kept), value);
    }
}

fn structural<const N: usize>(path: &[Segment], parts: [&str; N]) -> Vec<Segment> {
    let mut extended = path.to_vec();
    extended.extend(parts.iter().map(|part| Segment::Structural(part.to_string())));
    extended
}

fn data<const N: usize>(path: &[Segment], parts: [&str; N]) -> Vec<Segment> {
    let mut extended = path.to_vec();
    extended.extend(parts.iter().map(|part| Segment::Data(part.to_string())));
    extended
}

fn is_index(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::response::{MetricResult, MetricValue};
    use crate::query::request::MetricKind;
    use serde_json::json;

    fn leaf(key: &str, count: u64) -> AggregationNode {
        let mut node = AggregationNode::new("term:kind", count);
        node.key = Some(json!(key));
        node.key_as_string = Some(key.to_string());
        node.metrics.push(MetricResult {
            field: "speed".into(),
            function: MetricKind::Avg,
            value: MetricValue::Scalar(Some(3.0)),
        });
        node
    }

    #[test]
    fn test_leaf_has_only_scalars() {
        let flat = flatten_with_separator(&leaf("cargo", 4), "_");
        let keys: Vec<&str> = flat.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["count", "key", "key_as_string", "metrics_speed_avg"]);
        assert!(!keys.iter().any(|k| k.contains("elements")));
        assert_eq!(flat["metrics_speed_avg"], json!(3.0));
    }

    #[test]
    fn test_nested_keys_keep_indices() {
        let mut root = AggregationNode::new("term:kind", 9);
        root.elements = Some(vec![leaf("cargo", 4), leaf("tanker", 5)]);

        let flat = flatten_with_separator(&root, ".");
        assert_eq!(flat["count"], json!(9));
        assert_eq!(flat["0.key"], json!("cargo"));
        assert_eq!(flat["1.count"], json!(5));

        let verbose = flatten(&root, |parts| parts.join("/"), |_| true);
        assert_eq!(verbose["elements/1/metrics/speed/avg"], json!(3.0));
    }

    #[test]
    fn test_hits_are_flattened() {
        let mut node = leaf("cargo", 1);
        node.hits = Some(vec![json!({ "id": "a", "tags": ["x", "y"], "missing": null })]);
        let flat = flatten_with_separator(&node, "_");
        assert_eq!(flat["hits_0_id"], json!("a"));
        assert_eq!(flat["hits_0_tags_1"], json!("y"));
        assert!(!flat.contains_key("hits_0_missing"));
    }

    #[test]
    fn test_geometry_metric_is_expanded() {
        let mut node = AggregationNode::new("geohash:geo", 1);
        node.metrics.push(MetricResult {
            field: "geo".into(),
            function: MetricKind::GeoCentroid,
            value: MetricValue::Geometry(geo_types::Geometry::Point(geo_types::Point::new(1.0, 2.0))),
        });
        let flat = flatten_with_separator(&node, "_");
        assert_eq!(flat["metrics_geo_geocentroid_coordinates_1"], json!(2.0));
    }

    #[test]
    fn test_filter_leaves_value_keys_alone() {
        let mut node = leaf("cargo", 1);
        node.hits = Some(vec![json!({ "id": "a", "elements": { "count": 7 } })]);
        let flat = flatten_with_separator(&node, "_");
        assert_eq!(flat["count"], json!(1));
        assert_eq!(flat["hits_0_elements_count"], json!(7));
        assert_eq!(flat.len(), 6);

        let no_hits = flatten(&node, |parts| parts.join("."), |part| part != "hits" && part != "metrics");
        assert_eq!(no_hits["0.elements.count"], json!(7));
        assert_eq!(no_hits["speed.avg"], json!(3.0));
    }
}
