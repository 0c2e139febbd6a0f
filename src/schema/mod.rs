//! Collection schemas
//!
//! A collection's schema is a [`FieldTree`] built from the backend-native
//! mappings of its indices. When a collection is backed by several indices
//! their trees are unioned:
//!
//! - a field present in one index only is kept
//! - a field whose type differs between indices keeps the type of the index
//!   that sorts first by name, and the conflict is logged
//! - object fields union their children

pub mod descriptor;
pub mod resolver;

pub use descriptor::{glob_to_regex, is_excluded, CollectionDescriptor, OrganisationPolicy};
pub use resolver::SchemaResolver;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Type of a field, normalized from the backend's mapping types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Keyword,
    Text,
    Long,
    Integer,
    Double,
    Boolean,
    Date,
    GeoPoint,
    GeoShape,
    Object,
    Unknown,
}

impl FieldType {
    /// Map a backend mapping type name
    pub fn from_backend(name: &str) -> Self {
        match name {
            "keyword" | "constant_keyword" | "wildcard" => FieldType::Keyword,
            "text" | "match_only_text" => FieldType::Text,
            "long" | "unsigned_long" => FieldType::Long,
            "integer" | "short" | "byte" => FieldType::Integer,
            "double" | "float" | "half_float" | "scaled_float" => FieldType::Double,
            "boolean" => FieldType::Boolean,
            "date" | "date_nanos" => FieldType::Date,
            "geo_point" => FieldType::GeoPoint,
            "geo_shape" => FieldType::GeoShape,
            "object" | "nested" => FieldType::Object,
            _ => FieldType::Unknown,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, FieldType::Long | FieldType::Integer | FieldType::Double)
    }

    pub fn is_geo(self) -> bool {
        matches!(self, FieldType::GeoPoint | FieldType::GeoShape)
    }

    pub fn is_textual(self) -> bool {
        matches!(self, FieldType::Keyword | FieldType::Text)
    }
}

/// One field of a [`FieldTree`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldNode {
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Searchable: the field and all its ancestors are indexed
    pub indexed: bool,

    /// Date format declared by the mapping (date fields only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(default)]
    pub taggable: bool,

    /// Sub-field holding a hash of the value, used for cardinality
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_field: Option<String>,

    /// Children (object fields only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<FieldTree>,
}

impl FieldNode {
    /// An indexed field with no children
    pub fn leaf(field_type: FieldType) -> Self {
        Self {
            field_type,
            indexed: true,
            format: None,
            taggable: false,
            hash_field: None,
            properties: None,
        }
    }

    /// An indexed object field
    pub fn object(properties: FieldTree) -> Self {
        Self {
            properties: Some(properties),
            ..Self::leaf(FieldType::Object)
        }
    }
}

/// Recursive map from field name to [`FieldNode`]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldTree {
    fields: BTreeMap<String, FieldNode>,
}

impl FieldTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from a raw mapping (`{"properties": ...}`, optionally
    /// wrapped in `{"mappings": ...}`)
    pub fn from_mapping(raw: &Value) -> Self {
        let root = raw.get("mappings").unwrap_or(raw);
        match root.get("properties").and_then(Value::as_object) {
            Some(properties) => build_level(properties, true, &[]),
            None => Self::default(),
        }
    }

    /// Union the trees of several indices, visiting indices in name order
    pub fn union_all(trees: &BTreeMap<String, FieldTree>) -> Self {
        let mut result = FieldTree::default();
        for (index, tree) in trees {
            debug!(index = %index, fields = tree.len(), "Merging index mapping");
            merge_into(&mut result, tree, &[]);
        }
        result
    }

    /// Union of two trees; on type conflict `self` wins
    pub fn union(&self, other: &FieldTree) -> Self {
        let mut result = self.clone();
        merge_into(&mut result, other, &[]);
        result
    }

    /// Builder-style insertion
    pub fn with(mut self, name: impl Into<String>, node: FieldNode) -> Self {
        self.fields.insert(name.into(), node);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, node: FieldNode) {
        self.fields.insert(name.into(), node);
    }

    pub fn get(&self, name: &str) -> Option<&FieldNode> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldNode)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Walk a dotted path
    pub fn lookup(&self, path: &str) -> Option<&FieldNode> {
        let mut segments = path.split('.');
        let mut node = self.fields.get(segments.next()?)?;
        for segment in segments {
            node = node.properties.as_ref()?.fields.get(segment)?;
        }
        Some(node)
    }

    fn lookup_mut(&mut self, path: &str) -> Option<&mut FieldNode> {
        let mut segments = path.split('.');
        let mut node = self.fields.get_mut(segments.next()?)?;
        for segment in segments {
            node = node.properties.as_mut()?.fields.get_mut(segment)?;
        }
        Some(node)
    }

    /// Dotted paths of every non-object field, in tree order
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        collect_leaves(self, &[], &mut paths);
        paths
    }

    /// Flag the given paths as taggable; unknown paths are ignored
    pub fn mark_taggable<S: AsRef<str>>(&mut self, paths: &[S]) {
        for path in paths {
            if let Some(node) = self.lookup_mut(path.as_ref()) {
                node.taggable = true;
            }
        }
    }

    /// Copy of the tree keeping the fields whose dotted path is `visible`.
    ///
    /// A dropped field takes its whole subtree with it. An object whose
    /// children are all dropped is dropped too.
    pub fn filtered(&self, visible: &dyn Fn(&str) -> bool) -> FieldTree {
        filter_level(self, &[], visible)
    }
}

fn join(path: &[&str], name: &str) -> String {
    let mut full = path.join(".");
    if !full.is_empty() {
        full.push('.');
    }
    full.push_str(name);
    full
}

fn build_level(properties: &Map<String, Value>, parent_indexed: bool, path: &[&str]) -> FieldTree {
    let mut tree = FieldTree::default();
    for (name, def) in properties {
        let children = def.get("properties").and_then(Value::as_object);
        let type_name = def
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(if children.is_some() { "object" } else { "" });
        let field_type = FieldType::from_backend(type_name);
        if field_type == FieldType::Unknown {
            debug!(field = %join(path, name), backend_type = type_name, "Unmapped field type");
        }

        let own_flag = def.get("index").and_then(Value::as_bool).unwrap_or(true)
            && def.get("enabled").and_then(Value::as_bool).unwrap_or(true);
        let indexed = parent_indexed && own_flag;

        let format = match field_type {
            FieldType::Date => def.get("format").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };

        let hash_field = def
            .get("fields")
            .and_then(Value::as_object)
            .and_then(|subs| {
                subs.iter()
                    .find(|(_, sub)| sub.get("type").and_then(Value::as_str) == Some("murmur3"))
            })
            .map(|(sub_name, _)| sub_name.clone());

        let properties = match (field_type, children) {
            (FieldType::Object, Some(children)) => {
                let mut child_path = path.to_vec();
                child_path.push(name);
                Some(build_level(children, indexed, &child_path))
            }
            (FieldType::Object, None) => Some(FieldTree::default()),
            _ => None,
        };

        tree.fields.insert(
            name.clone(),
            FieldNode {
                field_type,
                indexed,
                format,
                taggable: false,
                hash_field,
                properties,
            },
        );
    }
    tree
}

fn min_option(a: &Option<String>, b: &Option<String>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b).clone()),
        (a, b) => a.clone().or_else(|| b.clone()),
    }
}

fn merge_into(target: &mut FieldTree, other: &FieldTree, path: &[&str]) {
    for (name, node) in &other.fields {
        let Some(existing) = target.fields.get_mut(name) else {
            target.fields.insert(name.clone(), node.clone());
            continue;
        };

        if existing.field_type != node.field_type {
            warn!(
                field = %join(path, name),
                kept = ?existing.field_type,
                ignored = ?node.field_type,
                "Conflicting field types across indices, keeping the first"
            );
            continue;
        }

        existing.indexed |= node.indexed;
        existing.taggable |= node.taggable;
        existing.format = min_option(&existing.format, &node.format);
        existing.hash_field = min_option(&existing.hash_field, &node.hash_field);

        if let Some(theirs) = &node.properties {
            match existing.properties.as_mut() {
                Some(mine) => {
                    let mut child_path = path.to_vec();
                    child_path.push(name);
                    merge_into(mine, theirs, &child_path);
                }
                None => existing.properties = Some(theirs.clone()),
            }
        }
    }
}

fn collect_leaves(tree: &FieldTree, path: &[&str], out: &mut Vec<String>) {
    for (name, node) in &tree.fields {
        match &node.properties {
            Some(children) => {
                let mut child_path = path.to_vec();
                child_path.push(name);
                collect_leaves(children, &child_path, out);
            }
            None => out.push(join(path, name)),
        }
    }
}

fn filter_level(tree: &FieldTree, path: &[&str], visible: &dyn Fn(&str) -> bool) -> FieldTree {
    let mut result = FieldTree::default();
    for (name, node) in &tree.fields {
        if !visible(&join(path, name)) {
            continue;
        }
        let mut kept = node.clone();
        if let Some(children) = &node.properties {
            let mut child_path = path.to_vec();
            child_path.push(name);
            let filtered = filter_level(children, &child_path, visible);
            if filtered.is_empty() && !children.is_empty() {
                continue;
            }
            kept.properties = Some(filtered);
        }
        result.fields.insert(name.clone(), kept);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn geo_mapping() -> Value {
        json!({
            "properties": {
                "id": { "type": "keyword", "fields": { "hash": { "type": "murmur3" } } },
                "ts": { "type": "date", "format": "epoch_millis" },
                "speed": { "type": "float" },
                "geo": {
                    "properties": {
                        "centroid": { "type": "geo_point" },
                        "box": {
                            "enabled": false,
                            "properties": {
                                "w": { "type": "double" },
                                "e": { "type": "double" }
                            }
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn test_build_from_mapping() {
        let tree = FieldTree::from_mapping(&geo_mapping());

        assert_eq!(tree.lookup("id").unwrap().hash_field.as_deref(), Some("hash"));
        assert_eq!(tree.lookup("ts").unwrap().format.as_deref(), Some("epoch_millis"));
        assert_eq!(tree.lookup("speed").unwrap().field_type, FieldType::Double);
        assert_eq!(tree.lookup("geo").unwrap().field_type, FieldType::Object);
        assert_eq!(tree.lookup("geo.centroid").unwrap().field_type, FieldType::GeoPoint);
        assert!(tree.lookup("geo.nope").is_none());
    }

    #[test]
    fn test_indexed_flag_is_inherited() {
        let tree = FieldTree::from_mapping(&geo_mapping());
        assert!(tree.lookup("geo.centroid").unwrap().indexed);
        assert!(!tree.lookup("geo.box").unwrap().indexed);
        assert!(!tree.lookup("geo.box.w").unwrap().indexed);
    }

    #[test]
    fn test_wrapped_mapping() {
        let tree = FieldTree::from_mapping(&json!({ "mappings": geo_mapping() }));
        assert!(tree.lookup("geo.box.e").is_some());
    }

    #[test]
    fn test_union_is_idempotent() {
        let tree = FieldTree::from_mapping(&geo_mapping());
        assert_eq!(tree.union(&tree), tree);
    }

    #[test]
    fn test_union_is_commutative_when_types_agree() {
        let a = FieldTree::new()
            .with("id", FieldNode::leaf(FieldType::Keyword))
            .with("geo", FieldNode::object(FieldTree::new().with("centroid", FieldNode::leaf(FieldType::GeoPoint))));
        let b = FieldTree::new()
            .with("ts", FieldNode::leaf(FieldType::Date))
            .with("geo", FieldNode::object(FieldTree::new().with("box", FieldNode::leaf(FieldType::GeoShape))));

        let ab = a.union(&b);
        assert_eq!(ab, b.union(&a));
        assert!(ab.lookup("geo.centroid").is_some());
        assert!(ab.lookup("geo.box").is_some());
    }

    #[test]
    fn test_union_conflict_keeps_first_index() {
        let mut trees = BTreeMap::new();
        trees.insert("b-index".to_string(), FieldTree::new().with("code", FieldNode::leaf(FieldType::Long)));
        trees.insert("a-index".to_string(), FieldTree::new().with("code", FieldNode::leaf(FieldType::Keyword)));

        let tree = FieldTree::union_all(&trees);
        assert_eq!(tree.lookup("code").unwrap().field_type, FieldType::Keyword);
    }

    #[test]
    fn test_leaf_paths() {
        let tree = FieldTree::from_mapping(&geo_mapping());
        assert_eq!(
            tree.leaf_paths(),
            vec!["geo.box.e", "geo.box.w", "geo.centroid", "id", "speed", "ts"]
        );
    }

    #[test]
    fn test_filtered_drops_subtrees() {
        let tree = FieldTree::from_mapping(&geo_mapping());
        let visible = tree.filtered(&|path: &str| path == "geo" || path == "geo.centroid" || path == "id");
        assert_eq!(visible.leaf_paths(), vec!["geo.centroid", "id"]);

        let none_below = tree.filtered(&|path: &str| path == "geo");
        assert!(none_below.lookup("geo").is_none());
    }

    #[test]
    fn test_mark_taggable() {
        let mut tree = FieldTree::from_mapping(&geo_mapping());
        tree.mark_taggable(&["id", "missing"]);
        assert!(tree.lookup("id").unwrap().taggable);
        assert!(!tree.lookup("ts").unwrap().taggable);
    }
}
