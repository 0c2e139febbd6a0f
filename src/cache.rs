//! Schema caches
//!
//! Three concurrent maps shared by every request:
//!
//! - descriptors by collection name
//! - field trees by index (or alias) name
//! - resolved field types by `(collection, path)`
//!
//! Values are whole `Arc`s: a write replaces or removes an entry and never
//! mutates a value in place, so readers see either the old or the new tree.

use crate::schema::{CollectionDescriptor, FieldTree, FieldType};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Entry counts of each cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub descriptors: usize,
    pub mappings: usize,
    pub field_types: usize,
}

#[derive(Debug, Default)]
pub struct SchemaCache {
    descriptors: DashMap<String, Arc<CollectionDescriptor>>,
    mappings: DashMap<String, Arc<FieldTree>>,
    field_types: DashMap<(String, String), FieldType>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor(&self, name: &str) -> Option<Arc<CollectionDescriptor>> {
        self.descriptors.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn put_descriptor(&self, descriptor: Arc<CollectionDescriptor>) {
        self.descriptors.insert(descriptor.name.clone(), descriptor);
    }

    pub fn invalidate_descriptor(&self, name: &str) {
        if self.descriptors.remove(name).is_some() {
            debug!(collection = %name, "Invalidated cached descriptor");
        }
    }

    pub fn field_tree(&self, index: &str) -> Option<Arc<FieldTree>> {
        self.mappings.get(index).map(|entry| Arc::clone(entry.value()))
    }

    pub fn put_field_tree(&self, index: impl Into<String>, tree: Arc<FieldTree>) {
        self.mappings.insert(index.into(), tree);
    }

    pub fn invalidate_field_tree(&self, index: &str) {
        if self.mappings.remove(index).is_some() {
            debug!(index = %index, "Invalidated cached mapping");
        }
    }

    pub fn field_type(&self, collection: &str, path: &str) -> Option<FieldType> {
        self.field_types
            .get(&(collection.to_string(), path.to_string()))
            .map(|entry| *entry.value())
    }

    pub fn put_field_type(&self, collection: &str, path: &str, field_type: FieldType) {
        self.field_types
            .insert((collection.to_string(), path.to_string()), field_type);
    }

    /// Drop every resolved field type of a collection
    pub fn invalidate_field_types(&self, collection: &str) {
        let before = self.field_types.len();
        self.field_types.retain(|(owner, _), _| owner != collection);
        debug!(
            collection = %collection,
            removed = before.saturating_sub(self.field_types.len()),
            "Invalidated cached field types"
        );
    }

    /// Drop everything cached for a collection and its backing index,
    /// including the field types of other collections on that index
    pub fn invalidate_collection(&self, collection: &str, index: &str) {
        let sharing: Vec<String> = self
            .descriptors
            .iter()
            .filter(|entry| entry.key() != collection && entry.value().index_name == index)
            .map(|entry| entry.key().clone())
            .collect();

        self.invalidate_descriptor(collection);
        self.invalidate_field_tree(index);
        self.invalidate_field_types(collection);
        for other in &sharing {
            self.invalidate_field_types(other);
        }
    }

    pub fn clear(&self) {
        self.descriptors.clear();
        self.mappings.clear();
        self.field_types.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            descriptors: self.descriptors.len(),
            mappings: self.mappings.len(),
            field_types: self.field_types.len(),
        }
    }
}
