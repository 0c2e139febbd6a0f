//! Collection name to descriptor and field tree resolution
//!
//! Reads go through the [`SchemaCache`]: on a miss the value is fetched from
//! the store or backend without holding any lock, then inserted. Concurrent
//! misses may fetch twice; the last insert wins and both values are equal.

use super::descriptor::is_excluded;
use super::{CollectionDescriptor, FieldTree, FieldType};
use crate::cache::SchemaCache;
use crate::error::{Error, Result};
use crate::security::ColumnFilter;
use crate::storage::{DescriptorStore, MappingSource};
use crate::validation::{validate_collection_name, validate_field_path};
use std::sync::Arc;
use tracing::{debug, info};

pub struct SchemaResolver {
    cache: Arc<SchemaCache>,
    store: Arc<dyn DescriptorStore>,
    mappings: Arc<dyn MappingSource>,
}

impl SchemaResolver {
    pub fn new(
        cache: Arc<SchemaCache>,
        store: Arc<dyn DescriptorStore>,
        mappings: Arc<dyn MappingSource>,
    ) -> Self {
        Self {
            cache,
            store,
            mappings,
        }
    }

    pub fn cache(&self) -> &SchemaCache {
        &self.cache
    }

    /// Descriptor of a collection
    pub async fn resolve(&self, name: &str) -> Result<Arc<CollectionDescriptor>> {
        if let Some(descriptor) = self.cache.descriptor(name) {
            return Ok(descriptor);
        }

        debug!(collection = %name, "Descriptor cache miss");
        let descriptor = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| Error::CollectionNotFound {
                name: name.to_string(),
            })?;
        let descriptor = Arc::new(descriptor);
        self.cache.put_descriptor(Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Descriptor of a collection the caller's organisations may see
    pub async fn resolve_for(
        &self,
        name: &str,
        organisations: Option<&[String]>,
    ) -> Result<Arc<CollectionDescriptor>> {
        let descriptor = self.resolve(name).await?;
        descriptor.check_organisations(organisations)?;
        Ok(descriptor)
    }

    /// Unioned field tree of the indices behind `index`
    pub async fn field_tree(&self, index: &str) -> Result<Arc<FieldTree>> {
        if let Some(tree) = self.cache.field_tree(index) {
            return Ok(tree);
        }

        debug!(index = %index, "Mapping cache miss");
        let tree = Arc::new(self.fetch_field_tree(index).await?);
        self.cache.put_field_tree(index, Arc::clone(&tree));
        Ok(tree)
    }

    async fn fetch_field_tree(&self, index: &str) -> Result<FieldTree> {
        let raw = if index.contains('*') {
            self.mappings.get_all_mappings(index).await?
        } else {
            self.mappings.get_mapping(index).await?
        };
        if raw.is_empty() {
            return Err(Error::IndexNotFound {
                index: index.to_string(),
            });
        }

        let trees = raw
            .iter()
            .map(|(name, mapping)| (name.clone(), FieldTree::from_mapping(mapping)))
            .collect();
        Ok(FieldTree::union_all(&trees))
    }

    /// Type of a dotted field path of a collection.
    ///
    /// Unknown paths resolve to [`FieldType::Unknown`] unless `strict`.
    pub async fn field_type(&self, collection: &str, path: &str, strict: bool) -> Result<FieldType> {
        if let Some(field_type) = self.cache.field_type(collection, path) {
            return Ok(field_type);
        }

        let descriptor = self.resolve(collection).await?;
        let tree = self.field_tree(&descriptor.index_name).await?;
        match tree.lookup(path) {
            Some(node) => {
                self.cache.put_field_type(collection, path, node.field_type);
                Ok(node.field_type)
            }
            None if strict => Err(Error::FieldNotFound {
                collection: collection.to_string(),
                field: path.to_string(),
            }),
            None => Ok(FieldType::Unknown),
        }
    }

    /// Persist a descriptor and drop every cached value derived from it
    pub async fn register(&self, descriptor: CollectionDescriptor, validate_fields: bool) -> Result<()> {
        validate_collection_name(&descriptor.name)?;
        descriptor.exclude_patterns()?;
        descriptor.default_filters()?;

        if validate_fields {
            let tree = self.fetch_field_tree(&descriptor.index_name).await?;
            check_declared_paths(&descriptor, &tree)?;
        }

        let previous_index = self
            .store
            .get(&descriptor.name)
            .await?
            .map(|previous| previous.index_name);

        self.store.put(&descriptor).await?;
        self.cache
            .invalidate_collection(&descriptor.name, &descriptor.index_name);
        if let Some(previous_index) = previous_index {
            self.cache.invalidate_field_tree(&previous_index);
        }

        info!(collection = %descriptor.name, index = %descriptor.index_name, "Registered collection");
        Ok(())
    }

    /// Remove a descriptor and everything cached for it
    pub async fn delete(&self, name: &str) -> Result<()> {
        let descriptor = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| Error::CollectionNotFound {
                name: name.to_string(),
            })?;

        self.store.delete(name).await?;
        self.cache.invalidate_collection(name, &descriptor.index_name);

        info!(collection = %name, "Deleted collection");
        Ok(())
    }

    /// Every persisted descriptor
    pub async fn list(&self) -> Result<Vec<CollectionDescriptor>> {
        let mut descriptors = self.store.list_all().await?;
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(descriptors)
    }

    /// The field tree a caller may see: excluded and forbidden fields are
    /// removed along with their subtrees
    pub async fn describe(
        &self,
        descriptor: &CollectionDescriptor,
        column_filter: &ColumnFilter,
    ) -> Result<FieldTree> {
        let tree = self.field_tree(&descriptor.index_name).await?;
        let excludes = descriptor.exclude_patterns()?;

        let mut visible =
            tree.filtered(&|path: &str| !is_excluded(path, &excludes) && column_filter.is_visible(path));
        visible.mark_taggable(&descriptor.taggable_fields);
        Ok(visible)
    }
}

/// Check the well-known paths against the live schema
fn check_declared_paths(descriptor: &CollectionDescriptor, tree: &FieldTree) -> Result<()> {
    let expect = |path: &str, accepts: &dyn Fn(FieldType) -> bool, what: &str| -> Result<()> {
        validate_field_path(path)?;
        let node = tree.lookup(path).ok_or_else(|| Error::FieldNotFound {
            collection: descriptor.name.clone(),
            field: path.to_string(),
        })?;
        if accepts(node.field_type) {
            Ok(())
        } else {
            Err(Error::invalid_parameter(format!(
                "'{}' must be a {} field, found {:?}",
                path, what, node.field_type
            )))
        }
    };

    expect(&descriptor.id_path, &|t| t != FieldType::Object, "non-object")?;
    expect(&descriptor.geometry_path, &FieldType::is_geo, "geo")?;
    expect(&descriptor.centroid_path, &|t| t == FieldType::GeoPoint, "geo-point")?;
    expect(&descriptor.timestamp_path, &|t| t == FieldType::Date || t.is_numeric(), "date")?;
    if let Some(h3) = &descriptor.h3_path {
        expect(h3, &|t| t != FieldType::Object, "non-object")?;
    }
    for taggable in &descriptor.taggable_fields {
        expect(taggable, &|t| t != FieldType::Object, "non-object")?;
    }
    Ok(())
}
