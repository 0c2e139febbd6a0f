//! Explora - a secured exploration layer over schemaless document stores
//!
//! Resolves collection schemas, narrows every request to what the caller may
//! see, and turns compact filter/sort/aggregation parameters into backend
//! queries whose raw results come back as response trees.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Explorer                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │   EXQL      │  │   Column    │  │   Schema Resolver       │  │
//! │  │   Parser    │  │   Filter    │  │   (3 caches)            │  │
//! │  └──────┬──────┘  └──────┬──────┘  └───────────┬─────────────┘  │
//! │         │                │                     │                │
//! │         ▼                ▼                     ▼                │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │                    Query Builder                            ││
//! │  │  (filter, project, sort, page, aggregate, compute)          ││
//! │  └──────────────────────────┬──────────────────────────────────┘│
//! │                             │                                   │
//! │           ┌─────────────────┼───────────────────┐               │
//! │           ▼                 ▼                   ▼               │
//! │  ┌─────────────────┐ ┌─────────────┐ ┌──────────────────────┐   │
//! │  │ Spatial         │ │ Query       │ │ Aggregation          │   │
//! │  │ Partitioner     │ │ Backend     │ │ Assembler/Flattener  │   │
//! │  └─────────────────┘ └─────────────┘ └──────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod aggregation;
pub mod cache;
pub mod config;
pub mod error;
pub mod geo;
pub mod query;
pub mod schema;
pub mod security;
pub mod storage;
pub mod validation;

pub use aggregation::{AggregationNode, MetricResult, MetricValue};
pub use config::ExplorerConfig;
pub use error::{Error, ErrorKind, Result};
pub use geo::GeoCell;
pub use query::request::MetricKind;
pub use query::{Cursor, QueryBuilder};
pub use schema::{CollectionDescriptor, FieldTree, FieldType, SchemaResolver};
pub use security::ColumnFilter;

use aggregation::partition;
use cache::SchemaCache;
use exql::{Aggregation, FilterClause, FullTextClause, SortTerm};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use storage::{DescriptorStore, MappingSource, QueryBackend};
use tracing::debug;

/// Who is asking: the raw column-filter header and organisation list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallerContext {
    /// `path` or `collection:path` entries, comma separated
    pub column_filter: Option<String>,
    pub organisations: Option<Vec<String>>,
}

impl CallerContext {
    /// A caller with no restriction at all
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_column_filter(mut self, header: impl Into<String>) -> Self {
        self.column_filter = Some(header.into());
        self
    }

    pub fn with_organisations<I, S>(mut self, organisations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.organisations = Some(organisations.into_iter().map(Into::into).collect());
        self
    }
}

/// Filter parameters shared by every request kind
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filters {
    /// AND-ed clauses of OR-ed expressions
    pub clauses: Vec<FilterClause>,
    /// Format of the date literals in `clauses`; epoch millis when absent
    pub date_format: Option<String>,
    pub full_text: Vec<FullTextClause>,
}

impl Filters {
    fn apply(&self, builder: &mut QueryBuilder<'_>) -> Result<()> {
        for clause in &self.clauses {
            builder.filter(clause, self.date_format.as_deref())?;
        }
        builder.filter_full_text(&self.full_text)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchParams {
    pub filters: Filters,
    /// Comma-separated include patterns
    pub includes: Option<String>,
    /// Comma-separated exclude patterns
    pub excludes: Option<String>,
    pub sort: Vec<SortTerm>,
    pub size: Option<usize>,
    pub from: usize,
    pub after: Option<Vec<String>>,
    pub before: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateParams {
    /// Level `i + 1` nests under level `i`
    pub aggregations: Vec<Aggregation>,
    pub filters: Filters,
}

/// A page of hits
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchPage {
    pub total: u64,
    pub hits: Vec<Value>,
}

/// A collection as a caller sees it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionDescription {
    #[serde(flatten)]
    pub descriptor: CollectionDescriptor,
    pub fields: FieldTree,
}

/// One metric over every matching document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputationResult {
    pub total: u64,
    #[serde(flatten)]
    pub metric: MetricResult,
}

/// What one request may touch: the collection, its schema, the caller's columns
struct Scope {
    descriptor: Arc<CollectionDescriptor>,
    fields: Arc<FieldTree>,
    column_filter: ColumnFilter,
}

/// The exploration service handle
pub struct Explorer {
    resolver: SchemaResolver,
    backend: Arc<dyn QueryBackend>,
    config: ExplorerConfig,
}

impl Explorer {
    pub fn new(
        config: ExplorerConfig,
        store: Arc<dyn DescriptorStore>,
        mappings: Arc<dyn MappingSource>,
        backend: Arc<dyn QueryBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = SchemaResolver::new(Arc::new(SchemaCache::new()), store, mappings);
        Ok(Self {
            resolver,
            backend,
            config,
        })
    }

    pub fn resolver(&self) -> &SchemaResolver {
        &self.resolver
    }

    pub fn config(&self) -> &ExplorerConfig {
        &self.config
    }

    async fn scope(&self, name: &str, ctx: &CallerContext) -> Result<Scope> {
        let descriptor = self
            .resolver
            .resolve_for(name, ctx.organisations.as_deref())
            .await?;
        let column_filter = ColumnFilter::from_header(ctx.column_filter.as_deref(), name)?;
        let fields = self.resolver.field_tree(&descriptor.index_name).await?;
        Ok(Scope {
            descriptor,
            fields,
            column_filter,
        })
    }

    fn builder<'a>(&'a self, scope: &'a Scope) -> Result<QueryBuilder<'a>> {
        QueryBuilder::new(
            &scope.descriptor,
            &scope.fields,
            &scope.column_filter,
            &self.config,
            Arc::clone(&self.backend),
        )
    }

    /// Descriptor and visible schema of a collection
    pub async fn describe(&self, name: &str, ctx: &CallerContext) -> Result<CollectionDescription> {
        let scope = self.scope(name, ctx).await?;
        let fields = self
            .resolver
            .describe(&scope.descriptor, &scope.column_filter)
            .await?;
        Ok(CollectionDescription {
            descriptor: scope.descriptor.as_ref().clone(),
            fields,
        })
    }

    /// Descriptors the caller may see; the others are skipped
    pub async fn list(&self, ctx: &CallerContext) -> Result<Vec<CollectionDescriptor>> {
        let mut visible = Vec::new();
        for descriptor in self.resolver.list().await? {
            let allowed = descriptor
                .check_organisations(ctx.organisations.as_deref())
                .and_then(|()| ColumnFilter::from_header(ctx.column_filter.as_deref(), &descriptor.name));
            match allowed {
                Ok(_) => visible.push(descriptor),
                Err(Error::CollectionUnavailable { name }) => {
                    debug!(collection = %name, "Skipping unavailable collection");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(visible)
    }

    pub async fn register(&self, descriptor: CollectionDescriptor, validate_fields: bool) -> Result<()> {
        self.resolver.register(descriptor, validate_fields).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.resolver.delete(name).await
    }

    /// A page of hits; a `before` page is returned in natural sort order
    pub async fn search(&self, name: &str, params: &SearchParams, ctx: &CallerContext) -> Result<SearchPage> {
        let cursor = match (&params.after, &params.before) {
            (Some(_), Some(_)) => {
                return Err(Error::bad_request("'after' and 'before' are mutually exclusive"));
            }
            (Some(after), None) => Some(Cursor::After(after.clone())),
            (None, Some(before)) => Some(Cursor::Before(before.clone())),
            (None, None) => None,
        };

        let scope = self.scope(name, ctx).await?;
        let mut builder = self.builder(&scope)?;
        params.filters.apply(&mut builder)?;
        if let Some(includes) = &params.includes {
            builder.include(includes);
        }
        if let Some(excludes) = &params.excludes {
            builder.exclude(excludes);
        }
        if !params.sort.is_empty() {
            builder.sort(&params.sort)?;
        }
        builder.limit_and_offset(params.size.unwrap_or(self.config.default_size), params.from)?;
        if let Some(cursor) = cursor {
            builder.search_after(cursor)?;
        }

        let outcome = builder.execute().await?;
        let mut hits = outcome.hits;
        if outcome.reversed {
            hits.reverse();
        }
        Ok(SearchPage {
            total: outcome.total,
            hits,
        })
    }

    /// Number of matching documents
    pub async fn count(&self, name: &str, filters: &Filters, ctx: &CallerContext) -> Result<u64> {
        let scope = self.scope(name, ctx).await?;
        let mut builder = self.builder(&scope)?;
        filters.apply(&mut builder)?;
        builder.count_only();
        Ok(builder.execute().await?.total)
    }

    pub async fn aggregate(&self, name: &str, params: &AggregateParams, ctx: &CallerContext) -> Result<AggregationNode> {
        let scope = self.scope(name, ctx).await?;
        let mut builder = self.builder(&scope)?;
        params.filters.apply(&mut builder)?;
        builder.aggregate(&params.aggregations, false)?;
        builder
            .execute()
            .await?
            .aggregation
            .ok_or_else(|| missing("aggregation"))
    }

    /// Geohash/geotile aggregation, optionally scoped to a cell.
    ///
    /// A scoped aggregation much finer than its cell is split into quadrants
    /// run concurrently; see [`aggregation::partition`].
    pub async fn geo_aggregate(
        &self,
        name: &str,
        params: &AggregateParams,
        cell: Option<&GeoCell>,
        ctx: &CallerContext,
    ) -> Result<AggregationNode> {
        let scope = self.scope(name, ctx).await?;
        let mut builder = self.builder(&scope)?;
        params.filters.apply(&mut builder)?;
        builder.aggregate(&params.aggregations, true)?;
        let query = builder.build()?;

        let Some(cell) = cell else {
            return query.execute().await?.aggregation.ok_or_else(|| missing("aggregation"));
        };
        let first = query
            .aggregations()
            .first()
            .ok_or_else(|| Error::bad_request("At least one aggregation is required"))?;
        let partitions = partition::plan(first, cell)?;
        partition::execute(&query, &partitions, self.config.partition_epsilon).await
    }

    /// One metric over every matching document
    pub async fn compute(
        &self,
        name: &str,
        filters: &Filters,
        field: &str,
        function: MetricKind,
        ctx: &CallerContext,
    ) -> Result<ComputationResult> {
        let scope = self.scope(name, ctx).await?;
        let mut builder = self.builder(&scope)?;
        filters.apply(&mut builder)?;
        builder.compute(field, function)?;
        let outcome = builder.execute().await?;
        let metric = outcome.metric.ok_or_else(|| missing("metric"))?;
        Ok(ComputationResult {
            total: outcome.total,
            metric,
        })
    }

    /// Single-level rendering of a tree, keys joined by the configured separator
    pub fn flatten(&self, tree: &AggregationNode) -> BTreeMap<String, Value> {
        aggregation::flatten_with_separator(tree, &self.config.flatten_separator)
    }
}

fn missing(what: &str) -> Error {
    Error::Backend {
        message: format!("The backend returned no {}", what),
    }
}
