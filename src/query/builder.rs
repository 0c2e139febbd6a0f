//! Request accumulation
//!
//! A [`QueryBuilder`] lives for one request. Each mutator validates its input
//! against the collection schema and the caller's column filter, then
//! records it. [`QueryBuilder::build`] resolves the projection and paging
//! into a [`PreparedQuery`], which can be executed as is or narrowed to a
//! box by the spatial partitioner.

use super::bind_geo_distance;
use super::date::{self, DateFormat};
use super::request::{MetricKind, Predicate, SearchRequest};
use crate::aggregation::assemble::{assemble, metric_value};
use crate::aggregation::response::{AggregationNode, MetricResult};
use crate::aggregation::spec::{self, AggregationContext};
use crate::config::ExplorerConfig;
use crate::error::{Error, Result};
use crate::geo;
use crate::schema::{is_excluded, CollectionDescriptor, FieldNode, FieldTree, FieldType};
use crate::security::ColumnFilter;
use crate::storage::{QueryBackend, RawAggregation};
use crate::validation::validate_field_path;
use exql::{
    Aggregation, Expression, FilterClause, FilterValue, FullTextClause, Metric,
    Operator, SortTerm,
};
use geo_types::Rect;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Search-after position, aligned with the requested sort
#[derive(Debug, Clone, PartialEq)]
pub enum Cursor {
    After(Vec<String>),
    /// Page preceding the cursor; hits come back in reverse order
    Before(Vec<String>),
}

pub struct QueryBuilder<'a> {
    descriptor: &'a CollectionDescriptor,
    fields: &'a FieldTree,
    column_filter: &'a ColumnFilter,
    config: &'a ExplorerConfig,
    backend: Arc<dyn QueryBackend>,
    request: SearchRequest,
    includes: Option<Vec<String>>,
    excludes: Vec<String>,
    explicit_fields: bool,
    requested_sort: Vec<SortTerm>,
    cursor: Option<Cursor>,
    aggregations: Vec<Aggregation>,
    compute: Option<Metric>,
}

impl<'a> QueryBuilder<'a> {
    /// Start a request on a collection; its default filter is always applied
    pub fn new(
        descriptor: &'a CollectionDescriptor,
        fields: &'a FieldTree,
        column_filter: &'a ColumnFilter,
        config: &'a ExplorerConfig,
        backend: Arc<dyn QueryBackend>,
    ) -> Result<Self> {
        let mut request = SearchRequest::new(descriptor.index_name.clone());
        request.size = config.default_size;
        request.predicates = descriptor
            .default_filters()?
            .into_iter()
            .map(|clause| Predicate {
                clause,
                date_format: None,
            })
            .collect();

        Ok(Self {
            descriptor,
            fields,
            column_filter,
            config,
            backend,
            request,
            includes: None,
            excludes: Vec::new(),
            explicit_fields: false,
            requested_sort: Vec::new(),
            cursor: None,
            aggregations: Vec::new(),
            compute: None,
        })
    }

    fn context(&self) -> AggregationContext<'a> {
        AggregationContext {
            descriptor: self.descriptor,
            fields: self.fields,
            config: self.config,
        }
    }

    fn field(&self, path: &str) -> Result<&'a FieldNode> {
        self.fields.lookup(path).ok_or_else(|| Error::FieldNotFound {
            collection: self.descriptor.name.clone(),
            field: path.to_string(),
        })
    }

    fn check_allowed(&self, path: &str) -> Result<()> {
        if self.column_filter.is_allowed(path) {
            Ok(())
        } else {
            Err(Error::invalid_parameter(format!(
                "Field '{}' is not available for this caller",
                path
            )))
        }
    }

    /// AND a clause of OR-ed expressions into the request
    pub fn filter(&mut self, clause: &FilterClause, date_format: Option<&str>) -> Result<&mut Self> {
        for expr in &clause.any_of {
            self.check_expression(expr, date_format)?;
        }
        self.request.predicates.push(Predicate {
            clause: clause.clone(),
            date_format: date_format.map(str::to_string),
        });
        Ok(self)
    }

    fn check_expression(&self, expr: &Expression, date_format: Option<&str>) -> Result<()> {
        validate_field_path(&expr.field)?;
        self.check_allowed(&expr.field)?;
        let field_type = self.field(&expr.field)?.field_type;

        let suits = match expr.op {
            op if op.is_geo() => field_type.is_geo(),
            Operator::Like => field_type.is_textual(),
            Operator::Eq | Operator::Ne => !matches!(
                field_type,
                FieldType::Object | FieldType::GeoPoint | FieldType::GeoShape
            ),
            _ => field_type.is_numeric() || matches!(field_type, FieldType::Date | FieldType::Keyword),
        };
        if !suits {
            return Err(Error::invalid_parameter(format!(
                "Operator '{}' does not apply to '{}' ({:?})",
                expr.op.as_str(),
                expr.field,
                field_type
            )));
        }

        if field_type == FieldType::Date && expr.op.is_comparison() {
            let format = date_format
                .map(|f| {
                    DateFormat::parse(f)
                        .ok_or_else(|| Error::invalid_parameter(format!("Invalid date format '{}'", f)))
                })
                .transpose()?;
            let readable = |literal: &str| {
                date::resolve_now(literal).is_some()
                    || literal.trim().parse::<i64>().is_ok()
                    || format.as_ref().map_or(false, |f| f.parse_millis(literal).is_some())
            };
            if let Some(bad) = expr.value.literals().into_iter().find(|lit| !readable(*lit)) {
                return Err(Error::invalid_parameter(match date_format {
                    Some(f) => format!("'{}' on date field '{}' does not match the format '{}'", bad, expr.field, f),
                    None => format!(
                        "'{}' on date field '{}' must be epoch millis or a 'now' expression when no date format is given",
                        bad, expr.field
                    ),
                }));
            }
        }
        Ok(())
    }

    /// AND full-text clauses; clauses on forbidden fields are dropped
    pub fn filter_full_text(&mut self, clauses: &[FullTextClause]) -> Result<&mut Self> {
        for clause in self.column_filter.filter_full_text(clauses) {
            if let Some(field) = &clause.field {
                self.field(field)?;
            }
            self.request.full_text.push(clause);
        }
        Ok(self)
    }

    /// Add comma-separated include patterns
    pub fn include(&mut self, csv: &str) -> &mut Self {
        let tokens = split_csv(csv);
        self.includes.get_or_insert_with(Vec::new).extend(tokens);
        self
    }

    /// Add comma-separated exclude patterns
    pub fn exclude(&mut self, csv: &str) -> &mut Self {
        self.excludes.extend(split_csv(csv));
        self
    }

    /// Without includes, project the explicit list of schema fields
    /// instead of `*`
    pub fn with_explicit_fields(&mut self) -> &mut Self {
        self.explicit_fields = true;
        self
    }

    /// Sort terms on forbidden fields are dropped
    pub fn sort(&mut self, terms: &[SortTerm]) -> Result<&mut Self> {
        let bound = bind_geo_distance(terms, &self.descriptor.centroid_path);
        let kept = self.column_filter.filter_sort(&bound);
        for term in &kept {
            if let Some(field) = term.field() {
                self.field(field)?;
            }
        }
        self.requested_sort = bound;
        self.request.sort = kept;
        Ok(self)
    }

    pub fn limit_and_offset(&mut self, size: usize, from: usize) -> Result<&mut Self> {
        if size == 0 {
            return Err(Error::invalid_parameter("'size' must be at least 1"));
        }
        if size.saturating_add(from) > self.config.max_result_window {
            return Err(Error::invalid_parameter(format!(
                "'size' + 'from' must not exceed {}",
                self.config.max_result_window
            )));
        }
        self.request.size = size;
        self.request.from = from;
        Ok(self)
    }

    /// Only the total is returned
    pub fn count_only(&mut self) -> &mut Self {
        self.request.size = 0;
        self
    }

    /// Resume after (or before) a cursor; checked against the sort at build
    pub fn search_after(&mut self, cursor: Cursor) -> Result<&mut Self> {
        if self.cursor.is_some() {
            return Err(Error::bad_request("'after' and 'before' cannot be combined"));
        }
        self.cursor = Some(cursor);
        Ok(self)
    }

    /// Request a bucket aggregation; hits are not returned
    pub fn aggregate(&mut self, aggregations: &[Aggregation], geo: bool) -> Result<&mut Self> {
        let aggregations = self
            .column_filter
            .filter_aggregations(aggregations, &self.descriptor.centroid_path)?;
        let ctx = self.context();
        spec::validate(&aggregations, geo, ctx)?;
        self.request.aggregation = Some(spec::to_bucket_request(&aggregations, ctx)?);
        self.request.size = 0;
        self.aggregations = aggregations;
        Ok(self)
    }

    /// Compute one metric over every matching document
    pub fn compute(&mut self, field: &str, function: MetricKind) -> Result<&mut Self> {
        validate_field_path(field)?;
        self.check_allowed(field)?;
        let metric = Metric {
            field: field.to_string(),
            function,
        };
        let ctx = self.context();
        spec::check_metric(&metric, ctx)?;
        self.request.metrics.push(spec::lower_metric(&metric, ctx)?);
        self.request.size = 0;
        self.compute = Some(metric);
        Ok(self)
    }

    /// Resolve projection and paging
    pub fn build(mut self) -> Result<PreparedQuery> {
        let exclude_patterns = self.descriptor.exclude_patterns()?;
        let mut excludes = std::mem::take(&mut self.excludes);
        for pattern in &self.descriptor.exclude_fields {
            if !excludes.contains(pattern) {
                excludes.push(pattern.clone());
            }
        }

        let includes = match self.includes.take() {
            Some(mut includes) => {
                for path in self.descriptor.well_known_paths() {
                    if !includes.iter().any(|pattern| covers(pattern, path)) {
                        includes.push(path.to_string());
                    }
                }
                includes
            }
            None if self.explicit_fields => self
                .fields
                .leaf_paths()
                .into_iter()
                .filter(|path| !is_excluded(path, &exclude_patterns))
                .collect(),
            None => vec!["*".to_string()],
        };
        self.request.includes = if self.column_filter.is_restricted() {
            self.column_filter.filter_include_list(&includes)
        } else {
            includes
        };
        self.request.excludes = excludes;

        let mut reversed = false;
        if let Some(cursor) = self.cursor.take() {
            let (values, before) = match cursor {
                Cursor::After(values) => (values, false),
                Cursor::Before(values) => (values, true),
            };
            if self.request.from > 0 {
                return Err(Error::bad_request("'after' and 'before' cannot be used with 'from'"));
            }
            let (sort, values) = self
                .column_filter
                .filter_sort_and_cursor(&self.requested_sort, &values)?;
            if sort.last().and_then(SortTerm::field) != Some(self.descriptor.id_path.as_str()) {
                return Err(Error::bad_request(format!(
                    "'after' and 'before' need '{}' as the last sort field",
                    self.descriptor.id_path
                )));
            }
            self.request.sort = if before {
                sort.iter().map(SortTerm::reversed).collect()
            } else {
                sort
            };
            self.request.search_after = Some(values);
            reversed = before;
        }

        debug!(
            collection = %self.descriptor.name,
            predicates = self.request.predicates.len(),
            aggregation = self.request.aggregation.is_some(),
            "Prepared query"
        );

        Ok(PreparedQuery {
            backend: self.backend,
            request: self.request,
            aggregations: self.aggregations,
            centroid_path: self.descriptor.centroid_path.clone(),
            compute: self.compute,
            reversed,
        })
    }

    pub async fn execute(self) -> Result<QueryOutcome> {
        self.build()?.execute().await
    }
}

/// A fully resolved request, independent of the builder's borrows
#[derive(Clone)]
pub struct PreparedQuery {
    backend: Arc<dyn QueryBackend>,
    request: SearchRequest,
    aggregations: Vec<Aggregation>,
    centroid_path: String,
    compute: Option<Metric>,
    reversed: bool,
}

/// Result of one backend round-trip
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub total: u64,
    pub hits: Vec<Value>,
    pub aggregation: Option<AggregationNode>,
    pub metric: Option<MetricResult>,
    /// Hits come in reverse sort order (a `before` page)
    pub reversed: bool,
}

impl PreparedQuery {
    pub fn request(&self) -> &SearchRequest {
        &self.request
    }

    pub fn aggregations(&self) -> &[Aggregation] {
        &self.aggregations
    }

    /// Copy of the query restricted to documents whose centroid lies in `rect`
    pub fn within(&self, rect: &Rect<f64>) -> Self {
        let mut narrowed = self.clone();
        narrowed.request.predicates.push(Predicate {
            clause: FilterClause {
                any_of: vec![Expression {
                    field: self.centroid_path.clone(),
                    op: Operator::Within,
                    value: FilterValue::BoundingBox(geo::to_bounding_box(rect)),
                }],
            },
            date_format: None,
        });
        narrowed
    }

    pub async fn execute(&self) -> Result<QueryOutcome> {
        let response = self.backend.search(&self.request).await?;

        let aggregation = match &self.request.aggregation {
            Some(root) => {
                let raw = find(&response.aggregations, &root.name)?;
                Some(assemble(raw, root, &self.aggregations, response.total)?)
            }
            None => None,
        };

        let metric = match (&self.compute, self.request.metrics.first()) {
            (Some(metric), Some(requested)) => Some(MetricResult {
                field: metric.field.clone(),
                function: metric.function,
                value: metric_value(find(&response.aggregations, &requested.name)?)?,
            }),
            _ => None,
        };

        Ok(QueryOutcome {
            total: response.total,
            hits: response.hits,
            aggregation,
            metric,
            reversed: self.reversed,
        })
    }
}

fn find<'r>(aggregations: &'r [RawAggregation], name: &str) -> Result<&'r RawAggregation> {
    aggregations
        .iter()
        .find(|raw| raw.name() == name)
        .ok_or_else(|| Error::Backend {
            message: format!("Aggregation '{}' missing from the response", name),
        })
}

fn split_csv(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// An include pattern already returns `path`
fn covers(pattern: &str, path: &str) -> bool {
    pattern == "*"
        || pattern == path
        || path.starts_with(&format!("{}.", pattern))
        || pattern
            .strip_suffix('*')
            .map_or(false, |prefix| path.starts_with(prefix))
}
