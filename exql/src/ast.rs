//! Abstract Syntax Tree for EXQL

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Filters
// ============================================================================

/// One filter parameter: its expressions are OR-ed together.
///
/// Several clauses passed to the same request are AND-ed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub any_of: Vec<Expression>,
}

impl FilterClause {
    /// Fields referenced by this clause, in order of appearance
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.any_of.iter().map(|e| e.field.as_str())
    }
}

/// A single `field:op:value` expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub field: String,
    pub op: Operator,
    pub value: FilterValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Like,
    Gt,
    Gte,
    Lt,
    Lte,
    Range,
    Within,
    NotWithin,
    Intersects,
    NotIntersects,
}

impl Operator {
    pub fn is_geo(self) -> bool {
        matches!(
            self,
            Operator::Within | Operator::NotWithin | Operator::Intersects | Operator::NotIntersects
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte | Operator::Range
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Like => "like",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Range => "range",
            Operator::Within => "within",
            Operator::NotWithin => "notwithin",
            Operator::Intersects => "intersects",
            Operator::NotIntersects => "notintersects",
        }
    }
}

/// Right-hand side of a filter expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    /// `eq` / `ne`: any of these values
    List(Vec<String>),
    /// `like`, `gt`, `gte`, `lt`, `lte`
    Scalar(String),
    /// `range`: any of these intervals
    Ranges(Vec<RangeBound>),
    /// geo operators
    BoundingBox(BoundingBox),
}

impl FilterValue {
    /// Every literal bound carried by this value (used for type checks)
    pub fn literals(&self) -> Vec<&str> {
        match self {
            FilterValue::List(values) => values.iter().map(String::as_str).collect(),
            FilterValue::Scalar(value) => vec![value.as_str()],
            FilterValue::Ranges(ranges) => ranges
                .iter()
                .flat_map(|r| [r.lower.as_str(), r.upper.as_str()])
                .collect(),
            FilterValue::BoundingBox(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeBound {
    pub lower: String,
    pub upper: String,
    pub lower_inclusive: bool,
    pub upper_inclusive: bool,
}

/// A `west,south,east,north` box in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    /// West edge east of the east edge
    pub fn crosses_antimeridian(&self) -> bool {
        self.west > self.east
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        let in_lon = if self.crosses_antimeridian() {
            lon >= self.west || lon <= self.east
        } else {
            lon >= self.west && lon <= self.east
        };
        lat >= self.south && lat <= self.north && in_lon
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.west, self.south, self.east, self.north)
    }
}

/// Full-text clause: `text` or `field:text`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullTextClause {
    pub field: Option<String>,
    pub text: String,
}

impl fmt::Display for FullTextClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}:{}", field, self.text),
            None => write!(f, "{}", self.text),
        }
    }
}

// ============================================================================
// Sorting
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn reversed(self) -> Self {
        match self {
            SortOrder::Asc => SortOrder::Desc,
            SortOrder::Desc => SortOrder::Asc,
        }
    }
}

impl Default for SortOrder {
    fn default() -> Self {
        Self::Asc
    }
}

/// One term of a sort spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SortTerm {
    /// `field`, `+field` or `-field`
    Field { field: String, order: SortOrder },
    /// `geodistance:lat lon`; `field` is bound to the collection centroid path
    /// once the collection is known
    GeoDistance {
        field: Option<String>,
        lat: f64,
        lon: f64,
        order: SortOrder,
    },
}

impl SortTerm {
    pub fn field(&self) -> Option<&str> {
        match self {
            SortTerm::Field { field, .. } => Some(field),
            SortTerm::GeoDistance { field, .. } => field.as_deref(),
        }
    }

    pub fn order(&self) -> SortOrder {
        match self {
            SortTerm::Field { order, .. } | SortTerm::GeoDistance { order, .. } => *order,
        }
    }

    pub fn reversed(&self) -> Self {
        match self.clone() {
            SortTerm::Field { field, order } => SortTerm::Field {
                field,
                order: order.reversed(),
            },
            SortTerm::GeoDistance {
                field,
                lat,
                lon,
                order,
            } => SortTerm::GeoDistance {
                field,
                lat,
                lon,
                order: order.reversed(),
            },
        }
    }
}

impl fmt::Display for SortTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortTerm::Field { field, order } => match order {
                SortOrder::Asc => write!(f, "{}", field),
                SortOrder::Desc => write!(f, "-{}", field),
            },
            SortTerm::GeoDistance { lat, lon, order, .. } => match order {
                SortOrder::Asc => write!(f, "geodistance:{} {}", lat, lon),
                SortOrder::Desc => write!(f, "-geodistance:{} {}", lat, lon),
            },
        }
    }
}

/// Render a sort spec back to its comma-separated form
pub fn sort_to_string(terms: &[SortTerm]) -> String {
    terms
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// Aggregations
// ============================================================================

/// One level of an aggregation request. Level `i + 1` is always a
/// sub-aggregation of level `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub agg_type: AggregationType,
    pub field: String,
    pub interval: Option<Interval>,
    pub format: Option<String>,
    pub metrics: Vec<Metric>,
    pub order: Option<SortOrder>,
    pub on: Option<OrderOn>,
    pub size: Option<usize>,
    pub include: Option<String>,
    pub aggregated_geometries: Vec<AggregatedGeometry>,
    pub raw_geometries: Vec<RawGeometry>,
    pub fetch_hits: Option<FetchHits>,
}

impl Aggregation {
    pub fn new(agg_type: AggregationType, field: impl Into<String>) -> Self {
        Self {
            agg_type,
            field: field.into(),
            interval: None,
            format: None,
            metrics: Vec::new(),
            order: None,
            on: None,
            size: None,
            include: None,
            aggregated_geometries: Vec::new(),
            raw_geometries: Vec::new(),
            fetch_hits: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationType {
    DateHistogram,
    Histogram,
    Term,
    Geohash,
    Geotile,
    H3,
}

impl AggregationType {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregationType::DateHistogram => "datehistogram",
            AggregationType::Histogram => "histogram",
            AggregationType::Term => "term",
            AggregationType::Geohash => "geohash",
            AggregationType::Geotile => "geotile",
            AggregationType::H3 => "h3",
        }
    }

    pub fn is_geo(self) -> bool {
        matches!(
            self,
            AggregationType::Geohash | AggregationType::Geotile | AggregationType::H3
        )
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric function applied to a field inside each bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionFunction {
    Avg,
    Sum,
    Min,
    Max,
    Cardinality,
    GeoBbox,
    GeoCentroid,
}

impl CollectionFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            CollectionFunction::Avg => "avg",
            CollectionFunction::Sum => "sum",
            CollectionFunction::Min => "min",
            CollectionFunction::Max => "max",
            CollectionFunction::Cardinality => "cardinality",
            CollectionFunction::GeoBbox => "geobbox",
            CollectionFunction::GeoCentroid => "geocentroid",
        }
    }

    pub fn is_geo(self) -> bool {
        matches!(self, CollectionFunction::GeoBbox | CollectionFunction::GeoCentroid)
    }
}

impl fmt::Display for CollectionFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub field: String,
    pub function: CollectionFunction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderOn {
    Field,
    Count,
    Result,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub value: f64,
    pub unit: Option<CalendarUnit>,
}

impl Interval {
    /// The interval as a whole number, if it is one (geohash/geotile precision)
    pub fn as_precision(&self) -> Option<u32> {
        if self.unit.is_none() && self.value.fract() == 0.0 && self.value >= 0.0 {
            Some(self.value as u32)
        } else {
            None
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)?;
        if let Some(unit) = self.unit {
            write!(f, "{}", unit.as_str())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalendarUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl CalendarUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            CalendarUnit::Second => "second",
            CalendarUnit::Minute => "minute",
            CalendarUnit::Hour => "hour",
            CalendarUnit::Day => "day",
            CalendarUnit::Week => "week",
            CalendarUnit::Month => "month",
            CalendarUnit::Quarter => "quarter",
            CalendarUnit::Year => "year",
        }
    }

    /// Length in milliseconds for fixed-length units
    pub fn fixed_millis(self) -> Option<i64> {
        match self {
            CalendarUnit::Second => Some(1_000),
            CalendarUnit::Minute => Some(60_000),
            CalendarUnit::Hour => Some(3_600_000),
            CalendarUnit::Day => Some(86_400_000),
            CalendarUnit::Week => Some(604_800_000),
            CalendarUnit::Month | CalendarUnit::Quarter | CalendarUnit::Year => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatedGeometry {
    Bbox,
    Centroid,
    Cell,
    CellCenter,
}

impl AggregatedGeometry {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregatedGeometry::Bbox => "bbox",
            AggregatedGeometry::Centroid => "centroid",
            AggregatedGeometry::Cell => "cell",
            AggregatedGeometry::CellCenter => "cell_center",
        }
    }

    pub fn is_cell(self) -> bool {
        matches!(self, AggregatedGeometry::Cell | AggregatedGeometry::CellCenter)
    }
}

/// A geometry field to fetch from the top document of each bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawGeometry {
    pub field: String,
    pub sort: Vec<SortTerm>,
}

/// `fetch_hits-N(+a,-b,c)`: signed fields sort and are included, plain
/// fields are only included
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchHits {
    pub size: usize,
    pub include: Vec<String>,
    pub sort: Vec<SortTerm>,
}
