//! EXQL - Exploration Query Language
//!
//! The compact parameter language used to describe filters, sorts and
//! aggregations over a collection.
//!
//! # Syntax Overview
//!
//! ```text
//! -- Filters: field:op:value, expressions in one parameter are OR-ed
//! status:eq:open,closed
//! ts:range:[1577836800000<1609459200000]
//! geo.centroid:within:-10,-5,10,5;status:ne:closed
//!
//! -- Full text
//! title:harbour
//!
//! -- Sort
//! -ts,id
//! geodistance:43.6 1.44
//!
//! -- Aggregations: type:field[:key-value]*
//! datehistogram:ts:interval-1day:format-yyyy-MM-dd
//! geohash:geo.centroid:interval-5:collect_field-speed:collect_fct-avg:aggregated_geometries-bbox
//! term:vessel.type:size-20:fetch_hits-3(-ts,id)
//! ```

mod ast;
mod error;
mod parser;

pub use ast::*;
pub use error::ParseError;
pub use parser::{
    parse_bbox, parse_expression, parse_fetch_hits, parse_function, parse_interval,
    parse_raw_geometries,
};

/// Parse one filter parameter into a clause of OR-ed expressions
pub fn parse_filter(input: &str) -> Result<FilterClause, ParseError> {
    parser::parse_filter(input)
}

/// Parse a comma-separated sort specification
pub fn parse_sort(input: &str) -> Result<Vec<SortTerm>, ParseError> {
    parser::parse_sort(input)
}

/// Parse a full-text clause
pub fn parse_full_text(input: &str) -> Result<FullTextClause, ParseError> {
    parser::parse_full_text(input)
}

/// Parse one aggregation level
pub fn parse_aggregation(input: &str) -> Result<Aggregation, ParseError> {
    parser::parse_aggregation(input)
}

/// Parse an ordered list of aggregation levels; level `i + 1` nests under level `i`
pub fn parse_aggregations<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<Aggregation>, ParseError> {
    inputs.iter().map(|s| parse_aggregation(s.as_ref())).collect()
}
