//! Query building for explora
//!
//! Turns validated filters, projections, sorts and aggregation specs into a
//! backend-neutral [`SearchRequest`](request::SearchRequest).

mod builder;
pub mod date;
pub mod filter;
pub mod request;

pub use builder::{Cursor, PreparedQuery, QueryBuilder, QueryOutcome};

use exql::SortTerm;

/// Bind `geodistance` terms without a field to the collection centroid path
pub fn bind_geo_distance(terms: &[SortTerm], centroid_path: &str) -> Vec<SortTerm> {
    terms
        .iter()
        .map(|term| match term {
            SortTerm::GeoDistance {
                field: None,
                lat,
                lon,
                order,
            } => SortTerm::GeoDistance {
                field: Some(centroid_path.to_string()),
                lat: *lat,
                lon: *lon,
                order: *order,
            },
            other => other.clone(),
        })
        .collect()
}
