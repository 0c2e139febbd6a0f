//! Aggregations: request validation and lowering, response assembly,
//! flattening and spatial partitioning

pub mod assemble;
pub mod flatten;
pub mod partition;
pub mod response;
pub mod spec;

pub use flatten::{flatten, flatten_with_separator};
pub use response::{AggregationNode, FetchedGeometry, MetricResult, MetricValue};
