//! Explorer configuration
//!
//! Loaded from YAML; every key is optional and falls back to its default.
//!
//! ```yaml
//! max_result_window: 10000
//! default_size: 10
//! flatten_separator: "_"
//! default_geometry_sort: "-timestamp"
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runtime limits and defaults of the exploration layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerConfig {
    /// Maximum value of `from + size` for a page of hits
    pub max_result_window: usize,

    /// Page size used when the caller gives none
    pub default_size: usize,

    /// Maximum number of hits fetched per bucket
    pub max_fetch_hits: usize,

    /// Maximum bucket count of a term/geo aggregation level
    pub max_bucket_size: usize,

    /// Separator joining key segments of flattened responses
    pub flatten_separator: String,

    /// Inward nudge applied to partition boxes so shared edges are not counted twice
    pub partition_epsilon: f64,

    /// Sort used to elect raw geometries when the request names none
    pub default_geometry_sort: Option<String>,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            max_result_window: 10_000,
            default_size: 10,
            max_fetch_hits: 100,
            max_bucket_size: 10_000,
            flatten_separator: "_".to_string(),
            partition_epsilon: 1e-10,
            default_geometry_sort: None,
        }
    }
}

impl ExplorerConfig {
    /// Load the configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::StoreReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| {
            Err(Error::Config {
                message: message.to_string(),
            })
        };

        if self.max_result_window == 0 {
            return fail("max_result_window must be > 0");
        }
        if self.default_size == 0 || self.default_size > self.max_result_window {
            return fail("default_size must be in 1..=max_result_window");
        }
        if self.max_bucket_size == 0 {
            return fail("max_bucket_size must be > 0");
        }
        if self.flatten_separator.is_empty() {
            return fail("flatten_separator cannot be empty");
        }
        if !(0.0..1e-3).contains(&self.partition_epsilon) {
            return fail("partition_epsilon must be in [0, 0.001)");
        }
        if let Some(sort) = &self.default_geometry_sort {
            exql::parse_sort(sort).map_err(|e| Error::Config {
                message: format!("default_geometry_sort: {}", e),
            })?;
        }
        Ok(())
    }
}
