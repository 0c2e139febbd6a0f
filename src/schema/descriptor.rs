//! Collection descriptors
//!
//! A descriptor names the index behind a collection, its well-known field
//! paths and its default visibility. Descriptors are persisted as YAML:
//!
//! ```yaml
//! name: ais
//! index_name: ais-*
//! id_path: id
//! geometry_path: geo.track
//! centroid_path: geo.centroid
//! timestamp_path: ts
//! exclude_fields: ["internal.*"]
//! filter: ["status:ne:draft"]
//! organisations:
//!   owner: acme
//!   shared: [partner]
//! ```

use crate::error::{Error, Result};
use exql::FilterClause;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Who may see a collection
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganisationPolicy {
    pub owner: Option<String>,
    pub shared: Vec<String>,
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub name: String,

    /// Index, alias or pattern holding the documents
    pub index_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub id_path: String,
    pub geometry_path: String,
    pub centroid_path: String,
    pub timestamp_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h3_path: Option<String>,

    /// Glob patterns of fields never returned nor described
    #[serde(default)]
    pub exclude_fields: Vec<String>,

    #[serde(default)]
    pub taggable_fields: Vec<String>,

    /// Filter clauses AND-ed into every query on the collection
    #[serde(default)]
    pub filter: Vec<String>,

    #[serde(default)]
    pub organisations: OrganisationPolicy,
}

impl CollectionDescriptor {
    /// A descriptor with conventional well-known paths
    pub fn new(name: impl Into<String>, index_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index_name: index_name.into(),
            description: None,
            id_path: "id".to_string(),
            geometry_path: "geometry".to_string(),
            centroid_path: "centroid".to_string(),
            timestamp_path: "timestamp".to_string(),
            h3_path: None,
            exclude_fields: Vec::new(),
            taggable_fields: Vec::new(),
            filter: Vec::new(),
            organisations: OrganisationPolicy::default(),
        }
    }

    /// id, geometry, centroid and timestamp paths
    pub fn well_known_paths(&self) -> [&str; 4] {
        [
            &self.id_path,
            &self.geometry_path,
            &self.centroid_path,
            &self.timestamp_path,
        ]
    }

    /// Anchored regexes of the exclude patterns
    pub fn exclude_patterns(&self) -> Result<Vec<Regex>> {
        self.exclude_fields.iter().map(|glob| glob_to_regex(glob)).collect()
    }

    /// Parsed default filter clauses
    pub fn default_filters(&self) -> Result<Vec<FilterClause>> {
        self.filter
            .iter()
            .map(|clause| exql::parse_filter(clause).map_err(Error::from))
            .collect()
    }

    /// Check the caller's organisations against the visibility policy.
    ///
    /// Without an organisation list visibility is left to column filtering.
    pub fn check_organisations(&self, organisations: Option<&[String]>) -> Result<()> {
        let Some(organisations) = organisations else {
            return Ok(());
        };
        let policy = &self.organisations;
        let Some(owner) = &policy.owner else {
            return Ok(());
        };
        if policy.public {
            return Ok(());
        }

        let visible = std::iter::once(owner)
            .chain(policy.shared.iter())
            .any(|org| organisations.contains(org));
        if visible {
            Ok(())
        } else {
            Err(Error::CollectionUnavailable {
                name: self.name.clone(),
            })
        }
    }
}

/// True when `path` or one of its ancestors matches one of `patterns`
pub fn is_excluded(path: &str, patterns: &[Regex]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let mut prefix_end = Some(path.len());
    while let Some(end) = prefix_end {
        let prefix = &path[..end];
        if patterns.iter().any(|re| re.is_match(prefix)) {
            return true;
        }
        prefix_end = prefix.rfind('.');
    }
    false
}

/// Convert a field glob (`*` matches anything) to an anchored regex
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let pattern = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", pattern))
        .map_err(|e| Error::invalid_parameter(format!("Invalid field pattern '{}': {}", glob, e)))
}
