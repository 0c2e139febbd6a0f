//! Column-level visibility
//!
//! A [`ColumnFilter`] is a caller's allow-list of dotted field paths. A path is
//! allowed when it, or one of its ancestors, is in the list. An empty list
//! means no restriction.
//!
//! Rewrites either narrow the request (includes, sort terms, full text,
//! metrics) or reject it (aggregation buckets, filter fields, misaligned
//! cursors).

use crate::error::{Error, Result};
use crate::query::bind_geo_distance;
use exql::{Aggregation, FullTextClause, SortTerm};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnFilter {
    allowed: Option<BTreeSet<String>>,
}

impl ColumnFilter {
    pub fn unrestricted() -> Self {
        Self { allowed: None }
    }

    /// A filter allowing `paths`; an empty list or a `*` entry allows everything
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = BTreeSet::new();
        for path in paths {
            let path = path.as_ref().trim();
            if path == "*" {
                return Self::unrestricted();
            }
            let path = path.strip_suffix(".*").unwrap_or(path);
            if !path.is_empty() {
                allowed.insert(path.to_string());
            }
        }
        if allowed.is_empty() {
            Self::unrestricted()
        } else {
            Self {
                allowed: Some(allowed),
            }
        }
    }

    /// Build the filter of `collection` from a column-filter header.
    ///
    /// Entries are comma separated, either `path` (every collection) or
    /// `collection:path`. A header with no entry for the collection makes it
    /// unavailable.
    pub fn from_header(header: Option<&str>, collection: &str) -> Result<Self> {
        let Some(header) = header else {
            return Ok(Self::unrestricted());
        };

        let paths: Vec<&str> = header
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| match entry.split_once(':') {
                Some((owner, path)) if owner == collection || owner == "*" => Some(path),
                Some(_) => None,
                None => Some(entry),
            })
            .collect();

        if paths.is_empty() {
            return Err(Error::CollectionUnavailable {
                name: collection.to_string(),
            });
        }
        Ok(Self::new(paths))
    }

    pub fn is_restricted(&self) -> bool {
        self.allowed.is_some()
    }

    pub fn allowed_paths(&self) -> Option<&BTreeSet<String>> {
        self.allowed.as_ref()
    }

    /// The path or one of its ancestors is allowed
    pub fn is_allowed(&self, path: &str) -> bool {
        let Some(allowed) = &self.allowed else {
            return true;
        };
        let mut end = Some(path.len());
        while let Some(e) = end {
            let prefix = &path[..e];
            if allowed.contains(prefix) {
                return true;
            }
            end = prefix.rfind('.');
        }
        false
    }

    /// Allowed, or an ancestor of an allowed path
    pub fn is_visible(&self, path: &str) -> bool {
        if self.is_allowed(path) {
            return true;
        }
        let prefix = format!("{}.", path);
        self.allowed
            .iter()
            .flatten()
            .any(|allowed| allowed.starts_with(&prefix))
    }

    /// Allowed paths under `ancestor`
    fn allowed_below<'a>(&'a self, ancestor: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.allowed
            .iter()
            .flatten()
            .filter(move |allowed| ancestor.is_empty() || allowed.starts_with(&format!("{}.", ancestor)))
    }

    /// Narrow include patterns. A forbidden ancestor expands to its allowed
    /// descendants; anything else forbidden is dropped.
    pub fn filter_include_list<S: AsRef<str>>(&self, includes: &[S]) -> Vec<String> {
        let mut result: Vec<String> = Vec::new();
        let mut push = |value: String| {
            if !result.contains(&value) {
                result.push(value);
            }
        };

        for include in includes {
            let include = include.as_ref().trim();
            if include.is_empty() {
                continue;
            }
            if !self.is_restricted() {
                push(include.to_string());
                continue;
            }

            let base = match include {
                "*" => "",
                other => other.strip_suffix(".*").unwrap_or(other),
            };
            if !base.is_empty() && self.is_allowed(base) {
                push(include.to_string());
            } else {
                for allowed in self.allowed_below(base) {
                    push(allowed.clone());
                }
            }
        }
        result
    }

    /// Narrow a comma-separated include list
    pub fn filter_includes(&self, includes: &str) -> String {
        let tokens: Vec<&str> = includes.split(',').collect();
        self.filter_include_list(&tokens).join(",")
    }

    /// Indices of the sort terms whose field is allowed
    fn surviving_sort_indices(&self, sort: &[SortTerm]) -> Vec<usize> {
        sort.iter()
            .enumerate()
            .filter(|(_, term)| term.field().map_or(true, |field| self.is_allowed(field)))
            .map(|(i, _)| i)
            .collect()
    }

    /// Drop sort terms on forbidden fields
    pub fn filter_sort(&self, sort: &[SortTerm]) -> Vec<SortTerm> {
        self.surviving_sort_indices(sort)
            .into_iter()
            .map(|i| sort[i].clone())
            .collect()
    }

    /// Keep the cursor values of the sort terms [`filter_sort`](Self::filter_sort) keeps
    pub fn filter_cursor(&self, sort: &[SortTerm], cursor: &[String]) -> Result<Vec<String>> {
        Ok(self.filter_sort_and_cursor(sort, cursor)?.1)
    }

    /// Filter a sort spec and its cursor from one index computation
    pub fn filter_sort_and_cursor(
        &self,
        sort: &[SortTerm],
        cursor: &[String],
    ) -> Result<(Vec<SortTerm>, Vec<String>)> {
        if sort.len() != cursor.len() {
            return Err(Error::bad_request(format!(
                "Cursor has {} values but the sort has {} terms",
                cursor.len(),
                sort.len()
            )));
        }
        let kept = self.surviving_sort_indices(sort);
        Ok((
            kept.iter().map(|&i| sort[i].clone()).collect(),
            kept.iter().map(|&i| cursor[i].clone()).collect(),
        ))
    }

    /// Drop clauses on forbidden fields; clauses on every field pass
    pub fn filter_full_text(&self, clauses: &[FullTextClause]) -> Vec<FullTextClause> {
        clauses
            .iter()
            .filter(|clause| clause.field.as_deref().map_or(true, |f| self.is_allowed(f)))
            .cloned()
            .collect()
    }

    /// Reject aggregations bucketing on, or fetching geometries from,
    /// forbidden fields; narrow their metrics and fetched hits.
    ///
    /// `bbox` and `centroid` geometries are computed on `centroid_path`, and
    /// field-less `geodistance` sorts are bound to it before filtering.
    pub fn filter_aggregations(
        &self,
        aggregations: &[Aggregation],
        centroid_path: &str,
    ) -> Result<Vec<Aggregation>> {
        if !self.is_restricted() {
            return Ok(aggregations.to_vec());
        }

        aggregations
            .iter()
            .map(|aggregation| {
                if !self.is_allowed(&aggregation.field) {
                    return Err(forbidden(&aggregation.field));
                }
                if let Some(raw) = aggregation
                    .raw_geometries
                    .iter()
                    .find(|raw| !self.is_allowed(&raw.field))
                {
                    return Err(forbidden(&raw.field));
                }
                let from_centroid = aggregation
                    .aggregated_geometries
                    .iter()
                    .any(|geometry| !geometry.is_cell());
                if from_centroid && !self.is_allowed(centroid_path) {
                    return Err(forbidden(centroid_path));
                }

                let mut narrowed = aggregation.clone();
                narrowed.metrics.retain(|metric| self.is_allowed(&metric.field));
                for raw in &mut narrowed.raw_geometries {
                    raw.sort = self.filter_sort(&bind_geo_distance(&raw.sort, centroid_path));
                }
                if let Some(fetch) = &mut narrowed.fetch_hits {
                    fetch.include = self.filter_include_list(&fetch.include);
                    if fetch.include.is_empty() {
                        fetch.include = self.filter_include_list(&["*"]);
                    }
                    fetch.sort = self.filter_sort(&bind_geo_distance(&fetch.sort, centroid_path));
                }
                Ok(narrowed)
            })
            .collect()
    }
}

fn forbidden(field: &str) -> Error {
    Error::invalid_parameter(format!("Field '{}' is not available for this caller", field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use exql::{parse_aggregation, parse_raw_geometries, parse_sort, AggregationType, FetchHits};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ancestor_closure() {
        let filter = ColumnFilter::new(["a.b"]);
        assert!(filter.is_allowed("a.b"));
        assert!(filter.is_allowed("a.b.c"));
        assert!(!filter.is_allowed("a.c"));
        assert!(!filter.is_allowed("a"));
        assert!(!filter.is_allowed("a.bc"));
        assert!(filter.is_visible("a"));
        assert!(!filter.is_visible("b"));
    }

    #[test]
    fn test_unrestricted() {
        assert!(ColumnFilter::new(Vec::<String>::new()).is_allowed("anything"));
        assert!(!ColumnFilter::new(["*"]).is_restricted());
        assert!(ColumnFilter::new(["geo.*"]).is_allowed("geo.box"));
    }

    #[test]
    fn test_from_header() {
        let filter = ColumnFilter::from_header(Some("id, ais:geo.centroid, other:ts"), "ais").unwrap();
        assert!(filter.is_allowed("id"));
        assert!(filter.is_allowed("geo.centroid"));
        assert!(!filter.is_allowed("ts"));

        assert!(!ColumnFilter::from_header(None, "ais").unwrap().is_restricted());
        assert!(matches!(
            ColumnFilter::from_header(Some("other:ts"), "ais"),
            Err(Error::CollectionUnavailable { .. })
        ));
    }

    #[test]
    fn test_filter_includes_narrows() {
        let filter = ColumnFilter::new(["id", "geo.centroid"]);
        assert_eq!(filter.filter_includes("id,ts"), "id");
        assert_eq!(filter.filter_includes("geo"), "geo.centroid");
        assert_eq!(filter.filter_includes("geo.*,id"), "geo.centroid,id");
        assert_eq!(filter.filter_includes("*"), "geo.centroid,id");
        assert_eq!(filter.filter_includes("geo.centroid.lat"), "geo.centroid.lat");
    }

    #[test]
    fn test_filter_sort() {
        let filter = ColumnFilter::new(["id"]);
        let sort = parse_sort("-date,id").unwrap();
        assert_eq!(exql::sort_to_string(&filter.filter_sort(&sort)), "id");
    }

    #[test]
    fn test_cursor_stays_aligned() {
        let filter = ColumnFilter::new(["id"]);
        let sort = parse_sort("-date,id").unwrap();
        let (kept_sort, kept_cursor) = filter
            .filter_sort_and_cursor(&sort, &strings(&["2020-01-01", "abc"]))
            .unwrap();
        assert_eq!(kept_sort.len(), kept_cursor.len());
        assert_eq!(kept_cursor, strings(&["abc"]));
        assert_eq!(filter.filter_cursor(&sort, &strings(&["2020-01-01", "abc"])).unwrap(), strings(&["abc"]));

        assert!(matches!(
            filter.filter_cursor(&sort, &strings(&["abc"])),
            Err(Error::BadRequest { .. })
        ));
    }

    #[test]
    fn test_filter_full_text() {
        let filter = ColumnFilter::new(["name"]);
        let clauses = vec![
            exql::parse_full_text("name:harbour").unwrap(),
            exql::parse_full_text("secret:x").unwrap(),
            exql::parse_full_text("anything").unwrap(),
        ];
        let kept = filter.filter_full_text(&clauses);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].field, None);
    }

    #[test]
    fn test_forbidden_bucket_field_fails() {
        let filter = ColumnFilter::new(["id", "ts"]);
        let agg = parse_aggregation("term:geo.box").unwrap();
        assert!(matches!(
            filter.filter_aggregations(&[agg], "geo.centroid"),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_forbidden_raw_geometry_fails() {
        let filter = ColumnFilter::new(["geo.centroid"]);
        let agg = parse_aggregation("geohash:geo.centroid:interval-3:raw_geometries-geo.track").unwrap();
        assert!(filter.filter_aggregations(&[agg], "geo.centroid").is_err());
    }

    #[test]
    fn test_metrics_and_fetched_hits_are_narrowed() {
        let filter = ColumnFilter::new(["vessel", "speed"]);
        let agg = parse_aggregation(
            "term:vessel.type:collect_field-speed:collect_fct-avg:collect_field-secret:collect_fct-max:fetch_hits-3(-secret,speed)",
        )
        .unwrap();

        let narrowed = filter.filter_aggregations(&[agg], "geo.centroid").unwrap();
        assert_eq!(narrowed[0].agg_type, AggregationType::Term);
        assert_eq!(narrowed[0].metrics.len(), 1);
        assert_eq!(narrowed[0].metrics[0].field, "speed");
        let fetch = narrowed[0].fetch_hits.as_ref().unwrap();
        assert!(fetch.sort.is_empty());
        assert!(!fetch.include.iter().any(|f| f == "secret"));
    }

    #[test]
    fn test_centroid_geometries_need_the_centroid_path() {
        let filter = ColumnFilter::new(["id", "kind"]);
        let agg = parse_aggregation("term:kind:aggregated_geometries-centroid,bbox").unwrap();
        assert!(matches!(
            filter.filter_aggregations(&[agg], "geo.centroid"),
            Err(Error::InvalidParameter { .. })
        ));

        let cells = parse_aggregation("geohash:geo.centroid:interval-3:aggregated_geometries-cell").unwrap();
        let geo_filter = ColumnFilter::new(["geo.centroid"]);
        assert!(geo_filter.filter_aggregations(&[cells], "geo.centroid").is_ok());
        let located = ColumnFilter::new(["id", "geo"]);
        let agg = parse_aggregation("term:id:aggregated_geometries-bbox").unwrap();
        assert!(located.filter_aggregations(&[agg], "geo.centroid").is_ok());
    }

    #[test]
    fn test_geodistance_sorts_are_bound_before_filtering() {
        let filter = ColumnFilter::new(["id", "kind", "geometry"]);
        let mut agg = parse_aggregation("term:kind").unwrap();
        agg.raw_geometries = parse_raw_geometries("geometry(geodistance:43.6 1.44)").unwrap();
        agg.fetch_hits = Some(FetchHits {
            size: 2,
            include: vec!["id".into()],
            sort: parse_sort("geodistance:43.6 1.44").unwrap(),
        });
        let narrowed = filter.filter_aggregations(&[agg.clone()], "geo.centroid").unwrap();
        assert!(narrowed[0].raw_geometries[0].sort.is_empty());
        assert!(narrowed[0].fetch_hits.as_ref().unwrap().sort.is_empty());

        let allowed = ColumnFilter::new(["id", "kind", "geometry", "geo.centroid"]);
        let kept = allowed.filter_aggregations(&[agg], "geo.centroid").unwrap();
        assert_eq!(kept[0].raw_geometries[0].sort[0].field(), Some("geo.centroid"));
        assert_eq!(kept[0].fetch_hits.as_ref().unwrap().sort[0].field(), Some("geo.centroid"));
    }
}
