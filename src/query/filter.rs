//! Predicate evaluation against JSON documents
//!
//! Used by the in-memory backend. Comparisons are numeric when both sides
//! parse as numbers and lexical otherwise. `now` literals, and literals in
//! the request date format, resolve to epoch millis.

use super::date::{self, DateFormat};
use super::request::Predicate;
use crate::geo;
use crate::schema::glob_to_regex;
use exql::{Expression, FilterValue, FullTextClause, Operator, RangeBound, SortOrder, SortTerm};
use geo_types::Point;
use serde_json::Value;
use std::cmp::Ordering;

/// A document matches when any expression of the clause holds
pub fn matches(predicate: &Predicate, doc: &Value) -> bool {
    let format = predicate.date_format.as_deref().and_then(DateFormat::parse);
    predicate
        .clause
        .any_of
        .iter()
        .any(|expr| evaluate(expr, doc, format.as_ref()))
}

/// Evaluate one expression against a document; date literals are read with
/// `format` when one is given
pub fn evaluate(expr: &Expression, doc: &Value, format: Option<&DateFormat>) -> bool {
    let values = field_values(doc, &expr.field);
    let compare = |value: &Value, literal: &str| compare_dated(value, literal, format);
    match (&expr.op, &expr.value) {
        (Operator::Eq, FilterValue::List(literals)) => any_scalar(&values, |v| {
            literals.iter().any(|lit| compare(v, lit) == Some(Ordering::Equal))
        }),
        (Operator::Ne, FilterValue::List(literals)) => !any_scalar(&values, |v| {
            literals.iter().any(|lit| compare(v, lit) == Some(Ordering::Equal))
        }),
        (Operator::Like, FilterValue::Scalar(pattern)) => match glob_to_regex(pattern) {
            Ok(re) => any_scalar(&values, |v| re.is_match(&value_to_string(v))),
            Err(_) => false,
        },
        (Operator::Gt, FilterValue::Scalar(lit)) => {
            any_scalar(&values, |v| compare(v, lit) == Some(Ordering::Greater))
        }
        (Operator::Gte, FilterValue::Scalar(lit)) => any_scalar(&values, |v| {
            matches!(compare(v, lit), Some(Ordering::Greater | Ordering::Equal))
        }),
        (Operator::Lt, FilterValue::Scalar(lit)) => {
            any_scalar(&values, |v| compare(v, lit) == Some(Ordering::Less))
        }
        (Operator::Lte, FilterValue::Scalar(lit)) => any_scalar(&values, |v| {
            matches!(compare(v, lit), Some(Ordering::Less | Ordering::Equal))
        }),
        (Operator::Range, FilterValue::Ranges(ranges)) => {
            any_scalar(&values, |v| ranges.iter().any(|range| in_range(v, range, format)))
        }
        (op, FilterValue::BoundingBox(bbox)) if op.is_geo() => {
            let areas = geo::bbox_areas(bbox);
            let bounds: Vec<_> = values.iter().filter_map(|v| geo::geometry_bounds(v)).collect();
            let within = !bounds.is_empty()
                && bounds.iter().all(|b| areas.iter().any(|area| geo::rect_within(b, area)));
            let intersects = bounds
                .iter()
                .any(|b| areas.iter().any(|area| geo::rects_intersect(b, area)));
            match op {
                Operator::Within => within,
                Operator::NotWithin => !within,
                Operator::Intersects => intersects,
                _ => !intersects,
            }
        }
        _ => false,
    }
}

/// Full-text match: case-insensitive substring of the field, or of any
/// string in the document when the clause names no field
pub fn matches_full_text(clause: &FullTextClause, doc: &Value) -> bool {
    let needle = clause.text.to_lowercase();
    let haystack = match &clause.field {
        Some(field) => field_values(doc, field),
        None => vec![doc],
    };
    haystack.iter().any(|value| contains_text(value, &needle))
}

fn contains_text(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Array(items) => items.iter().any(|item| contains_text(item, needle)),
        Value::Object(map) => map.values().any(|item| contains_text(item, needle)),
        _ => false,
    }
}

/// Values stored at a dotted path; arrays of objects along the path fan out
pub fn field_values<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => next.extend(map.get(segment)),
                Value::Array(items) => next.extend(items.iter().filter_map(|item| item.get(segment))),
                _ => {}
            }
        }
        current = next;
    }
    current.retain(|v| !v.is_null());
    current
}

/// First value at a path
pub fn field_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    field_values(doc, path).into_iter().next()
}

fn any_scalar(values: &[&Value], mut predicate: impl FnMut(&Value) -> bool) -> bool {
    values.iter().any(|value| match value {
        Value::Array(items) => items.iter().any(&mut predicate),
        other => predicate(other),
    })
}

fn in_range(value: &Value, range: &RangeBound, format: Option<&DateFormat>) -> bool {
    let lower = match compare_dated(value, &range.lower, format) {
        Some(Ordering::Greater) => true,
        Some(Ordering::Equal) => range.lower_inclusive,
        _ => false,
    };
    let upper = match compare_dated(value, &range.upper, format) {
        Some(Ordering::Less) => true,
        Some(Ordering::Equal) => range.upper_inclusive,
        _ => false,
    };
    lower && upper
}

/// Render a scalar the way it is compared and bucketed
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric view of a scalar
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Order `value` against a request literal
pub fn compare_literal(value: &Value, literal: &str) -> Option<Ordering> {
    compare_dated(value, literal, None)
}

/// Order `value` against a request literal; with a date format both sides
/// may be dates written in it
pub fn compare_dated(value: &Value, literal: &str, format: Option<&DateFormat>) -> Option<Ordering> {
    let literal_number = date::resolve_now(literal)
        .or_else(|| format.and_then(|f| f.parse_millis(literal)))
        .map(|millis| millis as f64)
        .or_else(|| literal.trim().parse::<f64>().ok());
    let value_number = as_number(value).or_else(|| {
        let stored = value.as_str()?;
        format.and_then(|f| f.parse_millis(stored)).map(|millis| millis as f64)
    });
    match (value_number, literal_number) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(value_to_string(value).as_str().cmp(literal)),
    }
}

/// Order two stored scalars
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => value_to_string(a).cmp(&value_to_string(b)),
    }
}

/// Sort key of a document for one sort term
pub fn sort_key(doc: &Value, term: &SortTerm) -> Option<Value> {
    match term {
        SortTerm::Field { field, .. } => field_value(doc, field).map(|v| match v {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            other => other.clone(),
        }),
        SortTerm::GeoDistance { field, lat, lon, .. } => {
            let point = geo::point_from_value(field_value(doc, field.as_deref()?)?)?;
            let distance = geo::haversine_distance(&point, &Point::new(*lon, *lat));
            serde_json::Number::from_f64(distance).map(Value::Number)
        }
    }
}

/// Order two documents by a sort spec; missing values sort last
pub fn compare_docs(a: &Value, b: &Value, sort: &[SortTerm]) -> Ordering {
    for term in sort {
        let ordering = match (sort_key(a, term), sort_key(b, term)) {
            (Some(x), Some(y)) => directed(compare_values(&x, &y), term.order()),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// A document sorts strictly after the cursor
pub fn is_after_cursor(doc: &Value, sort: &[SortTerm], cursor: &[String]) -> bool {
    for (term, value) in sort.iter().zip(cursor) {
        let ordering = match sort_key(doc, term) {
            Some(key) => compare_literal(&key, value)
                .map(|o| directed(o, term.order()))
                .unwrap_or(Ordering::Equal),
            None => Ordering::Greater,
        };
        if ordering != Ordering::Equal {
            return ordering == Ordering::Greater;
        }
    }
    false
}

fn directed(ordering: Ordering, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Asc => ordering,
        SortOrder::Desc => ordering.reverse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "id": "v1",
            "name": "Harbour Master",
            "speed": 12.5,
            "status": "open",
            "tags": ["fishing", "coastal"],
            "ts": 1_600_000_000_000i64,
            "geo": { "centroid": { "lat": 43.6, "lon": 1.44 } },
            "crew": [{ "role": "captain" }, { "role": "cook" }]
        })
    }

    fn holds(filter: &str) -> bool {
        let clause = exql::parse_filter(filter).unwrap();
        matches(
            &Predicate {
                clause,
                date_format: None,
            },
            &doc(),
        )
    }

    #[test]
    fn test_equality() {
        assert!(holds("status:eq:open,closed"));
        assert!(!holds("status:ne:open"));
        assert!(holds("tags:eq:coastal"));
        assert!(holds("crew.role:eq:cook"));
        assert!(holds("speed:eq:12.5"));
    }

    #[test]
    fn test_comparisons() {
        assert!(holds("speed:gt:10"));
        assert!(!holds("speed:lt:10"));
        assert!(holds("speed:range:[10<12.5]"));
        assert!(!holds("speed:range:[10<12.5["));
        assert!(holds("ts:lt:now"));
        assert!(holds("ts:gt:now-36500d"));
    }

    #[test]
    fn test_formatted_dates() {
        let dated = |filter: &str, format: &str| {
            matches(
                &Predicate {
                    clause: exql::parse_filter(filter).unwrap(),
                    date_format: Some(format.into()),
                },
                &doc(),
            )
        };
        assert!(dated("ts:gt:2020-09-13", "yyyy-MM-dd"));
        assert!(!dated("ts:gt:2020-09-14", "yyyy-MM-dd"));
        assert!(dated("ts:range:[2020-09-01<2020-10-01]", "yyyy-MM-dd"));
        assert!(dated("ts:lte:13/09/2020 12:26:40", "dd/MM/yyyy HH:mm:ss"));
        assert!(!dated("ts:lt:13/09/2020 12:26:40", "dd/MM/yyyy HH:mm:ss"));
        assert!(dated("ts:gt:1970-01-01", "yyyy-MM-dd"));
    }

    #[test]
    fn test_or_within_clause() {
        assert!(holds("status:eq:closed;speed:gt:10"));
        assert!(!holds("status:eq:closed;speed:gt:20"));
    }

    #[test]
    fn test_like() {
        assert!(holds("name:like:Harbour*"));
        assert!(!holds("name:like:Port*"));
    }

    #[test]
    fn test_geo_operators() {
        assert!(holds("geo.centroid:within:0,40,5,45"));
        assert!(holds("geo.centroid:notwithin:10,40,15,45"));
        assert!(holds("geo.centroid:intersects:1,43,2,44"));
        assert!(!holds("geo.centroid:intersects:10,40,15,45"));
        assert!(holds("geo.centroid:within:-10,40,-170,45"));
        assert!(holds("geo.centroid:notwithin:170,40,-170,45"));
    }

    #[test]
    fn test_full_text() {
        assert!(matches_full_text(&exql::parse_full_text("harbour").unwrap(), &doc()));
        assert!(matches_full_text(&exql::parse_full_text("name:master").unwrap(), &doc()));
        assert!(!matches_full_text(&exql::parse_full_text("status:master").unwrap(), &doc()));
    }

    #[test]
    fn test_sorting_and_cursor() {
        let a = json!({ "id": "a", "speed": 1 });
        let b = json!({ "id": "b", "speed": 2 });
        let missing = json!({ "id": "c" });
        let sort = exql::parse_sort("-speed,id").unwrap();

        assert_eq!(compare_docs(&b, &a, &sort), Ordering::Less);
        assert_eq!(compare_docs(&a, &missing, &sort), Ordering::Less);
        assert!(is_after_cursor(&a, &sort, &["2".into(), "b".into()]));
        assert!(!is_after_cursor(&b, &sort, &["2".into(), "b".into()]));
    }
}
