//! EXQL Parser using nom
//!
//! Parses the compact request parameters into AST nodes.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{all_consuming, map, map_res, opt, value},
    multi::separated_list1,
    number::complete::double,
    sequence::{delimited, tuple},
};

use crate::ast::*;
use crate::error::ParseError;

/// Run a parser over the whole input and convert failures
fn run<'a, O, F>(source: &'a str, parser: F) -> Result<O, ParseError>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    all_consuming(parser)(source)
        .map(|(_, out)| out)
        .map_err(|e| ParseError::from_nom(source, e))
}

// ============================================================================
// Filters
// ============================================================================

/// Parse one filter parameter: `;`-separated expressions, OR-ed
pub fn parse_filter(input: &str) -> Result<FilterClause, ParseError> {
    let mut any_of = Vec::new();
    for part in input.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        any_of.push(parse_expression(part)?);
    }

    if any_of.is_empty() {
        return Err(ParseError::new("Filter must contain at least one expression"));
    }
    Ok(FilterClause { any_of })
}

/// Parse a single `field:op:value` expression
pub fn parse_expression(input: &str) -> Result<Expression, ParseError> {
    let (raw, (field, _, op, _)) = tuple((field_path, char(':'), operator, char(':')))(input)
        .map_err(|e| ParseError::from_nom(input, e))?;

    if raw.is_empty() {
        return Err(ParseError::new(format!("Missing value in expression '{}'", input))
            .with_position(input.len()));
    }

    let value = match op {
        Operator::Eq | Operator::Ne => FilterValue::List(
            raw.split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
                .collect(),
        ),
        Operator::Like | Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            FilterValue::Scalar(raw.to_string())
        }
        Operator::Range => FilterValue::Ranges(run(raw, separated_list1(char(','), range_bound))?),
        Operator::Within | Operator::NotWithin | Operator::Intersects | Operator::NotIntersects => {
            FilterValue::BoundingBox(parse_bbox(raw)?)
        }
    };

    if let FilterValue::List(values) = &value {
        if values.is_empty() {
            return Err(ParseError::new(format!("Missing value in expression '{}'", input)));
        }
    }

    Ok(Expression {
        field: field.to_string(),
        op,
        value,
    })
}

fn operator(input: &str) -> IResult<&str, Operator> {
    alt((
        value(Operator::Eq, tag("eq")),
        value(Operator::Ne, tag("ne")),
        value(Operator::Like, tag("like")),
        value(Operator::Gte, tag("gte")),
        value(Operator::Gt, tag("gt")),
        value(Operator::Lte, tag("lte")),
        value(Operator::Lt, tag("lt")),
        value(Operator::Range, tag("range")),
        value(Operator::Within, tag("within")),
        value(Operator::NotWithin, tag("notwithin")),
        value(Operator::Intersects, tag("intersects")),
        value(Operator::NotIntersects, tag("notintersects")),
    ))(input)
}

/// `[lo<hi]`; a bracket facing the value is inclusive
fn range_bound(input: &str) -> IResult<&str, RangeBound> {
    let (input, open) = alt((char('['), char(']')))(input)?;
    let (input, lower) = take_while1(|c: char| c != '<')(input)?;
    let (input, _) = char('<')(input)?;
    let (input, upper) = take_while1(|c: char| c != ']' && c != '[')(input)?;
    let (input, close) = alt((char(']'), char('[')))(input)?;

    Ok((input, RangeBound {
        lower: lower.trim().to_string(),
        upper: upper.trim().to_string(),
        lower_inclusive: open == '[',
        upper_inclusive: close == ']',
    }))
}

/// Parse a `west,south,east,north` bounding box; `west > east` crosses the
/// antimeridian
pub fn parse_bbox(input: &str) -> Result<BoundingBox, ParseError> {
    let (west, _, south, _, east, _, north) = run(
        input.trim(),
        tuple((double, comma, double, comma, double, comma, double)),
    )?;

    if !(-90.0..=90.0).contains(&south) || !(-90.0..=90.0).contains(&north) || south > north {
        return Err(ParseError::new(format!("Invalid latitudes in bounding box '{}'", input)));
    }
    if !(-180.0..=180.0).contains(&west) || !(-180.0..=180.0).contains(&east) {
        return Err(ParseError::new(format!("Invalid longitudes in bounding box '{}'", input)));
    }

    Ok(BoundingBox { west, south, east, north })
}

// ============================================================================
// Full text
// ============================================================================

/// Parse a full-text clause: `text` or `field:text`
pub fn parse_full_text(input: &str) -> Result<FullTextClause, ParseError> {
    let input = input.trim();
    let prefixed: IResult<&str, &str> = tuple((field_path, char(':')))(input).map(|(rest, (f, _))| (rest, f));

    let clause = match prefixed {
        Ok((text, field)) if !text.trim().is_empty() => FullTextClause {
            field: Some(field.to_string()),
            text: text.trim().to_string(),
        },
        _ => FullTextClause {
            field: None,
            text: input.to_string(),
        },
    };

    if clause.text.is_empty() {
        return Err(ParseError::new("Full-text clause cannot be empty"));
    }
    Ok(clause)
}

// ============================================================================
// Sorting
// ============================================================================

/// Parse a comma-separated sort spec
pub fn parse_sort(input: &str) -> Result<Vec<SortTerm>, ParseError> {
    run(
        input.trim(),
        separated_list1(comma, sort_term),
    )
}

fn sort_term(input: &str) -> IResult<&str, SortTerm> {
    alt((geodistance_term, field_sort_term))(input)
}

fn sort_sign(input: &str) -> IResult<&str, SortOrder> {
    map(opt(alt((char('+'), char('-')))), |sign| match sign {
        Some('-') => SortOrder::Desc,
        _ => SortOrder::Asc,
    })(input)
}

fn geodistance_term(input: &str) -> IResult<&str, SortTerm> {
    let (input, order) = sort_sign(input)?;
    let (input, _) = tag("geodistance:")(input)?;
    let (input, lat) = double(input)?;
    let (input, _) = multispace1(input)?;
    let (input, lon) = double(input)?;

    Ok((input, SortTerm::GeoDistance {
        field: None,
        lat,
        lon,
        order,
    }))
}

fn field_sort_term(input: &str) -> IResult<&str, SortTerm> {
    let (input, order) = sort_sign(input)?;
    let (input, field) = field_path(input)?;
    Ok((input, SortTerm::Field {
        field: field.to_string(),
        order,
    }))
}

// ============================================================================
// Aggregations
// ============================================================================

/// Parse one aggregation level: `type:field[:key-value]*`
pub fn parse_aggregation(input: &str) -> Result<Aggregation, ParseError> {
    let mut parts = input.trim().split(':');

    let agg_type = match parts.next().unwrap_or_default() {
        "datehistogram" => AggregationType::DateHistogram,
        "histogram" => AggregationType::Histogram,
        "term" => AggregationType::Term,
        "geohash" => AggregationType::Geohash,
        "geotile" => AggregationType::Geotile,
        "h3" => AggregationType::H3,
        other => {
            return Err(ParseError::new(format!("Unknown aggregation type '{}'", other)));
        }
    };

    let field = parts.next().unwrap_or_default();
    run(field, field_path)?;
    let mut agg = Aggregation::new(agg_type, field);

    let mut collect_fields = Vec::new();
    let mut collect_fcts = Vec::new();
    let mut seen = Vec::new();

    for part in parts {
        let (key, val) = part
            .split_once('-')
            .ok_or_else(|| ParseError::new(format!("Expected key-value pair, got '{}'", part)))?;
        if val.is_empty() {
            return Err(ParseError::new(format!("Missing value for '{}'", key)));
        }
        if !key.starts_with("collect_") {
            if seen.contains(&key) {
                return Err(ParseError::new(format!("Duplicate key '{}' in aggregation", key)));
            }
            seen.push(key);
        }

        match key {
            "interval" => agg.interval = Some(parse_interval(val)?),
            "format" => agg.format = Some(val.to_string()),
            "collect_field" => collect_fields.push(run(val, field_path)?.to_string()),
            "collect_fct" => collect_fcts.push(run(val, collection_function)?),
            "order" => agg.order = Some(run(val, sort_order_word)?),
            "on" => agg.on = Some(run(val, order_on)?),
            "size" => agg.size = Some(run(val, unsigned)?),
            "include" => agg.include = Some(val.to_string()),
            "aggregated_geometries" => {
                agg.aggregated_geometries = run(val, separated_list1(char(','), aggregated_geometry))?
            }
            "raw_geometries" => agg.raw_geometries = parse_raw_geometries(val)?,
            "fetch_hits" => agg.fetch_hits = Some(parse_fetch_hits(val)?),
            other => {
                return Err(ParseError::new(format!("Unknown aggregation key '{}'", other)));
            }
        }
    }

    if collect_fields.len() != collect_fcts.len() {
        return Err(ParseError::new(
            "Each 'collect_field' must be paired with a 'collect_fct'",
        ));
    }
    agg.metrics = collect_fields
        .into_iter()
        .zip(collect_fcts)
        .map(|(field, function)| Metric { field, function })
        .collect();

    Ok(agg)
}

/// Parse an interval: a number with an optional calendar unit
pub fn parse_interval(input: &str) -> Result<Interval, ParseError> {
    let (value, unit) = run(input, tuple((double, opt(calendar_unit))))?;
    if value < 0.0 || !value.is_finite() {
        return Err(ParseError::new(format!("Interval must be positive, got '{}'", input)));
    }
    Ok(Interval { value, unit })
}

fn calendar_unit(input: &str) -> IResult<&str, CalendarUnit> {
    alt((
        value(CalendarUnit::Second, tag("second")),
        value(CalendarUnit::Minute, tag("minute")),
        value(CalendarUnit::Hour, tag("hour")),
        value(CalendarUnit::Day, tag("day")),
        value(CalendarUnit::Week, tag("week")),
        value(CalendarUnit::Month, tag("month")),
        value(CalendarUnit::Quarter, tag("quarter")),
        value(CalendarUnit::Year, tag("year")),
    ))(input)
}

/// Parse a metric function name (`avg`, `geocentroid`, ...)
pub fn parse_function(input: &str) -> Result<CollectionFunction, ParseError> {
    run(input.trim(), collection_function)
}

fn collection_function(input: &str) -> IResult<&str, CollectionFunction> {
    alt((
        value(CollectionFunction::Avg, tag("avg")),
        value(CollectionFunction::Sum, tag("sum")),
        value(CollectionFunction::Min, tag("min")),
        value(CollectionFunction::Max, tag("max")),
        value(CollectionFunction::Cardinality, tag("cardinality")),
        value(CollectionFunction::GeoBbox, tag("geobbox")),
        value(CollectionFunction::GeoCentroid, tag("geocentroid")),
    ))(input)
}

fn sort_order_word(input: &str) -> IResult<&str, SortOrder> {
    alt((
        value(SortOrder::Asc, tag("asc")),
        value(SortOrder::Desc, tag("desc")),
    ))(input)
}

fn order_on(input: &str) -> IResult<&str, OrderOn> {
    alt((
        value(OrderOn::Field, tag("field")),
        value(OrderOn::Count, tag("count")),
        value(OrderOn::Result, tag("result")),
    ))(input)
}

fn aggregated_geometry(input: &str) -> IResult<&str, AggregatedGeometry> {
    alt((
        value(AggregatedGeometry::Bbox, tag("bbox")),
        value(AggregatedGeometry::CellCenter, tag("cell_center")),
        value(AggregatedGeometry::Cell, tag("cell")),
        value(AggregatedGeometry::Centroid, tag("centroid")),
    ))(input)
}

/// Parse `geo1,geo2(+s1,-s2);geo3`: each group shares the sort in parentheses
pub fn parse_raw_geometries(input: &str) -> Result<Vec<RawGeometry>, ParseError> {
    let groups = run(input, separated_list1(char(';'), raw_geometry_group))?;
    Ok(groups
        .into_iter()
        .flat_map(|(fields, sort)| {
            fields.into_iter().map(move |field| RawGeometry {
                field: field.to_string(),
                sort: sort.clone(),
            })
        })
        .collect())
}

fn raw_geometry_group(input: &str) -> IResult<&str, (Vec<&str>, Vec<SortTerm>)> {
    let (input, fields) = separated_list1(char(','), field_path)(input)?;
    let (input, sort) = opt(delimited(
        char('('),
        separated_list1(char(','), sort_term),
        char(')'),
    ))(input)?;
    Ok((input, (fields, sort.unwrap_or_default())))
}

/// Parse `N` or `N(+a,-b,c)`
pub fn parse_fetch_hits(input: &str) -> Result<FetchHits, ParseError> {
    let (size, terms) = run(
        input,
        tuple((
            unsigned,
            opt(delimited(
                char('('),
                separated_list1(char(','), tuple((opt(alt((char('+'), char('-')))), field_path))),
                char(')'),
            )),
        )),
    )?;

    let mut hits = FetchHits {
        size,
        include: Vec::new(),
        sort: Vec::new(),
    };
    for (sign, field) in terms.unwrap_or_default() {
        hits.include.push(field.to_string());
        if let Some(sign) = sign {
            hits.sort.push(SortTerm::Field {
                field: field.to_string(),
                order: if sign == '-' { SortOrder::Desc } else { SortOrder::Asc },
            });
        }
    }
    Ok(hits)
}

// ============================================================================
// Primitives
// ============================================================================

fn is_path_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.' || c == '-' || c == '*'
}

/// A dotted field path; cannot start with a sign
fn field_path(input: &str) -> IResult<&str, &str> {
    let (rest, path) = take_while1(is_path_char)(input)?;
    if path.starts_with('-') {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    Ok((rest, path))
}

fn comma(input: &str) -> IResult<&str, (&str, char, &str)> {
    tuple((multispace0, char(','), multispace0))(input)
}

fn unsigned(input: &str) -> IResult<&str, usize> {
    map_res(digit1, str::parse::<usize>)(input)
}
