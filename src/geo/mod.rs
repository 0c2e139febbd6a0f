//! Geospatial helpers: geohash and geotile cells, box arithmetic and GeoJSON
//! rendering of the geometries carried by aggregation responses.

pub mod geohash;
pub mod tile;

use crate::error::{Error, Result};
use geo_types::{coord, Geometry, Point, Rect};
use serde_json::{json, Value};
use std::fmt;

/// The cell a geo-aggregation request is scoped to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoCell {
    Geohash(String),
    Tile { z: u32, x: u32, y: u32 },
}

impl GeoCell {
    /// Parse `z/x/y` as a tile, anything else as a geohash
    pub fn parse(input: &str) -> Result<Self> {
        if input.contains('/') {
            let (z, x, y) = tile::parse_key(input)
                .ok_or_else(|| Error::invalid_parameter(format!("'{}' is not a z/x/y tile", input)))?;
            let cell = GeoCell::Tile { z, x, y };
            cell.bounds()?;
            Ok(cell)
        } else {
            let cell = GeoCell::Geohash(input.to_ascii_lowercase());
            cell.bounds()?;
            Ok(cell)
        }
    }

    /// Geohash length or tile zoom
    pub fn level(&self) -> u32 {
        match self {
            GeoCell::Geohash(hash) => hash.len() as u32,
            GeoCell::Tile { z, .. } => *z,
        }
    }

    pub fn bounds(&self) -> Result<Rect<f64>> {
        match self {
            GeoCell::Geohash(hash) => geohash::decode_bounds(hash)
                .ok_or_else(|| Error::invalid_parameter(format!("'{}' is not a valid geohash", hash))),
            GeoCell::Tile { z, x, y } => tile::bounds(*z, *x, *y)
                .ok_or_else(|| Error::invalid_parameter(format!("Tile {}/{}/{} does not exist", z, x, y))),
        }
    }
}

impl fmt::Display for GeoCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoCell::Geohash(hash) => f.write_str(hash),
            GeoCell::Tile { z, x, y } => write!(f, "{}/{}/{}", z, x, y),
        }
    }
}

/// Split a box into four equal quadrants: south-west, south-east, north-west, north-east
pub fn split_quadrants(rect: &Rect<f64>) -> [Rect<f64>; 4] {
    let (min, max) = (rect.min(), rect.max());
    let center = rect.center();
    [
        Rect::new(min, center),
        Rect::new(coord! { x: center.x, y: min.y }, coord! { x: max.x, y: center.y }),
        Rect::new(coord! { x: min.x, y: center.y }, coord! { x: center.x, y: max.y }),
        Rect::new(center, max),
    ]
}

/// Move every edge of the box inward by `epsilon`
pub fn shrink(rect: &Rect<f64>, epsilon: f64) -> Rect<f64> {
    let (min, max) = (rect.min(), rect.max());
    Rect::new(
        coord! { x: min.x + epsilon, y: min.y + epsilon },
        coord! { x: max.x - epsilon, y: max.y - epsilon },
    )
}

pub fn to_bounding_box(rect: &Rect<f64>) -> exql::BoundingBox {
    exql::BoundingBox {
        west: rect.min().x,
        south: rect.min().y,
        east: rect.max().x,
        north: rect.max().y,
    }
}

/// Areas covered by a request box; a box whose west edge lies east of its
/// east edge crosses the antimeridian and covers two areas
pub fn bbox_areas(bbox: &exql::BoundingBox) -> Vec<Rect<f64>> {
    let area = |west: f64, east: f64| {
        Rect::new(coord! { x: west, y: bbox.south }, coord! { x: east, y: bbox.north })
    };
    if bbox.crosses_antimeridian() {
        vec![area(bbox.west, 180.0), area(-180.0, bbox.east)]
    } else {
        vec![area(bbox.west, bbox.east)]
    }
}

/// Read a point stored as `{lat, lon}`, `[lon, lat]`, `"lat,lon"` or a GeoJSON point
pub fn point_from_value(value: &Value) -> Option<Point<f64>> {
    match value {
        Value::Object(map) => {
            if let (Some(lat), Some(lon)) = (
                map.get("lat").and_then(Value::as_f64),
                map.get("lon").and_then(Value::as_f64),
            ) {
                return Some(Point::new(lon, lat));
            }
            if map.get("type").and_then(Value::as_str) == Some("Point") {
                return map.get("coordinates").and_then(point_from_value);
            }
            None
        }
        Value::Array(coords) if coords.len() == 2 => {
            Some(Point::new(coords[0].as_f64()?, coords[1].as_f64()?))
        }
        Value::String(s) => {
            let (lat, lon) = s.split_once(',')?;
            Some(Point::new(lon.trim().parse().ok()?, lat.trim().parse().ok()?))
        }
        _ => None,
    }
}

/// Bounding box of a stored geometry: a point in any accepted form, or the
/// coordinates of a GeoJSON geometry
pub fn geometry_bounds(value: &Value) -> Option<Rect<f64>> {
    if let Some(point) = point_from_value(value) {
        return Some(Rect::new(point.0, point.0));
    }
    let mut coords = Vec::new();
    collect_coordinates(value.get("coordinates")?, &mut coords);
    let first = *coords.first()?;
    let (min, max) = coords.iter().fold((first, first), |(min, max), &(x, y)| {
        ((min.0.min(x), min.1.min(y)), (max.0.max(x), max.1.max(y)))
    });
    Some(Rect::new(coord! { x: min.0, y: min.1 }, coord! { x: max.0, y: max.1 }))
}

fn collect_coordinates(value: &Value, out: &mut Vec<(f64, f64)>) {
    let Value::Array(items) = value else {
        return;
    };
    match (items.first().and_then(Value::as_f64), items.get(1).and_then(Value::as_f64)) {
        (Some(x), Some(y)) => out.push((x, y)),
        _ => items.iter().for_each(|item| collect_coordinates(item, out)),
    }
}

/// Box `inner` lies entirely inside `outer`
pub fn rect_within(inner: &Rect<f64>, outer: &Rect<f64>) -> bool {
    inner.min().x >= outer.min().x
        && inner.min().y >= outer.min().y
        && inner.max().x <= outer.max().x
        && inner.max().y <= outer.max().y
}

pub fn rects_intersect(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    a.min().x <= b.max().x && b.min().x <= a.max().x && a.min().y <= b.max().y && b.min().y <= a.max().y
}

/// Great-circle distance in meters
pub fn haversine_distance(a: &Point<f64>, b: &Point<f64>) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_008.8;
    let (lat1, lat2) = (a.y().to_radians(), b.y().to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b.x() - a.x()).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Render a geometry as a GeoJSON value
pub fn to_geojson(geometry: &Geometry<f64>) -> Value {
    match geometry {
        Geometry::Point(p) => json!({ "type": "Point", "coordinates": [p.x(), p.y()] }),
        Geometry::Rect(r) => rect_to_geojson(r),
        Geometry::Polygon(poly) => {
            let ring: Vec<[f64; 2]> = poly.exterior().coords().map(|c| [c.x, c.y]).collect();
            json!({ "type": "Polygon", "coordinates": [ring] })
        }
        other => json!({ "type": "GeometryCollection", "geometries": [], "unsupported": format!("{:?}", other) }),
    }
}

fn rect_to_geojson(rect: &Rect<f64>) -> Value {
    let (min, max) = (rect.min(), rect.max());
    json!({
        "type": "Polygon",
        "coordinates": [[
            [min.x, max.y],
            [max.x, max.y],
            [max.x, min.y],
            [min.x, min.y],
            [min.x, max.y]
        ]]
    })
}
