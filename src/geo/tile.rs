//! Web-mercator slippy tiles (`z/x/y`)

use geo_types::{coord, Rect};
use std::f64::consts::PI;

/// Deepest zoom level the backends accept
pub const MAX_ZOOM: u32 = 29;

/// Latitude limit of the web-mercator projection
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

fn tile_latitude(y: f64, n: f64) -> f64 {
    (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees()
}

/// Bounds of tile `z/x/y`; `None` when the tile does not exist
pub fn bounds(z: u32, x: u32, y: u32) -> Option<Rect<f64>> {
    if z > MAX_ZOOM {
        return None;
    }
    let n = 2f64.powi(z as i32);
    if f64::from(x) >= n || f64::from(y) >= n {
        return None;
    }

    let west = f64::from(x) / n * 360.0 - 180.0;
    let east = f64::from(x + 1) / n * 360.0 - 180.0;
    let north = tile_latitude(f64::from(y), n);
    let south = tile_latitude(f64::from(y + 1), n);

    Some(Rect::new(
        coord! { x: west, y: south },
        coord! { x: east, y: north },
    ))
}

/// Tile coordinates holding a point at zoom `z`
pub fn tile_of(lon: f64, lat: f64, z: u32) -> (u32, u32) {
    let n = 2f64.powi(z as i32);
    let max = n as u32 - 1;
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();

    let x = ((lon + 180.0) / 360.0 * n).floor();
    let y = ((1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * n).floor();

    (
        (x.max(0.0) as u32).min(max),
        (y.max(0.0) as u32).min(max),
    )
}

/// Parse a `z/x/y` key
pub fn parse_key(key: &str) -> Option<(u32, u32, u32)> {
    let mut parts = key.split('/').map(str::parse::<u32>);
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(Ok(z)), Some(Ok(x)), Some(Ok(y)), None) => Some((z, x, y)),
        _ => None,
    }
}
