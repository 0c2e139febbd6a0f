//! Geohash encoding and cell decoding

use geo_types::{coord, Rect};

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Longest geohash the backends accept
pub const MAX_PRECISION: usize = 12;

fn index_of(c: char) -> Option<u8> {
    BASE32.iter().position(|&b| b as char == c).map(|i| i as u8)
}

/// Encode a point into a geohash of the given length
pub fn encode(lon: f64, lat: f64, precision: usize) -> String {
    let (mut lon_lo, mut lon_hi) = (-180.0, 180.0);
    let (mut lat_lo, mut lat_hi) = (-90.0, 90.0);
    let mut hash = String::with_capacity(precision);
    let mut even = true;
    let mut bits = 0u8;
    let mut bit_count = 0;

    while hash.len() < precision {
        if even {
            let mid = (lon_lo + lon_hi) / 2.0;
            if lon >= mid {
                bits = (bits << 1) | 1;
                lon_lo = mid;
            } else {
                bits <<= 1;
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if lat >= mid {
                bits = (bits << 1) | 1;
                lat_lo = mid;
            } else {
                bits <<= 1;
                lat_hi = mid;
            }
        }
        even = !even;
        bit_count += 1;

        if bit_count == 5 {
            hash.push(BASE32[bits as usize] as char);
            bits = 0;
            bit_count = 0;
        }
    }
    hash
}

/// Decode the bounds of a geohash cell; `None` for an invalid hash
pub fn decode_bounds(hash: &str) -> Option<Rect<f64>> {
    if hash.is_empty() || hash.len() > MAX_PRECISION {
        return None;
    }

    let (mut lon_lo, mut lon_hi) = (-180.0, 180.0);
    let (mut lat_lo, mut lat_hi) = (-90.0, 90.0);
    let mut even = true;

    for c in hash.chars() {
        let idx = index_of(c.to_ascii_lowercase())?;
        for shift in (0..5).rev() {
            let bit = (idx >> shift) & 1;
            if even {
                let mid = (lon_lo + lon_hi) / 2.0;
                if bit == 1 {
                    lon_lo = mid;
                } else {
                    lon_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if bit == 1 {
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }
            even = !even;
        }
    }

    Some(Rect::new(
        coord! { x: lon_lo, y: lat_lo },
        coord! { x: lon_hi, y: lat_hi },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_point() {
        // Jutland, Denmark
        assert_eq!(encode(10.40744, 57.64911, 11), "u4pruydqqvj");
    }

    #[test]
    fn test_decode_contains_encoded_point() {
        let hash = encode(1.44, 43.6, 6);
        let rect = decode_bounds(&hash).unwrap();
        assert!(rect.min().x <= 1.44 && rect.max().x >= 1.44);
        assert!(rect.min().y <= 43.6 && rect.max().y >= 43.6);
    }

    #[test]
    fn test_first_level_cells() {
        let rect = decode_bounds("s").unwrap();
        assert_eq!(rect.min().x, 0.0);
        assert_eq!(rect.max().x, 45.0);
        assert_eq!(rect.min().y, 0.0);
        assert_eq!(rect.max().y, 45.0);
    }

    #[test]
    fn test_invalid_hash() {
        assert!(decode_bounds("").is_none());
        assert!(decode_bounds("abc").is_none()); // 'a' is not in the alphabet
        assert!(decode_bounds("0123456789bcd").is_none());
    }
}
