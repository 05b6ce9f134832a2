//! Google encoded-polyline decoding.
//!
//! Each coordinate is stored as the delta from the previous one, scaled by
//! `10^precision`, zig-zag mapped to an unsigned value and written as
//! little-endian 5-bit groups. A group carries the continuation flag `0x20`
//! when more groups follow, and every group is offset by 63 so the output
//! stays within printable ASCII. Latitude and longitude deltas alternate.

use thiserror::Error;

use crate::geo::{GeoPoint, Route};

/// Precision used by the directions service (five decimal places).
pub const DEFAULT_PRECISION: u32 = 5;

const CHAR_OFFSET: u8 = 63;
const CONTINUATION: u8 = 0x20;
const PAYLOAD_MASK: u8 = 0x1f;

/// Errors raised while decoding a polyline. Offsets are byte offsets into the
/// input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The input ended inside a group, or after a latitude with no longitude.
    #[error("unterminated group starting at byte {offset}")]
    Unterminated { offset: usize },

    /// A character outside the `?`..=`~` alphabet.
    #[error("invalid character {character:?} at byte {offset}")]
    InvalidCharacter { character: char, offset: usize },

    /// A value too large for a 64-bit accumulator.
    #[error("value starting at byte {offset} overflows")]
    Overflow { offset: usize },
}

/// Decodes `encoded` into a route using [`DEFAULT_PRECISION`].
pub fn decode_default(encoded: &str) -> Result<Route, DecodeError> {
    decode(encoded, DEFAULT_PRECISION)
}

/// Decodes `encoded` into a route. An empty string yields an empty route.
///
/// The whole input must be consumed by complete latitude/longitude pairs;
/// any trailing partial group is an error.
pub fn decode(encoded: &str, precision: u32) -> Result<Route, DecodeError> {
    let factor = scale(precision);
    let mut index = 0;
    let mut latitude: i64 = 0;
    let mut longitude: i64 = 0;
    let mut points = Vec::new();

    while index < encoded.len() {
        let start = index;
        let delta = next_value(encoded, &mut index)?;
        latitude = latitude
            .checked_add(delta)
            .ok_or(DecodeError::Overflow { offset: start })?;

        let start = index;
        let delta = next_value(encoded, &mut index)?;
        longitude = longitude
            .checked_add(delta)
            .ok_or(DecodeError::Overflow { offset: start })?;

        points.push(GeoPoint::new(
            latitude as f64 / factor,
            longitude as f64 / factor,
        ));
    }

    Ok(Route::from(points))
}

/// Reads one zig-zag encoded value starting at `*index` and advances the
/// cursor past it.
fn next_value(encoded: &str, index: &mut usize) -> Result<i64, DecodeError> {
    let bytes = encoded.as_bytes();
    let start = *index;
    let mut result: u64 = 0;
    let mut shift: u32 = 0;

    loop {
        let Some(&byte) = bytes.get(*index) else {
            return Err(DecodeError::Unterminated { offset: start });
        };
        if !(CHAR_OFFSET..=b'~').contains(&byte) {
            let character = encoded[*index..].chars().next().unwrap_or('\u{fffd}');
            return Err(DecodeError::InvalidCharacter {
                character,
                offset: *index,
            });
        }
        *index += 1;

        let chunk = byte - CHAR_OFFSET;
        let bits = u64::from(chunk & PAYLOAD_MASK);
        if shift >= 64 || (shift > 59 && bits >> (64 - shift) != 0) {
            return Err(DecodeError::Overflow { offset: start });
        }
        result |= bits << shift;
        shift += 5;

        if chunk < CONTINUATION {
            break;
        }
    }

    let magnitude = (result >> 1) as i64;
    Ok(if result & 1 == 1 {
        -magnitude - 1
    } else {
        magnitude
    })
}

/// Encodes points with the same scheme [`decode`] reads.
pub fn encode(points: &[GeoPoint], precision: u32) -> String {
    let factor = scale(precision);
    let mut out = String::new();
    let mut previous = (0i64, 0i64);

    for point in points {
        let latitude = (point.latitude * factor).round() as i64;
        let longitude = (point.longitude * factor).round() as i64;
        push_value(latitude - previous.0, &mut out);
        push_value(longitude - previous.1, &mut out);
        previous = (latitude, longitude);
    }

    out
}

fn push_value(delta: i64, out: &mut String) {
    let mut value = ((delta << 1) ^ (delta >> 63)) as u64;
    while value >= u64::from(CONTINUATION) {
        let chunk = (value as u8 & PAYLOAD_MASK) | CONTINUATION;
        out.push(char::from(chunk + CHAR_OFFSET));
        value >>= 5;
    }
    out.push(char::from(value as u8 + CHAR_OFFSET));
}

fn scale(precision: u32) -> f64 {
    10f64.powi(precision as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REFERENCE: &str = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";

    fn assert_close(actual: GeoPoint, latitude: f64, longitude: f64, epsilon: f64) {
        assert!(
            (actual.latitude - latitude).abs() < epsilon
                && (actual.longitude - longitude).abs() < epsilon,
            "expected ({latitude}, {longitude}), got {actual}"
        );
    }

    #[test]
    fn decodes_reference_polyline() {
        let route = decode_default(REFERENCE).unwrap();
        assert_eq!(route.len(), 3);
        assert_close(route.points()[0], 38.5, -120.2, 1e-9);
        assert_close(route.points()[1], 40.7, -120.95, 1e-9);
        assert_close(route.points()[2], 43.252, -126.453, 1e-9);
    }

    #[test]
    fn empty_input_is_an_empty_route() {
        let route = decode_default("").unwrap();
        assert!(route.is_empty());
    }

    #[test]
    fn latitude_without_longitude_is_unterminated() {
        // "_p~iF" is a complete latitude for 38.5 and nothing else.
        let err = decode_default("_p~iF").unwrap_err();
        assert_eq!(err, DecodeError::Unterminated { offset: 5 });
    }

    #[test]
    fn trailing_continuation_group_is_unterminated() {
        let mut input = REFERENCE.to_string();
        input.push('_');
        let err = decode_default(&input).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Unterminated {
                offset: REFERENCE.len()
            }
        );
    }

    #[test]
    fn rejects_characters_below_the_alphabet() {
        let err = decode_default("_p~iF ps|U").unwrap_err();
        assert_eq!(
            err,
            DecodeError::InvalidCharacter {
                character: ' ',
                offset: 5
            }
        );
    }

    #[test]
    fn rejects_non_ascii_input() {
        let err = decode_default("é").unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidCharacter {
                character: 'é',
                offset: 0
            }
        ));
    }

    #[test]
    fn rejects_overlong_groups() {
        let input = "~".repeat(14) + "?";
        let err = decode_default(&input).unwrap_err();
        assert_eq!(err, DecodeError::Overflow { offset: 0 });
    }

    #[test]
    fn encode_reproduces_reference() {
        let points = [
            GeoPoint::new(38.5, -120.2),
            GeoPoint::new(40.7, -120.95),
            GeoPoint::new(43.252, -126.453),
        ];
        assert_eq!(encode(&points, DEFAULT_PRECISION), REFERENCE);
    }

    #[test]
    fn round_trip_stays_within_precision() {
        let points = [
            GeoPoint::new(51.507351, -0.127758),
            GeoPoint::new(51.50874, -0.12801),
            GeoPoint::new(-33.868820, 151.209296),
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(89.99999, -179.99999),
        ];
        for precision in [5, 6] {
            let encoded = encode(&points, precision);
            let route = decode(&encoded, precision).unwrap();
            assert_eq!(route.len(), points.len());
            let epsilon = 10f64.powi(-(precision as i32));
            for (decoded, original) in route.points().iter().zip(points.iter()) {
                assert_close(*decoded, original.latitude, original.longitude, epsilon);
            }
        }
    }
}
