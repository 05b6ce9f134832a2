//! Compass bearing between two positions.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI, TAU};

use crate::geo::GeoPoint;

/// Latitudes are kept this far (radians) inside the poles so the Mercator
/// term stays finite.
const POLE_GUARD: f64 = 1e-9;

/// Bearing in degrees from `from` to `to`, in `[0, 360)`, 0 = north,
/// clockwise.
///
/// Uses the Mercator-stretched latitude difference
/// `ln(tan(φ2/2 + π/4) / tan(φ1/2 + π/4))` and the longitude difference
/// wrapped onto the shorter side of the antimeridian. Identical points give
/// `0.0`.
pub fn bearing(from: GeoPoint, to: GeoPoint) -> f64 {
    let phi1 = clamp_latitude(from.latitude.to_radians());
    let phi2 = clamp_latitude(to.latitude.to_radians());

    let mut delta_lambda = (to.longitude - from.longitude).to_radians();
    if delta_lambda.abs() > PI {
        delta_lambda -= delta_lambda.signum() * TAU;
    }

    let delta_phi = (mercator(phi2) / mercator(phi1)).ln();
    if !delta_phi.is_finite() || !delta_lambda.is_finite() {
        return 0.0;
    }

    let degrees = (delta_lambda.atan2(delta_phi).to_degrees() + 360.0) % 360.0;
    if (0.0..360.0).contains(&degrees) {
        degrees
    } else {
        0.0
    }
}

fn mercator(phi: f64) -> f64 {
    (phi / 2.0 + FRAC_PI_4).tan()
}

fn clamp_latitude(phi: f64) -> f64 {
    phi.clamp(-FRAC_PI_2 + POLE_GUARD, FRAC_PI_2 - POLE_GUARD)
}
