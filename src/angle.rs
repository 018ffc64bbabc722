//! Angle wrap-around. Every heading difference in the crate goes through here.

use std::f64::consts::{PI, TAU};

/// Wrap an angle to (−π, π].
pub fn wrap(angle: f64) -> f64 {
    if !angle.is_finite() {
        return angle;
    }
    let mut a = angle.rem_euclid(TAU); // [0, 2π)
    if a > PI {
        a -= TAU;
    }
    a
}

/// Shortest signed difference `a − b`, wrapped to (−π, π].
pub fn diff(a: f64, b: f64) -> f64 {
    wrap(a - b)
}

/// Move `from` toward `to` by `gain` along the shortest arc.
pub fn blend(from: f64, to: f64, gain: f64) -> f64 {
    wrap(from + gain * diff(to, from))
}

pub fn in_range(angle: f64) -> bool {
    angle > -PI && angle <= PI
}
