pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PdrError, PdrResult};

/// Earth gravity (m/s²)
pub const GRAVITY: f64 = 9.81;

pub const NANOS_PER_SEC: f64 = 1e9;
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Seconds between two monotonic nanosecond timestamps (negative if `later` precedes `earlier`).
pub fn secs_between(earlier: u64, later: u64) -> f64 {
    (later as f64 - earlier as f64) / NANOS_PER_SEC
}

// ─── Raw sensor input ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Accel,
    Gyro,
    Mag,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Accel, Channel::Gyro, Channel::Mag];

    pub fn index(self) -> usize {
        match self {
            Channel::Accel => 0,
            Channel::Gyro => 1,
            Channel::Mag => 2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Accel => "accelerometer",
            Channel::Gyro => "gyroscope",
            Channel::Mag => "magnetometer",
        };
        f.write_str(name)
    }
}

/// One tri-axial reading from a single sensor source.
///
/// Units: m/s² (accel), rad/s (gyro), µT (mag). A device at rest reads the
/// gravity vector on the accelerometer, i.e. `(0, 0, -g)` when lying level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelReading {
    pub channel: Channel,
    pub t_ns: u64,
    pub value: Vec3,
}

impl ChannelReading {
    pub fn new(channel: Channel, t_ns: u64, x: f64, y: f64, z: f64) -> Self {
        Self {
            channel,
            t_ns,
            value: Vec3::new(x, y, z),
        }
    }
}

// ─── Unified sample ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Reading taken within the tolerance window of this sample.
    Fresh,
    /// Channel was late; the last valid value was carried forward.
    Filled,
    /// Channel has never produced a reading.
    Missing,
}

impl ChannelStatus {
    pub fn is_usable(self) -> bool {
        !matches!(self, ChannelStatus::Missing)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidFlags {
    pub accel: ChannelStatus,
    pub gyro: ChannelStatus,
    pub mag: ChannelStatus,
}

impl ValidFlags {
    pub const ALL_FRESH: ValidFlags = ValidFlags {
        accel: ChannelStatus::Fresh,
        gyro: ChannelStatus::Fresh,
        mag: ChannelStatus::Fresh,
    };

    pub fn status(&self, channel: Channel) -> ChannelStatus {
        match channel {
            Channel::Accel => self.accel,
            Channel::Gyro => self.gyro,
            Channel::Mag => self.mag,
        }
    }

    pub fn set(&mut self, channel: Channel, status: ChannelStatus) {
        match channel {
            Channel::Accel => self.accel = status,
            Channel::Gyro => self.gyro = status,
            Channel::Mag => self.mag = status,
        }
    }

    pub fn has(&self, channel: Channel) -> bool {
        self.status(channel).is_usable()
    }
}

/// Unified accel/gyro/mag sample emitted by the intake.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorSample {
    pub t_ns: u64,
    pub accel: Vec3,
    pub gyro: Vec3,
    pub mag: Vec3,
    pub valid: ValidFlags,
}

impl SensorSample {
    pub fn new(t_ns: u64, accel: Vec3, gyro: Vec3, mag: Vec3) -> Self {
        Self {
            t_ns,
            accel,
            gyro,
            mag,
            valid: ValidFlags::ALL_FRESH,
        }
    }

    pub fn without(mut self, channel: Channel) -> Self {
        self.valid.set(channel, ChannelStatus::Missing);
        self
    }

    pub fn value(&self, channel: Channel) -> Vec3 {
        match channel {
            Channel::Accel => self.accel,
            Channel::Gyro => self.gyro,
            Channel::Mag => self.mag,
        }
    }

    /// Split into per-channel readings, skipping missing channels.
    pub fn readings(&self) -> impl Iterator<Item = ChannelReading> + '_ {
        Channel::ALL
            .into_iter()
            .filter(|c| self.valid.has(*c))
            .map(|c| ChannelReading {
                channel: c,
                t_ns: self.t_ns,
                value: self.value(c),
            })
    }
}

// ─── Steps ───────────────────────────────────────────────────────────────────

/// Step event reported by the platform pedometer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeStep {
    pub t_ns: u64,
    pub total_steps: u64,
    pub length_m: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSource {
    /// Detected candidate confirmed by a platform step within the match window.
    Native {
        total_steps: u64,
        length_m: Option<f64>,
    },
    Detected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Vertical,
    MagnitudeFallback,
}

/// Immutable step event.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub t_ns: u64,
    pub vertical_peak_magnitude: f64,
    pub cadence_hz: f64,
    pub inter_step_ms: u32,
    pub confidence: f64,
    pub source: StepSource,
    pub method: DetectionMethod,
}

impl StepEvent {
    pub fn is_native(&self) -> bool {
        matches!(self.source, StepSource::Native { .. })
    }

    pub fn platform_length(&self) -> Option<f64> {
        match self.source {
            StepSource::Native { length_m, .. } => length_m,
            StepSource::Detected => None,
        }
    }
}

/// Step with its metric stride and the heading it was taken along.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrideSample {
    pub step: StepEvent,
    pub delta_s: f64,
    pub heading: f64,
}

impl StrideSample {
    /// World-frame displacement `Δs · (cos θ, sin θ)`.
    pub fn displacement(&self) -> (f64, f64) {
        (
            self.delta_s * self.heading.cos(),
            self.delta_s * self.heading.sin(),
        )
    }
}

// ─── Outputs ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    /// Heading in (−π, π]
    pub theta: f64,
    /// 0..1
    pub confidence: f64,
    pub t_ns: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub x: f64,
    pub y: f64,
    pub t_ns: u64,
    pub confidence: f64,
    /// Position was replaced by the outlier projection.
    pub corrected: bool,
    /// First point kept after the filter re-anchored.
    pub after_reset: bool,
}

impl TrajectoryPoint {
    pub fn distance_to(&self, other: &TrajectoryPoint) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    Stationary,
    Walking,
    Degraded,
}

/// Snapshot of the attitude tracker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttitudeState {
    /// Body → world
    pub q_bw: Quat,
    pub omega_world: Vec3,
    pub is_stable: bool,
    pub stability_ms: u32,
    pub accel_variance: f32,
    pub mag_confidence: f64,
    /// Smoothed heading in (−π, π]
    pub heading: f64,
}

impl Default for AttitudeState {
    fn default() -> Self {
        Self {
            q_bw: Quat::identity(),
            omega_world: Vec3::zeros(),
            is_stable: false,
            stability_ms: 0,
            accel_variance: 0.0,
            mag_confidence: 0.0,
            heading: 0.0,
        }
    }
}

// ─── User profile ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub height_m: f64,
    pub weight_kg: Option<f64>,
}

impl UserProfile {
    pub fn new(height_m: f64) -> Self {
        Self {
            height_m,
            weight_kg: None,
        }
    }

    pub fn validate(&self) -> PdrResult<()> {
        if !(0.5..=2.5).contains(&self.height_m) {
            return Err(PdrError::ConfigInvalid(format!(
                "height_m must be within [0.5, 2.5], got {}",
                self.height_m
            )));
        }
        if let Some(w) = self.weight_kg {
            if !(w.is_finite() && w > 0.0) {
                return Err(PdrError::ConfigInvalid(format!(
                    "weight_kg must be positive, got {}",
                    w
                )));
            }
        }
        Ok(())
    }
}

impl Default for UserProfile {
    fn default() -> Self {
        Self::new(1.75)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_readings_skip_missing_channels() {
        let sample = SensorSample::new(
            10,
            Vec3::new(0.0, 0.0, -GRAVITY),
            Vec3::zeros(),
            Vec3::new(20.0, 0.0, 40.0),
        )
        .without(Channel::Mag);

        let channels: Vec<Channel> = sample.readings().map(|r| r.channel).collect();
        assert_eq!(channels, vec![Channel::Accel, Channel::Gyro]);
    }

    #[test]
    fn test_stride_displacement() {
        let step = StepEvent {
            t_ns: 0,
            vertical_peak_magnitude: 1.2,
            cadence_hz: 2.0,
            inter_step_ms: 500,
            confidence: 0.9,
            source: StepSource::Detected,
            method: DetectionMethod::Vertical,
        };
        let stride = StrideSample {
            step,
            delta_s: 0.75,
            heading: -std::f64::consts::FRAC_PI_2,
        };
        let (dx, dy) = stride.displacement();
        assert_relative_eq!(dx, 0.0, epsilon = 1e-12);
        assert_relative_eq!(dy, -0.75, epsilon = 1e-12);
    }

    #[test]
    fn test_profile_validation() {
        assert!(UserProfile::new(1.75).validate().is_ok());
        assert!(UserProfile::new(0.2).validate().is_err());
        let profile = UserProfile {
            height_m: 1.8,
            weight_kg: Some(-3.0),
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_step_source_serializes_tagged() {
        let source = StepSource::Native {
            total_steps: 12,
            length_m: Some(0.7),
        };
        let json = serde_json::to_string(&source).unwrap();
        assert!(json.contains("\"kind\":\"native\""));
    }
}
