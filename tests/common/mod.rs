//! Synthetic walker for scenario tests.
//!
//! Samples are generated at 50 Hz for a walker whose body frame is rotated about
//! world z by `yaw`, optionally with the phone mounted at a fixed rotation.

#![allow(dead_code)]

use std::f64::consts::PI;

use pdr_core::calibration::{CalibrationSnapshot, CalibrationState};
use pdr_core::events::PdrEvent;
use pdr_core::types::{Quat, Rot3, SensorSample, Vec3, GRAVITY};
use pdr_core::{PdrConfig, PdrSession, UserProfile};

pub const DT_NS: u64 = 20_000_000;
pub const DT_S: f64 = 0.02;
pub const STEP_PERIOD_S: f64 = 0.5;
/// Local field in the world frame (µT): horizontal along +x, vertical component up.
pub const MAG_WORLD: [f64; 3] = [20.0, 0.0, 40.0];
/// Anthropometric stride of the default 1.75 m walker at 2 Hz.
pub const STRIDE_M: f64 = 0.75;

/// Vertical acceleration shape of one step (peak +1.2 m/s², trough −0.5 m/s²).
#[derive(Clone, Copy, Debug)]
pub enum StepWave {
    /// Peak over the first 200 ms, trough over the next 200 ms.
    Sharp,
    /// Larger, zero-mean footfall (+1.6 / −1.07 m/s²) with a fore-aft surge.
    Balanced,
}

impl StepWave {
    /// Upward acceleration `tau` seconds into the step.
    pub fn vertical(self, tau: f64) -> f64 {
        match self {
            StepWave::Sharp => {
                if (0.0..0.2).contains(&tau) {
                    1.2 * (PI * tau / 0.2).sin()
                } else if (0.2..0.4).contains(&tau) {
                    -0.5 * (PI * (tau - 0.2) / 0.2).sin()
                } else {
                    0.0
                }
            }
            StepWave::Balanced => {
                if (0.0..0.2).contains(&tau) {
                    1.6 * (PI * tau / 0.2).sin()
                } else if (0.2..0.5).contains(&tau) {
                    -1.6 * (0.2 / 0.3) * (PI * (tau - 0.2) / 0.3).sin()
                } else {
                    0.0
                }
            }
        }
    }

    pub fn surge(self, tau: f64) -> f64 {
        match self {
            StepWave::Sharp => 0.0,
            // forward push while the body rises, braking while it drops
            StepWave::Balanced => -(2.0 * PI * (tau - 0.1) / STEP_PERIOD_S).sin(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Segment {
    Stand(f64),
    Walk(usize),
    /// Turn in place for `seconds` at `rate` rad/s (positive = left).
    Turn { seconds: f64, rate: f64 },
    /// Stand with the magnetometer field scaled by `scale`.
    Interference { seconds: f64, scale: f64 },
    /// Walk with the magnetometer field scaled by `scale`.
    DisturbedWalk { steps: usize, scale: f64 },
}

pub struct Synth {
    pub t_ns: u64,
    pub yaw: f64,
    /// Body → phone rotation.
    pub mount: Rot3,
    pub wave: StepWave,
}

pub struct Rendered {
    pub samples: Vec<SensorSample>,
    pub peak_times_ns: Vec<u64>,
}

impl Synth {
    pub fn new(wave: StepWave) -> Self {
        Self {
            t_ns: 0,
            yaw: 0.0,
            mount: Rot3::identity(),
            wave,
        }
    }

    pub fn with_mount(mut self, mount: Rot3) -> Self {
        self.mount = mount;
        self
    }

    /// One sample: upward acceleration, fore-aft surge, yaw rate, field scale.
    pub fn next(
        &mut self,
        vertical: f64,
        surge: f64,
        yaw_rate: f64,
        mag_scale: f64,
    ) -> SensorSample {
        if self.t_ns > 0 {
            self.yaw += yaw_rate * DT_S;
        }
        let r_wb = Quat::from_axis_angle(&Vec3::z_axis(), self.yaw);
        let body_accel = Vec3::new(surge, 0.0, -GRAVITY - vertical);
        let body_gyro = Vec3::new(0.0, 0.0, yaw_rate);
        let mag_world = Vec3::new(MAG_WORLD[0], MAG_WORLD[1], MAG_WORLD[2]) * mag_scale;
        let body_mag = r_wb.inverse() * mag_world;

        let sample = SensorSample::new(
            self.t_ns,
            self.mount * body_accel,
            self.mount * body_gyro,
            self.mount * body_mag,
        );
        self.t_ns += DT_NS;
        sample
    }

    pub fn render(&mut self, segments: &[Segment]) -> Rendered {
        let mut samples = Vec::new();
        let mut peak_times_ns = Vec::new();
        for segment in segments {
            match *segment {
                Segment::Stand(seconds) => {
                    for _ in 0..count(seconds) {
                        samples.push(self.next(0.0, 0.0, 0.0, 1.0));
                    }
                }
                Segment::Walk(steps) => {
                    self.walk(steps, 1.0, &mut samples, &mut peak_times_ns);
                }
                Segment::DisturbedWalk { steps, scale } => {
                    self.walk(steps, scale, &mut samples, &mut peak_times_ns);
                }
                Segment::Turn { seconds, rate } => {
                    for _ in 0..count(seconds) {
                        samples.push(self.next(0.0, 0.0, rate, 1.0));
                    }
                }
                Segment::Interference { seconds, scale } => {
                    for _ in 0..count(seconds) {
                        samples.push(self.next(0.0, 0.0, 0.0, scale));
                    }
                }
            }
        }
        Rendered {
            samples,
            peak_times_ns,
        }
    }
}

impl Synth {
    fn walk(
        &mut self,
        steps: usize,
        mag_scale: f64,
        samples: &mut Vec<SensorSample>,
        peak_times_ns: &mut Vec<u64>,
    ) {
        let start = self.t_ns;
        for k in 0..steps {
            let offset = (k as f64 * STEP_PERIOD_S * 1e9) as u64;
            peak_times_ns.push(start + offset + 100_000_000);
        }
        for _ in 0..count(steps as f64 * STEP_PERIOD_S) {
            let elapsed = (self.t_ns - start) as f64 / 1e9;
            let tau = elapsed % STEP_PERIOD_S;
            let v = self.wave.vertical(tau);
            let s = self.wave.surge(tau);
            samples.push(self.next(v, s, 0.0, mag_scale));
        }
    }
}

fn count(seconds: f64) -> usize {
    (seconds / DT_S).round() as usize
}

/// Configured session already tracking on an identity calibration.
pub fn tracking_session() -> PdrSession<Vec<PdrEvent>> {
    let mut session = PdrSession::new(Vec::new());
    session
        .configure(PdrConfig::default(), UserProfile::default())
        .unwrap();
    let calibration = CalibrationState::Valid(CalibrationSnapshot::identity(i64::MAX));
    session.start(0, Some(calibration)).unwrap();
    session
}

pub fn feed_all(session: &mut PdrSession<Vec<PdrEvent>>, samples: &[SensorSample]) {
    for sample in samples {
        session.feed(sample).unwrap();
    }
}
