// pose_ekf.rs — Planar pose EKF (px, py, θ)
//
// Predict on every stride with the world-frame step displacement, then
// tighten position with a displacement observation weighted by step
// confidence. Heading comes from the attitude tracker as a separate scalar
// observation, gated on magnetometer confidence and innovation size.

use nalgebra::{SMatrix, SVector};
use serde::Serialize;

use crate::angle;
use crate::config::EkfConfig;
use crate::error::{PdrError, PdrResult};
use crate::types::{
    secs_between, HeadingNoise, HeadingObs, JacobianHeading, JacobianPosition, Pose, PoseCov,
    PoseVec, PositionNoise, PositionObs, StrideSample, POSE_DIM,
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EkfCounters {
    pub predicts: u64,
    pub displacement_updates: u64,
    pub heading_updates: u64,
    /// Observations skipped for low mag confidence or unsteady heading.
    pub heading_gated: u64,
    /// Observations refused by the innovation gate.
    pub heading_rejected: u64,
    pub heading_reacquired: u64,
    pub numerical_resets: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadingOutcome {
    Applied,
    Gated,
    Rejected,
    /// Gate rejected long enough that θ was re-seeded from the observation.
    Reacquired,
}

#[derive(Clone, Debug, Serialize)]
pub struct PoseEkfState {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub p_xy_trace: f64,
    pub p_theta: f64,
    pub counters: EkfCounters,
}

pub struct PoseEkf {
    config: EkfConfig,
    x: PoseVec,
    p: PoseCov,
    p_initial: PoseCov,
    last_good: PoseVec,

    last_advance_ns: Option<u64>,
    last_predict_ns: Option<u64>,
    last_update_ns: Option<u64>,
    /// Position before the latest predict, the base of the displacement observation.
    pre_predict: PositionObs,

    heading_reject_run: u32,
    drop_rate: f64,

    pub counters: EkfCounters,
}

impl PoseEkf {
    pub fn new(config: &EkfConfig) -> Self {
        let theta_var = config.initial_heading_std_deg.to_radians().powi(2);
        let p_initial = PoseCov::from_diagonal(&PoseVec::new(
            config.initial_position_var,
            config.initial_position_var,
            theta_var,
        ));
        Self {
            config: config.clone(),
            x: PoseVec::zeros(),
            p: p_initial,
            p_initial,
            last_good: PoseVec::zeros(),
            last_advance_ns: None,
            last_predict_ns: None,
            last_update_ns: None,
            pre_predict: PositionObs::zeros(),
            heading_reject_run: 0,
            drop_rate: 0.0,
            counters: EkfCounters::default(),
        }
    }

    /// Seed θ (e.g. from the first attitude heading) without touching position.
    pub fn set_heading(&mut self, theta: f64) {
        self.x[2] = angle::wrap(theta);
        self.last_good = self.x;
    }

    /// Let heading uncertainty grow with elapsed sample time.
    pub fn advance(&mut self, t_ns: u64) {
        if let Some(last) = self.last_advance_ns {
            let dt = secs_between(last, t_ns).max(0.0);
            self.p[(2, 2)] += self.config.q_theta.powi(2) * dt;
        }
        self.last_advance_ns = Some(t_ns);
    }

    /// x⁻ = x + (Δx, Δy, 0); P⁻ = P + Q·Δt.
    pub fn predict(&mut self, stride: &StrideSample) -> PdrResult<()> {
        let t_ns = stride.step.t_ns;
        let dt = self
            .last_predict_ns
            .map_or(1.0, |last| secs_between(last, t_ns))
            .clamp(0.0, self.config.max_predict_gap_s);
        let (dx, dy) = stride.displacement();

        self.pre_predict = PositionObs::new(self.x[0], self.x[1]);
        self.x[0] += dx;
        self.x[1] += dy;
        self.p[(0, 0)] += self.config.q_xy * dt;
        self.p[(1, 1)] += self.config.q_xy * dt;

        self.last_predict_ns = Some(t_ns);
        self.counters.predicts += 1;
        self.check_finite()
    }

    /// Observe the step displacement itself, with noise σ_s / max(0.1, confidence).
    pub fn update_displacement(&mut self, stride: &StrideSample) -> PdrResult<()> {
        let (dx, dy) = stride.displacement();
        let z = self.pre_predict + PositionObs::new(dx, dy);

        let mut h = JacobianPosition::zeros();
        h[(0, 0)] = 1.0;
        h[(1, 1)] = 1.0;
        let residual = z - h * self.x;

        let sigma = self.config.sigma_step_m / stride.step.confidence.max(0.1);
        let r = PositionNoise::identity() * sigma.powi(2);

        self.joseph_update(&h, &residual, &r)?;
        self.last_update_ns = Some(stride.step.t_ns);
        self.counters.displacement_updates += 1;
        self.check_finite()
    }

    /// Observe θ from the attitude tracker.
    pub fn update_heading(
        &mut self,
        theta_obs: f64,
        mag_confidence: f64,
        steady: bool,
        t_ns: u64,
    ) -> PdrResult<HeadingOutcome> {
        if mag_confidence < self.config.heading_min_mag_confidence || !steady {
            self.counters.heading_gated += 1;
            return Ok(HeadingOutcome::Gated);
        }

        let innovation = angle::diff(theta_obs, self.x[2]);
        if innovation.abs() > self.config.heading_gate_deg.to_radians() {
            self.heading_reject_run += 1;
            self.counters.heading_rejected += 1;
            if self.heading_reject_run < self.config.heading_reacquire_count {
                return Ok(HeadingOutcome::Rejected);
            }
            self.reacquire_heading(theta_obs);
            self.last_update_ns = Some(t_ns);
            return Ok(HeadingOutcome::Reacquired);
        }
        self.heading_reject_run = 0;

        let mut h = JacobianHeading::zeros();
        h[(0, 2)] = 1.0;
        let residual = HeadingObs::new(innovation);
        let sigma = self.config.sigma_heading_deg.to_radians() / mag_confidence.max(0.1);
        let r = HeadingNoise::new(sigma.powi(2));

        self.joseph_update(&h, &residual, &r)?;
        self.x[2] = angle::wrap(self.x[2]);
        self.last_update_ns = Some(t_ns);
        self.counters.heading_updates += 1;
        self.check_finite()?;
        Ok(HeadingOutcome::Applied)
    }

    fn reacquire_heading(&mut self, theta_obs: f64) {
        log::warn!(
            "heading gate rejected {} observations, re-seeding θ {:.1}° → {:.1}°",
            self.heading_reject_run,
            self.x[2].to_degrees(),
            theta_obs.to_degrees()
        );
        self.x[2] = angle::wrap(theta_obs);
        for i in 0..POSE_DIM {
            self.p[(2, i)] = 0.0;
            self.p[(i, 2)] = 0.0;
        }
        self.p[(2, 2)] = self.p_initial[(2, 2)];
        self.heading_reject_run = 0;
        self.counters.heading_reacquired += 1;
    }

    /// Joseph-form measurement update; keeps P symmetric positive semi-definite.
    fn joseph_update<const M: usize>(
        &mut self,
        h: &SMatrix<f64, M, POSE_DIM>,
        residual: &SVector<f64, M>,
        r: &SMatrix<f64, M, M>,
    ) -> PdrResult<()> {
        let h_transpose = h.transpose();
        let s = h * self.p * h_transpose + r;
        let s_inv = s.try_inverse().ok_or_else(|| {
            PdrError::NumericalInstability("innovation covariance is singular".to_string())
        })?;
        let k = self.p * h_transpose * s_inv;
        self.x += k * residual;

        let i_kh = PoseCov::identity() - k * h;
        let new_p = i_kh * self.p * i_kh.transpose() + k * r * k.transpose();
        self.p = (new_p + new_p.transpose()) * 0.5;
        Ok(())
    }

    /// Soft reset: non-finite state or covariance restores the last good state and
    /// the initial covariance.
    fn check_finite(&mut self) -> PdrResult<()> {
        let finite = self.x.iter().all(|v| v.is_finite()) && self.p.iter().all(|v| v.is_finite());
        if finite {
            self.last_good = self.x;
            return Ok(());
        }
        self.x = self.last_good;
        self.p = self.p_initial;
        self.heading_reject_run = 0;
        self.counters.numerical_resets += 1;
        Err(PdrError::NumericalInstability(
            "non-finite pose covariance, reset to initial".to_string(),
        ))
    }

    pub fn set_drop_rate(&mut self, drop_rate: f64) {
        self.drop_rate = drop_rate.clamp(0.0, 1.0);
    }

    /// 1 / (1 + tr P_xy), decayed by time since the last update and by sensor drop rate.
    pub fn confidence(&self, now_ns: u64) -> f64 {
        let trace_xy = self.p[(0, 0)] + self.p[(1, 1)];
        let base = 1.0 / (1.0 + trace_xy.max(0.0));
        let since = self
            .last_update_ns
            .or(self.last_advance_ns)
            .map_or(0.0, |t| secs_between(t, now_ns).max(0.0));
        let decay = (1.0 - self.config.confidence_decay_per_s * since).max(0.0);
        let c = base * decay * (1.0 - self.drop_rate);
        if c.is_finite() {
            c.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn pose(&self, t_ns: u64) -> Pose {
        Pose {
            x: self.x[0],
            y: self.x[1],
            theta: angle::wrap(self.x[2]),
            confidence: self.confidence(t_ns),
            t_ns,
        }
    }

    /// Restart the time bookkeeping at `t_ns`; paused time is neither decay nor process noise.
    pub fn reseed_time(&mut self, t_ns: u64) {
        self.last_advance_ns = Some(t_ns);
        if self.last_predict_ns.is_some() {
            self.last_predict_ns = Some(t_ns);
        }
        if self.last_update_ns.is_some() {
            self.last_update_ns = Some(t_ns);
        }
    }

    pub fn covariance(&self) -> &PoseCov {
        &self.p
    }

    pub fn p_theta(&self) -> f64 {
        self.p[(2, 2)]
    }

    pub fn state(&self) -> PoseEkfState {
        PoseEkfState {
            x: self.x[0],
            y: self.x[1],
            theta: angle::wrap(self.x[2]),
            p_xy_trace: self.p[(0, 0)] + self.p[(1, 1)],
            p_theta: self.p[(2, 2)],
            counters: self.counters.clone(),
        }
    }
}
