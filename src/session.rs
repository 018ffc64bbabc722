// session.rs — Session orchestrator
//
// Owns every mutable stage of the pipeline for one walk and sequences
// calibration → tracking, pause/resume and stop. All work happens on the
// caller's thread inside `process_pending`; sensor readings can be queued from
// anywhere through `producer()`.
//
//   intake ─▶ calibration.apply ─▶ attitude ─▶ step detector ─▶ stride ─▶ EKF ─▶ trajectory
//                                     └──────── heading ────────────────────▶ EKF

use serde::Serialize;
use std::io::Write;
use std::sync::Arc;

use crate::calibration::{
    CalibrationProgress, CalibrationState, CalibrationStep, PocketCalibrator,
};
use crate::config::PdrConfig;
use crate::error::{PdrError, PdrResult};
use crate::events::{PdrListener, PdrWarning, WarningKind};
use crate::filters::attitude::AttitudeTracker;
use crate::filters::pose_ekf::{HeadingOutcome, PoseEkf};
use crate::live_status::{current_timestamp, LiveStatus};
use crate::sensors::{IntakeProducer, SensorIntake};
use crate::step_detector::{StepDetector, StepInput};
use crate::storage::{SessionLogRecord, SessionLogWriter};
use crate::stride::StrideModel;
use crate::trajectory::TrajectoryFilter;
use crate::types::{
    secs_between, AttitudeState, Channel, ChannelReading, NativeStep, Pose, SensorSample,
    StepEvent, TrackingMode, TrajectoryPoint, UserProfile, GRAVITY, NANOS_PER_SEC,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninit,
    Idle,
    Calibrating,
    Tracking,
    Paused,
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Uninit => "uninit",
            SessionState::Idle => "idle",
            SessionState::Calibrating => "calibrating",
            SessionState::Tracking => "tracking",
            SessionState::Paused => "paused",
            SessionState::Stopped => "stopped",
        }
    }

    fn accepts_samples(self) -> bool {
        matches!(self, SessionState::Calibrating | SessionState::Tracking)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub samples_processed: u64,
    pub calibration_steps: u64,
    pub native_duplicates: u64,
    pub numerical_resets: u64,
    pub warnings: u64,
    pub mode_changes: u64,
}

type LogSink = SessionLogWriter<Box<dyn Write + Send>>;

/// The pipeline stages, rebuilt by `configure`.
struct Pipeline {
    intake: SensorIntake,
    calibrator: PocketCalibrator,
    attitude: AttitudeTracker,
    detector: StepDetector,
    stride: StrideModel,
    ekf: PoseEkf,
    trajectory: TrajectoryFilter,
}

impl Pipeline {
    fn new(config: &PdrConfig, profile: &UserProfile) -> Self {
        Self {
            intake: SensorIntake::new(config),
            calibrator: PocketCalibrator::new(&config.calibration),
            attitude: AttitudeTracker::new(&config.attitude, config.sample_rate_hz),
            detector: StepDetector::new(&config.step_detector, config.max_cadence_bpm),
            stride: StrideModel::new(&config.stride, profile),
            ekf: PoseEkf::new(&config.ekf),
            trajectory: TrajectoryFilter::new(config),
        }
    }
}

pub struct PdrSession<L: PdrListener> {
    config: PdrConfig,
    profile: UserProfile,
    state: SessionState,
    resume_to: SessionState,
    pipeline: Pipeline,
    calibration: Arc<CalibrationState>,
    listener: L,
    log: Option<LogSink>,

    mode: TrackingMode,
    heading_seeded: bool,
    origin_ns: Option<u64>,
    last_sample_ns: Option<u64>,
    last_step_ns: Option<u64>,
    mag_weak_since: Option<u64>,
    distance_m: f64,
    pub counters: SessionCounters,
}

impl<L: PdrListener> PdrSession<L> {
    pub fn new(listener: L) -> Self {
        let config = PdrConfig::default();
        let profile = UserProfile::default();
        Self {
            pipeline: Pipeline::new(&config, &profile),
            config,
            profile,
            state: SessionState::Uninit,
            resume_to: SessionState::Tracking,
            calibration: Arc::new(CalibrationState::degraded_identity(0)),
            listener,
            log: None,
            mode: TrackingMode::Stationary,
            heading_seeded: false,
            origin_ns: None,
            last_sample_ns: None,
            last_step_ns: None,
            mag_weak_since: None,
            distance_m: 0.0,
            counters: SessionCounters::default(),
        }
    }

    /// Validate configuration and profile and build a fresh pipeline.
    ///
    /// Refused once a session is running; a stopped session can be reconfigured.
    pub fn configure(&mut self, config: PdrConfig, profile: UserProfile) -> PdrResult<()> {
        if !matches!(
            self.state,
            SessionState::Uninit | SessionState::Idle | SessionState::Stopped
        ) {
            return Err(PdrError::InvalidState(format!(
                "configure while {}",
                self.state.as_str()
            )));
        }
        config.validate()?;
        profile.validate()?;

        self.pipeline = Pipeline::new(&config, &profile);
        self.config = config;
        self.profile = profile;
        self.state = SessionState::Idle;
        self.mode = TrackingMode::Stationary;
        self.heading_seeded = false;
        self.origin_ns = None;
        self.last_sample_ns = None;
        self.last_step_ns = None;
        self.mag_weak_since = None;
        self.distance_m = 0.0;
        self.counters = SessionCounters::default();
        log::info!(
            "session configured: {} Hz, height {:.2} m",
            self.config.sample_rate_hz,
            self.profile.height_m
        );
        Ok(())
    }

    /// Write one NDJSON record per processed sample to `writer`.
    pub fn set_session_log(&mut self, writer: Box<dyn Write + Send>) {
        self.log = Some(SessionLogWriter::new(writer));
    }

    /// Begin a session at `now_ns`. A valid, unexpired calibration goes straight to
    /// tracking; anything else runs the pocket calibration first.
    pub fn start(&mut self, now_ns: u64, calibration: Option<CalibrationState>) -> PdrResult<()> {
        if self.state != SessionState::Idle {
            return Err(PdrError::InvalidState(format!(
                "start while {}",
                self.state.as_str()
            )));
        }
        match calibration {
            Some(cal) if cal.is_valid_at(now_ns) => {
                self.pipeline.intake.anchor(now_ns);
                self.publish_calibration(cal);
                self.enter_tracking();
            }
            _ => {
                self.pipeline.intake.anchor(now_ns);
                self.pipeline.calibrator.start(now_ns);
                self.pipeline.detector.set_force_fallback(true);
                self.state = SessionState::Calibrating;
                log::info!("session calibrating");
            }
        }
        Ok(())
    }

    /// Queue one raw reading. Dropped unless calibrating or tracking.
    pub fn push(&mut self, reading: ChannelReading) -> bool {
        self.state.accepts_samples() && self.pipeline.intake.push(reading)
    }

    pub fn push_sample(&mut self, sample: &SensorSample) -> bool {
        if !self.state.accepts_samples() {
            return false;
        }
        self.pipeline.intake.push_sample(sample);
        true
    }

    /// Platform step report. Duplicates are absorbed.
    pub fn push_native(&mut self, native: NativeStep) {
        if self.state != SessionState::Tracking {
            return;
        }
        if let Err(e) = self.pipeline.detector.push_native(native) {
            self.counters.native_duplicates += 1;
            log::debug!("{}", e);
        }
    }

    /// Handle for feeding readings from other threads.
    pub fn producer(&self) -> IntakeProducer {
        self.pipeline.intake.producer()
    }

    /// Run every sample the intake can resolve. Returns how many were processed.
    ///
    /// A silent sensor halts the session with `SensorUnavailable`.
    pub fn process_pending(&mut self) -> PdrResult<usize> {
        let mut processed = 0;
        while self.state.accepts_samples() {
            let sample = match self.pipeline.intake.tick() {
                Ok(Some(sample)) => sample,
                Ok(None) => break,
                Err(PdrError::StaleSensor { channel, silent_ms }) => {
                    return Err(self.halt(channel, silent_ms));
                }
                Err(e) => return Err(e),
            };
            self.process_sample(sample)?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Halt when any channel has been quiet past the stale limit at `now_ns`.
    ///
    /// Sample-driven checks only see one channel lagging another; this catches
    /// every sensor going quiet at once. `now_ns` is on the readings' clock.
    pub fn check_sensors(&mut self, now_ns: u64) -> PdrResult<()> {
        if !self.state.accepts_samples() {
            return Ok(());
        }
        match self.pipeline.intake.check_silence(now_ns) {
            Err(PdrError::StaleSensor { channel, silent_ms }) => {
                Err(self.halt(channel, silent_ms))
            }
            other => other,
        }
    }

    /// Queue a whole sample and process it.
    pub fn feed(&mut self, sample: &SensorSample) -> PdrResult<usize> {
        self.push_sample(sample);
        self.process_pending()
    }

    fn process_sample(&mut self, raw: SensorSample) -> PdrResult<()> {
        let origin = *self.origin_ns.get_or_insert(raw.t_ns);
        self.last_sample_ns = Some(raw.t_ns);
        self.counters.samples_processed += 1;

        let (step, pose) = match self.state {
            SessionState::Calibrating => (self.calibrate(&raw), None),
            _ => self.track(&raw),
        };

        if let Some(log) = self.log.as_mut() {
            let quaternion = (self.state == SessionState::Tracking
                && self.pipeline.attitude.is_initialized())
            .then(|| {
                let q = self.pipeline.attitude.q_bw();
                [q.w, q.i, q.j, q.k]
            });
            log.write(&SessionLogRecord {
                relative_time: secs_between(origin, raw.t_ns),
                t_ns: raw.t_ns,
                accel: raw.accel.into(),
                gyro: raw.gyro.into(),
                mag: raw.mag.into(),
                valid: raw.valid,
                quaternion,
                step_phase: Some(self.pipeline.detector.phase()),
                step,
                pose,
            })?;
        }
        Ok(())
    }

    // ── Calibration ──

    fn calibrate(&mut self, raw: &SensorSample) -> Option<StepEvent> {
        if let Some(progress) = self.pipeline.calibrator.push(raw) {
            self.listener.on_calibration_progress(&progress);
        }

        let magnitude = if raw.valid.has(Channel::Accel) {
            raw.accel.norm() - GRAVITY
        } else {
            0.0
        };
        let step = self.pipeline.detector.update(&StepInput {
            t_ns: raw.t_ns,
            vertical: None,
            magnitude,
            is_stable: false,
            unstable_ms: 0,
            gyro_norm: raw.gyro.norm(),
            mag_degraded: false,
        });
        if let Some(step) = &step {
            self.pipeline.calibrator.record_step(step.t_ns);
            self.counters.calibration_steps += 1;
        }

        match self.pipeline.calibrator.poll(raw.t_ns) {
            Some(Ok(snapshot)) => {
                self.publish_calibration(CalibrationState::Valid(snapshot));
                self.listener.on_calibration_progress(&CalibrationProgress {
                    step: CalibrationStep::Complete,
                    progress: 1.0,
                    message: "calibration complete".to_string(),
                    is_complete: true,
                });
                self.enter_tracking();
            }
            Some(Err(e)) => {
                self.publish_calibration(CalibrationState::degraded_identity(raw.t_ns));
                self.listener.on_calibration_progress(&CalibrationProgress {
                    step: CalibrationStep::Failed,
                    progress: 1.0,
                    message: e.to_string(),
                    is_complete: true,
                });
                self.warn(WarningKind::CalibrationDegraded, raw.t_ns, e.to_string());
                self.enter_tracking();
            }
            None => {}
        }
        step
    }

    fn publish_calibration(&mut self, state: CalibrationState) {
        self.calibration = Arc::new(state);
    }

    /// Switch to tracking with a fresh detector; bootstrap steps do not count.
    fn enter_tracking(&mut self) {
        self.pipeline.detector =
            StepDetector::new(&self.config.step_detector, self.config.max_cadence_bpm);
        self.state = SessionState::Tracking;
        log::info!(
            "session tracking ({} calibration)",
            if self.calibration.is_degraded() {
                "degraded"
            } else {
                "valid"
            }
        );
        self.listener.on_mode_change(self.mode);
    }

    // ── Tracking ──

    fn track(&mut self, raw: &SensorSample) -> (Option<StepEvent>, Option<Pose>) {
        let t = raw.t_ns;
        let body = self.calibration.snapshot().apply(raw);
        let att = self.pipeline.attitude.update(&body);
        if !self.pipeline.attitude.is_initialized() {
            return (None, None);
        }
        if !self.heading_seeded {
            self.pipeline.ekf.set_heading(att.heading);
            self.heading_seeded = true;
            // the walk starts at the origin
            let start = self.pipeline.ekf.pose(t);
            self.pipeline.trajectory.push(&start);
        }

        let ekf = &mut self.pipeline.ekf;
        ekf.advance(t);
        ekf.set_drop_rate(self.pipeline.intake.drop_rate());

        let mut pose = None;
        if body.valid.has(Channel::Mag) {
            let steady = att.is_stable || self.pipeline.attitude.heading_steady();
            match self
                .pipeline
                .ekf
                .update_heading(att.heading, att.mag_confidence, steady, t)
            {
                Ok(HeadingOutcome::Applied) => pose = Some(self.emit_pose(t)),
                Ok(HeadingOutcome::Reacquired) => {
                    self.warn(
                        WarningKind::HeadingReacquired,
                        t,
                        format!("heading re-seeded to {:.1}°", att.heading.to_degrees()),
                    );
                    pose = Some(self.emit_pose(t));
                }
                Ok(HeadingOutcome::Gated) | Ok(HeadingOutcome::Rejected) => {}
                Err(e) => self.numerical_reset(t, e),
            }
        }

        let step = self.detect_step(&body, &att);
        if let Some(event) = step {
            pose = Some(self.apply_step(event));
        }

        self.update_mode(t, &att);
        (step, pose)
    }

    fn detect_step(&mut self, body: &SensorSample, att: &AttitudeState) -> Option<StepEvent> {
        let attitude = &self.pipeline.attitude;
        let accel_ok = body.valid.has(Channel::Accel);
        let input = StepInput {
            t_ns: body.t_ns,
            vertical: if accel_ok {
                attitude.vertical_accel(&body.accel)
            } else {
                None
            },
            magnitude: if accel_ok {
                body.accel.norm() - GRAVITY
            } else {
                0.0
            },
            is_stable: att.is_stable,
            unstable_ms: attitude.unstable_ms(body.t_ns),
            gyro_norm: if body.valid.has(Channel::Gyro) {
                body.gyro.norm()
            } else {
                0.0
            },
            // debounced, so gyro confirmation does not flicker near the threshold
            mag_degraded: self.mode == TrackingMode::Degraded,
        };
        self.pipeline.detector.update(&input)
    }

    fn apply_step(&mut self, event: StepEvent) -> Pose {
        let t = self.last_sample_ns.unwrap_or(event.t_ns);
        self.listener.on_step(&event);

        let heading = self.pipeline.attitude.heading_at(event.t_ns);
        let stride = self.pipeline.stride.sample(event, heading);
        log::debug!(
            "step at {} ns: {:.2} m along {:.1}° (conf {:.2})",
            event.t_ns,
            stride.delta_s,
            heading.to_degrees(),
            event.confidence
        );

        let ekf = &mut self.pipeline.ekf;
        let result = ekf
            .predict(&stride)
            .and_then(|_| ekf.update_displacement(&stride));
        if let Err(e) = result {
            self.numerical_reset(t, e);
        }
        self.distance_m += stride.delta_s;
        self.last_step_ns = Some(event.t_ns);

        let pose = self.emit_pose(t);
        self.pipeline.trajectory.push(&pose);
        pose
    }

    fn emit_pose(&mut self, t_ns: u64) -> Pose {
        let pose = self.pipeline.ekf.pose(t_ns);
        self.listener.on_pose(&pose);
        pose
    }

    fn update_mode(&mut self, t_ns: u64, att: &AttitudeState) {
        if att.mag_confidence < self.config.ekf.heading_min_mag_confidence {
            self.mag_weak_since.get_or_insert(t_ns);
        } else {
            self.mag_weak_since = None;
        }
        let degraded = self
            .mag_weak_since
            .is_some_and(|since| secs_between(since, t_ns) > self.config.degraded_mag_s);
        let walking = self
            .last_step_ns
            .is_some_and(|last| secs_between(last, t_ns) < self.config.walking_timeout_s);

        let mode = if degraded {
            TrackingMode::Degraded
        } else if walking {
            TrackingMode::Walking
        } else {
            TrackingMode::Stationary
        };
        if mode != self.mode {
            log::info!("mode {:?} → {:?}", self.mode, mode);
            self.mode = mode;
            self.counters.mode_changes += 1;
            self.listener.on_mode_change(mode);
        }
    }

    fn numerical_reset(&mut self, t_ns: u64, error: PdrError) {
        self.counters.numerical_resets += 1;
        log::warn!("{}", error);
        self.warn(WarningKind::NumericalReset, t_ns, error.to_string());
    }

    fn warn(&mut self, kind: WarningKind, t_ns: u64, message: String) {
        self.counters.warnings += 1;
        self.listener.on_warning(&PdrWarning {
            kind,
            t_ns,
            message,
        });
    }

    /// Stale sensor: tell the listener, stop, and hand back the structural error.
    fn halt(&mut self, channel: Channel, silent_ms: u64) -> PdrError {
        let message = format!("{} silent for {} ms", channel, silent_ms);
        log::warn!("halting session: {}", message);
        let t = self.last_sample_ns.unwrap_or(0);
        self.warn(WarningKind::SensorUnavailable, t, message.clone());
        if let Err(e) = self.stop() {
            log::warn!("stop after sensor loss failed: {}", e);
        }
        PdrError::SensorUnavailable(message)
    }

    // ── Lifecycle ──

    /// Freeze the pipeline. Samples pushed while paused are dropped.
    pub fn pause(&mut self) -> PdrResult<()> {
        match self.state {
            SessionState::Calibrating | SessionState::Tracking => {
                self.resume_to = self.state;
                self.state = SessionState::Paused;
                log::info!("session paused");
                Ok(())
            }
            SessionState::Paused => Ok(()),
            other => Err(PdrError::InvalidState(format!(
                "pause while {}",
                other.as_str()
            ))),
        }
    }

    /// Resume routing from `now_ns`; nothing queued before the pause is replayed.
    pub fn resume(&mut self, now_ns: u64) -> PdrResult<()> {
        if self.state != SessionState::Paused {
            return Err(PdrError::InvalidState(format!(
                "resume while {}",
                self.state.as_str()
            )));
        }
        let p = &mut self.pipeline;
        p.intake.clear();
        p.intake.anchor(now_ns);
        p.attitude.reseed_time(now_ns);
        p.ekf.reseed_time(now_ns);
        p.detector.reset_phase();
        self.mag_weak_since = None;
        if self.resume_to == SessionState::Calibrating {
            p.calibrator.start(now_ns);
        }
        self.state = self.resume_to;
        log::info!("session resumed ({})", self.state.as_str());
        Ok(())
    }

    /// End the session, hand the final trajectory to the listener and release buffers.
    /// Calling it again is a no-op returning an empty trajectory.
    pub fn stop(&mut self) -> PdrResult<Vec<TrajectoryPoint>> {
        if self.state == SessionState::Stopped {
            return Ok(Vec::new());
        }
        let tracking = self.state == SessionState::Tracking
            || (self.state == SessionState::Paused && self.resume_to == SessionState::Tracking);
        if tracking {
            if let Some(step) = self.pipeline.detector.take_held() {
                self.apply_step(step);
            }
        }
        let p = &mut self.pipeline;
        p.intake.clear();
        p.calibrator.cancel();
        let trajectory = p.trajectory.take();
        self.state = SessionState::Stopped;
        self.listener.on_session_end(&trajectory);
        log::info!(
            "session stopped: {} steps, {:.2} m, {} trajectory points",
            self.step_count(),
            self.distance_m,
            trajectory.len()
        );
        if let Some(mut log) = self.log.take() {
            log.flush()?;
        }
        Ok(trajectory)
    }

    // ── Accessors ──

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    pub fn config(&self) -> &PdrConfig {
        &self.config
    }

    /// Current EKF pose, confidence evaluated at the latest sample.
    pub fn pose(&self) -> Pose {
        self.pipeline.ekf.pose(self.last_sample_ns.unwrap_or(0))
    }

    pub fn step_count(&self) -> u64 {
        if self.state == SessionState::Calibrating {
            0
        } else {
            self.pipeline.detector.step_count()
        }
    }

    pub fn distance(&self) -> f64 {
        self.distance_m
    }

    /// Snapshot readers can hold on to; replaced wholesale, never mutated.
    pub fn calibration(&self) -> Arc<CalibrationState> {
        Arc::clone(&self.calibration)
    }

    pub fn attitude(&self) -> &AttitudeTracker {
        &self.pipeline.attitude
    }

    pub fn ekf(&self) -> &PoseEkf {
        &self.pipeline.ekf
    }

    pub fn detector(&self) -> &StepDetector {
        &self.pipeline.detector
    }

    pub fn trajectory(&self) -> &TrajectoryFilter {
        &self.pipeline.trajectory
    }

    pub fn intake(&self) -> &SensorIntake {
        &self.pipeline.intake
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn into_listener(self) -> L {
        self.listener
    }

    pub fn live_status(&self) -> LiveStatus {
        let pose = self.pose();
        let health = self.pipeline.intake.health_report();
        let stats = self.pipeline.intake.stats();
        let att = self.pipeline.attitude.state();
        let ekf = &self.pipeline.ekf.counters;
        let detector = &self.pipeline.detector.counters;
        let trajectory = &self.pipeline.trajectory.counters;
        let session_seconds = match (self.origin_ns, self.last_sample_ns) {
            (Some(origin), Some(last)) => last.saturating_sub(origin) as f64 / NANOS_PER_SEC,
            _ => 0.0,
        };

        LiveStatus {
            timestamp: current_timestamp(),
            session_state: self.state.as_str().to_string(),
            mode: self.mode,
            session_seconds,
            x: pose.x,
            y: pose.y,
            heading_deg: pose.theta.to_degrees(),
            confidence: pose.confidence,
            step_count: self.step_count(),
            distance_m: self.distance_m,
            trajectory_points: self.pipeline.trajectory.len(),
            calibration: match self.calibration.as_ref() {
                CalibrationState::Valid(_) => "valid".to_string(),
                CalibrationState::Degraded(_) => "degraded".to_string(),
            },
            calibration_degraded: self.calibration.is_degraded(),
            attitude_stable: att.is_stable,
            mag_confidence: att.mag_confidence,
            samples_processed: self.counters.samples_processed,
            late_samples: stats.late_samples,
            overflow_dropped: stats.overflow_dropped,
            drop_rate: self.pipeline.intake.drop_rate(),
            accel_healthy: health.accel.healthy,
            gyro_healthy: health.gyro.healthy,
            mag_healthy: health.mag.healthy,
            accel_silence_ms: health.accel.silence_ms,
            gyro_silence_ms: health.gyro.silence_ms,
            mag_silence_ms: health.mag.silence_ms,
            rejected_cadence: detector.rejected_cadence,
            heading_gated: ekf.heading_gated,
            heading_rejected: ekf.heading_rejected,
            heading_reacquired: ekf.heading_reacquired,
            numerical_resets: ekf.numerical_resets,
            outlier_corrected: trajectory.outlier_corrected,
            outlier_rejected: trajectory.outlier_rejected,
            native_duplicates: self.counters.native_duplicates,
        }
    }
}
