// step_detector.rs — Footfall detection on vertical acceleration
//
// Peak/trough state machine over the upward dynamic acceleration, with a
// magnitude-signal fallback when attitude cannot be trusted, physiological
// cadence guards, optional gyro confirmation and a platform-step overlay.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::{GyroConfirmation, StepDetectorConfig};
use crate::error::{PdrError, PdrResult};
use crate::types::{DetectionMethod, NativeStep, StepEvent, StepSource, NANOS_PER_MILLI};

/// Gaps longer than this start a new walking bout (cadence history is cleared).
const BOUT_GAP_NS: u64 = 2_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorPhase {
    Idle,
    RisingEdge,
    PeakCandidate,
    FallingEdge,
    StepEmitted,
    Refractory,
}

#[derive(Clone, Copy, Debug)]
enum State {
    Idle,
    RisingEdge { peak: f64, peak_t: u64 },
    PeakCandidate { peak: f64, peak_t: u64 },
    FallingEdge { peak: f64, peak_t: u64, trough: f64, fall_t: u64 },
    Refractory { emitted_at: u64, until: u64 },
}

/// Peak/trough pair that survived the state machine, before the guards.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepCandidate {
    /// Time of the peak.
    pub t_ns: u64,
    pub peak: f64,
    pub trough: f64,
    pub method: DetectionMethod,
}

/// Per-sample input to the detector.
#[derive(Clone, Copy, Debug)]
pub struct StepInput {
    pub t_ns: u64,
    /// Upward dynamic acceleration; None when the projection failed.
    pub vertical: Option<f64>,
    /// `‖a − b_a‖ − g`
    pub magnitude: f64,
    pub is_stable: bool,
    pub unstable_ms: u64,
    pub gyro_norm: f64,
    pub mag_degraded: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StepCounters {
    pub emitted: u64,
    pub native_matched: u64,
    pub fallback_steps: u64,
    pub rejected_cadence: u64,
    pub rejected_gyro: u64,
    pub late_candidates: u64,
    pub aborted_peaks: u64,
    pub native_duplicates: u64,
    pub native_unmatched: u64,
}

struct Thresholds {
    rise: f64,
    fall: f64,
    trough: f64,
}

pub struct StepDetector {
    config: StepDetectorConfig,
    max_cadence_hz: f64,
    refractory_ns: u64,

    state: State,
    last_sample_ns: u64,
    method: DetectionMethod,
    force_fallback: bool,

    last_step_ns: Option<u64>,
    intervals_ms: VecDeque<f64>,
    gyro_window: VecDeque<(u64, f64)>,
    last_stable: bool,
    last_mag_degraded: bool,

    natives: VecDeque<NativeStep>,
    last_native_total: Option<u64>,
    hold_ns: u64,
    /// Detected step waiting for a late platform report.
    held: Option<StepEvent>,

    pub counters: StepCounters,
}

impl StepDetector {
    pub fn new(config: &StepDetectorConfig, max_cadence_bpm: f64) -> Self {
        let refractory_ms = (config.refractory_ms as f64).max(60_000.0 / max_cadence_bpm);
        Self {
            config: config.clone(),
            max_cadence_hz: max_cadence_bpm / 60.0,
            refractory_ns: (refractory_ms * NANOS_PER_MILLI as f64).round() as u64,
            state: State::Idle,
            last_sample_ns: 0,
            method: DetectionMethod::Vertical,
            force_fallback: false,
            last_step_ns: None,
            intervals_ms: VecDeque::with_capacity(config.cadence_window),
            gyro_window: VecDeque::new(),
            last_stable: false,
            last_mag_degraded: false,
            natives: VecDeque::new(),
            last_native_total: None,
            hold_ns: config.native_hold_ms * NANOS_PER_MILLI,
            held: None,
            counters: StepCounters::default(),
        }
    }

    /// Use the magnitude signal regardless of attitude (calibration bootstrap).
    pub fn set_force_fallback(&mut self, force: bool) {
        self.force_fallback = force;
    }

    pub fn phase(&self) -> DetectorPhase {
        match self.state {
            State::Idle => DetectorPhase::Idle,
            State::RisingEdge { .. } => DetectorPhase::RisingEdge,
            State::PeakCandidate { .. } => DetectorPhase::PeakCandidate,
            State::FallingEdge { .. } => DetectorPhase::FallingEdge,
            State::Refractory { emitted_at, .. } if emitted_at == self.last_sample_ns => {
                DetectorPhase::StepEmitted
            }
            State::Refractory { .. } => DetectorPhase::Refractory,
        }
    }

    pub fn method(&self) -> DetectionMethod {
        self.method
    }

    pub fn step_count(&self) -> u64 {
        self.counters.emitted
    }

    /// Queue a platform step event for overlay.
    ///
    /// Non-increasing `total_steps` is refused with `PlatformStepDuplicate`.
    pub fn push_native(&mut self, native: NativeStep) -> PdrResult<()> {
        if let Some(last_total) = self.last_native_total {
            if native.total_steps <= last_total {
                self.counters.native_duplicates += 1;
                return Err(PdrError::PlatformStepDuplicate {
                    total_steps: native.total_steps,
                    last_total,
                });
            }
        }
        self.last_native_total = Some(native.total_steps);
        self.natives.push_back(native);
        Ok(())
    }

    /// Process one sample; returns a step when one is released on this sample.
    ///
    /// Without platform steps a step is released as soon as it is confirmed.
    /// Once the platform reports steps, a detected step waits up to
    /// `native_hold_ms` past its peak for a matching report.
    pub fn update(&mut self, input: &StepInput) -> Option<StepEvent> {
        self.last_sample_ns = input.t_ns;
        self.last_stable = input.is_stable;
        self.last_mag_degraded = input.mag_degraded;
        self.record_gyro(input.t_ns, input.gyro_norm);
        let mut released = self.release_held(input.t_ns);
        self.expire_natives(input.t_ns);

        let method = if self.force_fallback
            || input.vertical.is_none()
            || input.unstable_ms > self.config.fallback_unstable_ms
        {
            DetectionMethod::MagnitudeFallback
        } else {
            DetectionMethod::Vertical
        };
        if method != self.method {
            log::debug!("step detector switching to {:?}", method);
            self.method = method;
            if !matches!(self.state, State::Refractory { .. }) {
                self.state = State::Idle;
            }
        }

        let signal = match method {
            DetectionMethod::Vertical => input.vertical.unwrap_or(input.magnitude),
            DetectionMethod::MagnitudeFallback => input.magnitude,
        };
        if !signal.is_finite() {
            return released;
        }

        let Some(candidate) = self.advance(input.t_ns, signal) else {
            return released;
        };
        let Some(event) = self.evaluate_candidate(candidate) else {
            return released;
        };
        self.state = State::Refractory {
            emitted_at: input.t_ns,
            until: input.t_ns + self.refractory_ns,
        };

        // One step per sample: an older held step goes out first.
        if released.is_none() {
            released = self.held.take().map(|mut held| {
                self.overlay_native(&mut held);
                held
            });
        }
        if released.is_some() || self.should_hold(&event) {
            self.held = Some(event);
            released
        } else {
            Some(event)
        }
    }

    fn should_hold(&self, event: &StepEvent) -> bool {
        self.hold_ns > 0
            && self.last_native_total.is_some()
            && event.source == StepSource::Detected
    }

    /// Give the held step its platform report if one arrived, and release it
    /// when matched, when the hold ran out, or when holding no longer applies.
    fn release_held(&mut self, now_ns: u64) -> Option<StepEvent> {
        let mut held = self.held.take()?;
        self.overlay_native(&mut held);
        if held.source != StepSource::Detected || now_ns >= held.t_ns + self.hold_ns {
            Some(held)
        } else {
            self.held = Some(held);
            None
        }
    }

    /// Hand over a held step without waiting, e.g. when the session ends.
    pub fn take_held(&mut self) -> Option<StepEvent> {
        let mut held = self.held.take()?;
        self.overlay_native(&mut held);
        Some(held)
    }

    fn overlay_native(&mut self, event: &mut StepEvent) {
        if event.source != StepSource::Detected {
            return;
        }
        if let Some(native) = self.match_native(event.t_ns) {
            event.confidence = 1.0;
            event.source = StepSource::Native {
                total_steps: native.total_steps,
                length_m: native.length_m,
            };
            self.counters.native_matched += 1;
        }
    }

    fn thresholds(&self) -> Thresholds {
        match self.method {
            DetectionMethod::Vertical => Thresholds {
                rise: self.config.rise_threshold,
                fall: self.config.fall_threshold,
                trough: self.config.trough_threshold,
            },
            DetectionMethod::MagnitudeFallback => Thresholds {
                rise: self.config.fallback_rise_threshold,
                fall: self.config.fallback_fall_threshold,
                trough: self.config.fallback_trough_threshold,
            },
        }
    }

    /// Run the state machine on one signal value.
    fn advance(&mut self, t: u64, s: f64) -> Option<StepCandidate> {
        let th = self.thresholds();
        let timeout = self.config.peak_timeout_ms * NANOS_PER_MILLI;

        if let State::Refractory { until, .. } = self.state {
            if t < until {
                return None;
            }
            self.state = State::Idle;
        }

        match self.state {
            State::Idle | State::Refractory { .. } => {
                if s > th.rise {
                    self.state = State::RisingEdge { peak: s, peak_t: t };
                }
            }
            State::RisingEdge { peak, peak_t } => {
                if s >= peak {
                    self.state = State::RisingEdge { peak: s, peak_t: t };
                } else if s < th.fall {
                    self.state = State::FallingEdge {
                        peak,
                        peak_t,
                        trough: s,
                        fall_t: t,
                    };
                } else {
                    self.state = State::PeakCandidate { peak, peak_t };
                }
            }
            State::PeakCandidate { peak, peak_t } => {
                if s > peak {
                    self.state = State::RisingEdge { peak: s, peak_t: t };
                } else if s < th.fall {
                    if t.saturating_sub(peak_t) <= timeout {
                        self.state = State::FallingEdge {
                            peak,
                            peak_t,
                            trough: s,
                            fall_t: t,
                        };
                    } else {
                        self.abort("no fall after peak");
                    }
                } else if t.saturating_sub(peak_t) > timeout {
                    self.abort("no fall after peak");
                }
            }
            State::FallingEdge {
                peak,
                peak_t,
                trough,
                fall_t,
            } => {
                if s < trough {
                    self.state = State::FallingEdge {
                        peak,
                        peak_t,
                        trough: s,
                        fall_t,
                    };
                } else if trough <= th.trough {
                    // Signal turned up after a deep enough minimum.
                    self.state = State::Idle;
                    return Some(StepCandidate {
                        t_ns: peak_t,
                        peak,
                        trough,
                        method: self.method,
                    });
                } else if s > th.rise {
                    self.counters.aborted_peaks += 1;
                    self.state = State::RisingEdge { peak: s, peak_t: t };
                } else if t.saturating_sub(fall_t) > timeout {
                    self.abort("no trough after fall");
                }
            }
        }
        None
    }

    fn abort(&mut self, reason: &str) {
        log::trace!("step candidate aborted: {}", reason);
        self.counters.aborted_peaks += 1;
        self.state = State::Idle;
    }

    /// Apply the physiological guards, gyro confirmation and native overlay to a
    /// candidate. Returns the emitted event, or None if it was rejected.
    pub fn evaluate_candidate(&mut self, candidate: StepCandidate) -> Option<StepEvent> {
        let interval_ns = match self.last_step_ns {
            Some(last) if candidate.t_ns <= last => {
                self.counters.late_candidates += 1;
                log::debug!("candidate at {} precedes last step {}", candidate.t_ns, last);
                return None;
            }
            Some(last) => Some(candidate.t_ns - last),
            None => None,
        };

        if let Some(interval) = interval_ns {
            let too_soon = interval < self.config.min_interval_ms * NANOS_PER_MILLI;
            let too_fast = 1e9 / interval as f64 > self.max_cadence_hz;
            if too_soon || too_fast {
                self.counters.rejected_cadence += 1;
                log::debug!(
                    "step rejected: {:.0} ms after previous",
                    interval as f64 / 1e6
                );
                return None;
            }
        }

        if self.gyro_confirmation_active() && !self.hip_swing() {
            self.counters.rejected_gyro += 1;
            log::debug!("step rejected: no hip swing on gyro");
            return None;
        }

        let inter_step_ms = match interval_ns {
            Some(interval) if interval <= BOUT_GAP_NS => {
                let ms = interval as f64 / 1e6;
                if self.intervals_ms.len() == self.config.cadence_window {
                    self.intervals_ms.pop_front();
                }
                self.intervals_ms.push_back(ms);
                ms.round() as u32
            }
            Some(_) => {
                self.intervals_ms.clear();
                0
            }
            None => 0,
        };
        let cadence_hz = self.cadence_hz();
        let confidence = self.confidence(&candidate);

        self.last_step_ns = Some(candidate.t_ns);
        self.counters.emitted += 1;
        if candidate.method == DetectionMethod::MagnitudeFallback {
            self.counters.fallback_steps += 1;
        }

        let mut event = StepEvent {
            t_ns: candidate.t_ns,
            vertical_peak_magnitude: candidate.peak,
            cadence_hz,
            inter_step_ms,
            confidence,
            source: StepSource::Detected,
            method: candidate.method,
        };
        self.overlay_native(&mut event);
        log::debug!(
            "step #{} at {} cadence {:.2} Hz conf {:.2} ({:?})",
            self.counters.emitted,
            event.t_ns,
            cadence_hz,
            event.confidence,
            candidate.method
        );
        Some(event)
    }

    fn cadence_hz(&self) -> f64 {
        if self.intervals_ms.is_empty() {
            return self.config.initial_cadence_hz;
        }
        let mean = self.intervals_ms.iter().sum::<f64>() / self.intervals_ms.len() as f64;
        1000.0 / mean
    }

    /// Prominence, cadence consistency and attitude stability blended into [0, 1].
    fn confidence(&self, candidate: &StepCandidate) -> f64 {
        let prominence =
            ((candidate.peak - candidate.trough) / self.config.full_prominence).clamp(0.0, 1.0);

        let consistency = if self.intervals_ms.len() >= 2 {
            let n = self.intervals_ms.len() as f64;
            let mean = self.intervals_ms.iter().sum::<f64>() / n;
            let var = self
                .intervals_ms
                .iter()
                .map(|i| (i - mean).powi(2))
                .sum::<f64>()
                / n;
            1.0 - (var.sqrt() / mean).clamp(0.0, 1.0)
        } else {
            0.5
        };

        let stability = match (candidate.method, self.last_stable) {
            (DetectionMethod::Vertical, true) => 1.0,
            (DetectionMethod::Vertical, false) => 0.6,
            (DetectionMethod::MagnitudeFallback, _) => 0.3,
        };

        (0.4 * prominence + 0.3 * consistency + 0.3 * stability).clamp(0.0, 1.0)
    }

    fn gyro_confirmation_active(&self) -> bool {
        match self.config.gyro_confirmation {
            GyroConfirmation::Off => false,
            GyroConfirmation::On => true,
            GyroConfirmation::Auto => self.last_mag_degraded,
        }
    }

    fn record_gyro(&mut self, t_ns: u64, gyro_norm: f64) {
        self.gyro_window.push_back((t_ns, gyro_norm));
        let horizon = self.config.gyro_confirm_window_ms * NANOS_PER_MILLI;
        while let Some(&(t, _)) = self.gyro_window.front() {
            if t_ns.saturating_sub(t) > horizon {
                self.gyro_window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Mean gyro magnitude over the confirmation window exceeds the threshold.
    fn hip_swing(&self) -> bool {
        if self.gyro_window.is_empty() {
            return false;
        }
        let mean = self.gyro_window.iter().map(|(_, g)| g).sum::<f64>()
            / self.gyro_window.len() as f64;
        mean > self.config.gyro_confirm_threshold
    }

    /// Closest queued platform step within the match window; it and everything
    /// older is consumed.
    fn match_native(&mut self, t_ns: u64) -> Option<NativeStep> {
        let window = self.config.native_match_window_ms * NANOS_PER_MILLI;
        let (idx, _) = self
            .natives
            .iter()
            .enumerate()
            .map(|(i, n)| (i, n.t_ns.abs_diff(t_ns)))
            .filter(|(_, d)| *d <= window)
            .min_by_key(|(_, d)| *d)?;
        self.counters.native_unmatched += idx as u64;
        self.natives.drain(..=idx).last()
    }

    fn expire_natives(&mut self, now_ns: u64) {
        let expiry = self.config.native_expiry_ms * NANOS_PER_MILLI;
        while let Some(n) = self.natives.front() {
            if now_ns.saturating_sub(n.t_ns) > expiry {
                self.natives.pop_front();
                self.counters.native_unmatched += 1;
            } else {
                break;
            }
        }
    }

    /// Drop any half-seen step (after a pause the signal history is gone).
    pub fn reset_phase(&mut self) {
        self.state = State::Idle;
        self.gyro_window.clear();
    }
}
