//! Session outputs.
//!
//! Consumers implement `PdrListener` (typed callbacks) or hand the session a
//! channel / vector that collects `PdrEvent`s. Callbacks run synchronously on
//! the session's thread and must not block.

use crossbeam::channel::Sender;
use serde::Serialize;

use crate::calibration::CalibrationProgress;
use crate::types::{Pose, StepEvent, TrackingMode, TrajectoryPoint};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// EKF covariance went non-finite and was reset.
    NumericalReset,
    /// Calibration failed; tracking runs on identity calibration.
    CalibrationDegraded,
    /// Heading gate rejected a burst of observations and θ was re-seeded.
    HeadingReacquired,
    /// A sensor went silent; the session halts.
    SensorUnavailable,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PdrWarning {
    pub kind: WarningKind,
    pub t_ns: u64,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PdrEvent {
    Pose { pose: Pose },
    Step { step: StepEvent },
    ModeChange { mode: TrackingMode },
    CalibrationProgress { progress: CalibrationProgress },
    Warning { warning: PdrWarning },
    SessionEnd { trajectory: Vec<TrajectoryPoint> },
}

/// Push-style session callbacks.
///
/// Every typed method defaults to wrapping its argument in a `PdrEvent` and
/// handing it to `on_event`, which itself does nothing. Implement either.
pub trait PdrListener {
    fn on_event(&mut self, _event: PdrEvent) {}

    fn on_pose(&mut self, pose: &Pose) {
        self.on_event(PdrEvent::Pose { pose: *pose });
    }

    fn on_step(&mut self, step: &StepEvent) {
        self.on_event(PdrEvent::Step { step: *step });
    }

    fn on_mode_change(&mut self, mode: TrackingMode) {
        self.on_event(PdrEvent::ModeChange { mode });
    }

    fn on_calibration_progress(&mut self, progress: &CalibrationProgress) {
        self.on_event(PdrEvent::CalibrationProgress {
            progress: progress.clone(),
        });
    }

    fn on_warning(&mut self, warning: &PdrWarning) {
        self.on_event(PdrEvent::Warning {
            warning: warning.clone(),
        });
    }

    fn on_session_end(&mut self, trajectory: &[TrajectoryPoint]) {
        self.on_event(PdrEvent::SessionEnd {
            trajectory: trajectory.to_vec(),
        });
    }
}

/// Discards everything.
impl PdrListener for () {}

/// Collects every event in order.
impl PdrListener for Vec<PdrEvent> {
    fn on_event(&mut self, event: PdrEvent) {
        self.push(event);
    }
}

/// Forwards events to another thread; a dropped receiver is ignored.
impl PdrListener for Sender<PdrEvent> {
    fn on_event(&mut self, event: PdrEvent) {
        if self.send(event).is_err() {
            log::trace!("event receiver dropped");
        }
    }
}

/// Filters over a collected event list, mostly for inspection and tests.
pub trait EventLog {
    fn poses(&self) -> Vec<Pose>;
    fn steps(&self) -> Vec<StepEvent>;
    fn modes(&self) -> Vec<TrackingMode>;
    fn warnings(&self) -> Vec<PdrWarning>;
}

impl EventLog for [PdrEvent] {
    fn poses(&self) -> Vec<Pose> {
        self.iter()
            .filter_map(|e| match e {
                PdrEvent::Pose { pose } => Some(*pose),
                _ => None,
            })
            .collect()
    }

    fn steps(&self) -> Vec<StepEvent> {
        self.iter()
            .filter_map(|e| match e {
                PdrEvent::Step { step } => Some(*step),
                _ => None,
            })
            .collect()
    }

    fn modes(&self) -> Vec<TrackingMode> {
        self.iter()
            .filter_map(|e| match e {
                PdrEvent::ModeChange { mode } => Some(*mode),
                _ => None,
            })
            .collect()
    }

    fn warnings(&self) -> Vec<PdrWarning> {
        self.iter()
            .filter_map(|e| match e {
                PdrEvent::Warning { warning } => Some(warning.clone()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    fn pose() -> Pose {
        Pose {
            x: 1.0,
            y: 2.0,
            theta: 0.5,
            confidence: 0.9,
            t_ns: 42,
        }
    }

    #[test]
    fn test_vec_listener_collects_in_order() {
        let mut events: Vec<PdrEvent> = Vec::new();
        events.on_mode_change(TrackingMode::Walking);
        events.on_pose(&pose());
        events.on_session_end(&[]);
        assert_eq!(events.len(), 3);
        assert_eq!(events.modes(), vec![TrackingMode::Walking]);
        assert_eq!(events.poses(), vec![pose()]);
        assert!(matches!(events[2], PdrEvent::SessionEnd { .. }));
    }

    #[test]
    fn test_channel_listener_forwards_and_tolerates_drop() {
        let (mut tx, rx) = unbounded();
        tx.on_pose(&pose());
        assert!(matches!(rx.try_recv(), Ok(PdrEvent::Pose { .. })));
        drop(rx);
        tx.on_mode_change(TrackingMode::Stationary);
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_string(&PdrEvent::ModeChange {
            mode: TrackingMode::Degraded,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"mode_change","mode":"degraded"}"#);
    }

    #[test]
    fn test_custom_listener_overrides_one_method() {
        #[derive(Default)]
        struct StepCounter(usize);
        impl PdrListener for StepCounter {
            fn on_step(&mut self, _step: &StepEvent) {
                self.0 += 1;
            }
        }
        let mut counter = StepCounter::default();
        counter.on_pose(&pose());
        assert_eq!(counter.0, 0);
    }
}
