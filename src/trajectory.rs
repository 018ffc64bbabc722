// trajectory.rs — Post-EKF trajectory filter
//
// Distance gate, outlier projection and confidence-weighted smoothing before a
// pose becomes a retained trajectory point.

use serde::Serialize;
use std::collections::VecDeque;

use crate::config::PdrConfig;
use crate::types::{Pose, TrajectoryPoint};

/// Outliers are projected to this fraction of the outlier threshold.
const OUTLIER_PROJECTION: f64 = 0.8;
/// Consecutive outliers at which the point is rejected and the filter re-anchors.
const MAX_CONSECUTIVE_OUTLIERS: u32 = 3;
const SMOOTHING_GAIN: f64 = 0.2;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TrajectoryCounters {
    pub appended: u64,
    pub skipped_distance: u64,
    pub outlier_corrected: u64,
    pub outlier_rejected: u64,
    pub resets: u64,
    pub evicted: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrajectoryDecision {
    Appended(TrajectoryPoint),
    /// Too close to the last retained point.
    Skipped,
    /// Third outlier in a row; the next pose starts a new anchor.
    Rejected,
}

pub struct TrajectoryFilter {
    min_distance: f64,
    outlier_threshold: f64,
    max_length: usize,
    points: VecDeque<TrajectoryPoint>,
    consecutive_outliers: u32,
    reanchor: bool,
    pub counters: TrajectoryCounters,
}

impl TrajectoryFilter {
    pub fn new(config: &PdrConfig) -> Self {
        Self {
            min_distance: config.min_point_distance_m,
            outlier_threshold: config.outlier_threshold_m,
            max_length: config.trajectory_max_length,
            points: VecDeque::new(),
            consecutive_outliers: 0,
            reanchor: false,
            counters: TrajectoryCounters::default(),
        }
    }

    pub fn push(&mut self, pose: &Pose) -> TrajectoryDecision {
        let raw = TrajectoryPoint {
            x: pose.x,
            y: pose.y,
            t_ns: pose.t_ns,
            confidence: pose.confidence,
            corrected: false,
            after_reset: false,
        };

        let Some(last) = self.points.back().copied() else {
            return self.append(raw);
        };

        if self.reanchor {
            self.reanchor = false;
            // A re-anchor may jump arbitrarily far, so it is flagged as corrected too.
            return self.append(TrajectoryPoint {
                corrected: true,
                after_reset: true,
                ..raw
            });
        }

        let jump = raw.distance_to(&last);
        if jump < self.min_distance {
            self.consecutive_outliers = 0;
            self.counters.skipped_distance += 1;
            return TrajectoryDecision::Skipped;
        }

        let mut candidate = raw;
        if jump > self.outlier_threshold {
            self.consecutive_outliers += 1;
            if self.consecutive_outliers >= MAX_CONSECUTIVE_OUTLIERS {
                log::warn!(
                    "{} consecutive trajectory outliers, re-anchoring",
                    self.consecutive_outliers
                );
                self.consecutive_outliers = 0;
                self.reanchor = true;
                self.counters.outlier_rejected += 1;
                self.counters.resets += 1;
                return TrajectoryDecision::Rejected;
            }

            let (ux, uy) = self
                .prior_direction()
                .unwrap_or(((raw.x - last.x) / jump, (raw.y - last.y) / jump));
            let reach = OUTLIER_PROJECTION * self.outlier_threshold;
            candidate.x = last.x + ux * reach;
            candidate.y = last.y + uy * reach;
            candidate.corrected = true;
            self.counters.outlier_corrected += 1;
            log::debug!(
                "trajectory jump {:.2} m projected to ({:.2}, {:.2})",
                jump,
                candidate.x,
                candidate.y
            );
        } else {
            self.consecutive_outliers = 0;
        }

        let alpha = SMOOTHING_GAIN * (1.0 - pose.confidence.clamp(0.0, 1.0));
        candidate.x = (1.0 - alpha) * candidate.x + alpha * last.x;
        candidate.y = (1.0 - alpha) * candidate.y + alpha * last.y;

        if candidate.distance_to(&last) < self.min_distance {
            self.counters.skipped_distance += 1;
            return TrajectoryDecision::Skipped;
        }
        self.append(candidate)
    }

    /// Unit direction of the last retained segment.
    fn prior_direction(&self) -> Option<(f64, f64)> {
        let n = self.points.len();
        if n < 2 {
            return None;
        }
        let a = &self.points[n - 2];
        let b = &self.points[n - 1];
        let d = b.distance_to(a);
        (d > 1e-9).then(|| ((b.x - a.x) / d, (b.y - a.y) / d))
    }

    fn append(&mut self, point: TrajectoryPoint) -> TrajectoryDecision {
        if self.points.len() >= self.max_length {
            self.points.pop_front();
            self.counters.evicted += 1;
        }
        self.points.push_back(point);
        self.counters.appended += 1;
        TrajectoryDecision::Appended(point)
    }

    pub fn points(&self) -> impl Iterator<Item = &TrajectoryPoint> {
        self.points.iter()
    }

    pub fn to_vec(&self) -> Vec<TrajectoryPoint> {
        self.points.iter().copied().collect()
    }

    pub fn last(&self) -> Option<&TrajectoryPoint> {
        self.points.back()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Hand over every retained point and release the buffer.
    pub fn take(&mut self) -> Vec<TrajectoryPoint> {
        let points: Vec<_> = self.points.drain(..).collect();
        self.points.shrink_to_fit();
        points
    }
}
