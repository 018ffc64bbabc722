//! End-to-end walks through the full session pipeline.

mod common;

use std::f64::consts::PI;

use approx::assert_relative_eq;

use common::{feed_all, tracking_session, Segment, StepWave, Synth, DT_NS, STRIDE_M};
use pdr_core::calibration::CalibrationState;
use pdr_core::config::{EkfConfig, StepDetectorConfig};
use pdr_core::events::{EventLog, PdrEvent, WarningKind};
use pdr_core::filters::pose_ekf::PoseEkf;
use pdr_core::step_detector::{StepCandidate, StepDetector, StepInput};
use pdr_core::trajectory::{TrajectoryDecision, TrajectoryFilter};
use pdr_core::types::{
    orthogonality_error, DetectionMethod, NativeStep, Quat, Rot3, StepEvent, StepSource,
    StrideSample, TrackingMode,
};
use pdr_core::{PdrConfig, PdrSession, SessionState, UserProfile};

const SEC: u64 = 1_000_000_000;

fn straight_walk(steps: usize) -> common::Rendered {
    Synth::new(StepWave::Sharp).render(&[
        Segment::Stand(1.0),
        Segment::Walk(steps),
        Segment::Stand(1.0),
    ])
}

fn right_turn_walk() -> common::Rendered {
    Synth::new(StepWave::Sharp).render(&[
        Segment::Stand(1.0),
        Segment::Walk(5),
        Segment::Stand(0.2),
        Segment::Turn {
            seconds: 1.0,
            rate: -PI / 2.0,
        },
        Segment::Stand(1.0),
        Segment::Walk(5),
        Segment::Stand(1.0),
    ])
}

fn assert_pose_invariants(events: &[PdrEvent]) {
    for pose in events.poses() {
        assert!(
            (0.0..=1.0).contains(&pose.confidence),
            "confidence {}",
            pose.confidence
        );
        assert!(
            pose.theta > -PI && pose.theta <= PI,
            "theta {} not wrapped",
            pose.theta
        );
    }
}

#[test]
fn stationary_phone_stays_put() {
    let mut session = tracking_session();
    let rendered = Synth::new(StepWave::Sharp).render(&[Segment::Stand(10.0)]);

    for sample in &rendered.samples {
        session.feed(sample).unwrap();
        let pose = session.pose();
        assert_eq!((pose.x, pose.y), (0.0, 0.0));
        if sample.t_ns >= SEC {
            assert!(pose.confidence > 0.8, "confidence {} at {}", pose.confidence, sample.t_ns);
        }
    }
    assert_eq!(session.step_count(), 0);
    assert!(session.listener().steps().is_empty());
    assert_eq!(session.mode(), TrackingMode::Stationary);
    assert_pose_invariants(session.listener());
}

#[test]
fn straight_walk_counts_ten_steps() {
    let mut session = tracking_session();
    let rendered = straight_walk(10);
    feed_all(&mut session, &rendered.samples);

    let steps = session.listener().steps();
    assert_eq!(steps.len(), 10);
    for (step, peak) in steps.iter().zip(&rendered.peak_times_ns) {
        assert!(step.t_ns.abs_diff(*peak) <= 2 * DT_NS);
        assert_eq!(step.source, StepSource::Detected);
        assert_eq!(step.method, DetectionMethod::Vertical);
    }
    // Cadence limit: no two steps closer than 150 ms.
    for pair in steps.windows(2) {
        assert!(pair[1].t_ns - pair[0].t_ns >= 150_000_000);
    }

    let pose = session.pose();
    assert_relative_eq!(pose.x, 10.0 * STRIDE_M, epsilon = 0.1);
    assert!(pose.y.abs() < 0.05);
    assert!(pose.confidence >= 0.7);
    assert_relative_eq!(session.distance(), 10.0 * STRIDE_M, epsilon = 1e-9);
    assert!(session.listener().modes().contains(&TrackingMode::Walking));
    assert_pose_invariants(session.listener());
}

#[test]
fn right_turn_after_five_steps() {
    let mut session = tracking_session();
    let rendered = right_turn_walk();

    for sample in &rendered.samples {
        session.feed(sample).unwrap();
        let q = session.attitude().q_bw();
        assert!((q.quaternion().norm() - 1.0).abs() < 1e-4);
    }

    assert_eq!(session.step_count(), 10);
    let pose = session.pose();
    assert!((pose.x - 5.0 * STRIDE_M).abs() < 0.2, "x = {}", pose.x);
    assert!((pose.y + 5.0 * STRIDE_M).abs() < 0.2, "y = {}", pose.y);
    assert!((pose.theta + PI / 2.0).abs() < 5f64.to_radians());

    let warnings = session.listener().warnings();
    assert!(warnings
        .iter()
        .any(|w| w.kind == WarningKind::HeadingReacquired));
    assert_pose_invariants(session.listener());
}

#[test]
fn spurious_step_fifty_ms_later_is_rejected() {
    let mut detector = StepDetector::new(&StepDetectorConfig::default(), 240.0);
    let rendered = straight_walk(4);
    let mut last_step: Option<StepEvent> = None;
    for sample in &rendered.samples {
        let vertical = -sample.accel.z - pdr_core::types::GRAVITY;
        let input = StepInput {
            t_ns: sample.t_ns,
            vertical: Some(vertical),
            magnitude: vertical,
            is_stable: true,
            unstable_ms: 0,
            gyro_norm: 0.0,
            mag_degraded: false,
        };
        if let Some(step) = detector.update(&input) {
            last_step = Some(step);
        }
    }
    let last = last_step.unwrap();
    assert_eq!(detector.step_count(), 4);

    let spurious = StepCandidate {
        t_ns: last.t_ns + 50_000_000,
        peak: 1.2,
        trough: -0.5,
        method: DetectionMethod::Vertical,
    };
    assert!(detector.evaluate_candidate(spurious).is_none());
    assert_eq!(detector.counters.rejected_cadence, 1);
    assert_eq!(detector.step_count(), 4);
}

#[test]
fn magnetic_interference_gates_heading() {
    let mut session = tracking_session();
    let rendered = Synth::new(StepWave::Sharp).render(&[
        Segment::Stand(2.0),
        Segment::Interference {
            seconds: 3.0,
            scale: 1.5,
        },
        Segment::Stand(3.0),
    ]);
    let (before, rest) = rendered.samples.split_at(100);
    let (disturbed, after) = rest.split_at(150);

    feed_all(&mut session, before);
    let confidence_before = session.pose().confidence;
    let p_theta_before = session.ekf().p_theta();
    let gated_before = session.ekf().counters.heading_gated;
    let applied_before = session.ekf().counters.heading_updates;
    assert!(confidence_before > 0.9);

    feed_all(&mut session, disturbed);
    let ekf = session.ekf();
    assert!(ekf.counters.heading_gated - gated_before >= 145);
    assert!(ekf.counters.heading_updates - applied_before <= 5);
    assert!(ekf.p_theta() > p_theta_before);
    let confidence_disturbed = session.pose().confidence;
    assert!(
        confidence_disturbed < confidence_before - 0.2,
        "confidence {} → {}",
        confidence_before,
        confidence_disturbed
    );
    assert_eq!(session.mode(), TrackingMode::Degraded);

    feed_all(&mut session, after);
    assert!(session.ekf().counters.heading_updates > applied_before + 100);
    assert!(session.pose().confidence > 0.9);
    assert_eq!(session.mode(), TrackingMode::Stationary);
    assert_eq!(
        session.listener().modes(),
        vec![
            TrackingMode::Stationary,
            TrackingMode::Degraded,
            TrackingMode::Stationary
        ]
    );
    assert_pose_invariants(session.listener());
}

#[test]
fn bad_heading_jump_is_projected() {
    let mut ekf = PoseEkf::new(&EkfConfig::default());
    let mut filter = TrajectoryFilter::new(&PdrConfig::default());

    let step = |t_ns: u64| StepEvent {
        t_ns,
        vertical_peak_magnitude: 1.2,
        cadence_hz: 2.0,
        inter_step_ms: 500,
        confidence: 1.0,
        source: StepSource::Detected,
        method: DetectionMethod::Vertical,
    };
    let strides = [
        (STRIDE_M, 0.0),
        (STRIDE_M, 0.0),
        // Heading glitch: a 3 m stride pointing sideways.
        (3.0, PI / 2.0),
    ];

    filter.push(&ekf.pose(0));
    let mut last = None;
    for (i, (delta_s, heading)) in strides.iter().enumerate() {
        let t = (i as u64 + 1) * SEC / 2;
        let stride = StrideSample {
            step: step(t),
            delta_s: *delta_s,
            heading: *heading,
        };
        ekf.predict(&stride).unwrap();
        ekf.update_displacement(&stride).unwrap();
        last = Some(filter.push(&ekf.pose(t)));
    }

    match last.unwrap() {
        TrajectoryDecision::Appended(p) => {
            assert!(p.corrected);
            assert!((p.x - 3.1).abs() < 0.02, "x = {}", p.x);
            assert!(p.y.abs() < 0.02, "y = {}", p.y);
        }
        other => panic!("expected corrected point, got {:?}", other),
    }
    assert_eq!(filter.counters.outlier_corrected, 1);
}

#[test]
fn native_steps_overlay_detected_ones() {
    let mut session = tracking_session();
    let rendered = straight_walk(10);
    let mut natives = rendered
        .peak_times_ns
        .iter()
        .enumerate()
        .map(|(i, t)| NativeStep {
            t_ns: *t,
            total_steps: i as u64 + 1,
            length_m: Some(0.7),
        })
        .peekable();

    let mut duplicate_sent = false;
    for sample in &rendered.samples {
        while let Some(native) = natives.next_if(|n| n.t_ns <= sample.t_ns) {
            session.push_native(native);
            if native.total_steps == 3 && !duplicate_sent {
                session.push_native(native);
                duplicate_sent = true;
            }
        }
        session.feed(sample).unwrap();
    }

    let steps = session.listener().steps();
    assert_eq!(steps.len(), 10);
    let totals: Vec<u64> = steps
        .iter()
        .map(|s| match s.source {
            StepSource::Native { total_steps, .. } => total_steps,
            StepSource::Detected => panic!("step not matched to platform event"),
        })
        .collect();
    assert!(totals.windows(2).all(|w| w[1] >= w[0]));
    assert!(steps.iter().all(|s| s.confidence == 1.0));
    assert_eq!(session.counters.native_duplicates, 1);
    assert_relative_eq!(session.pose().x, 7.0, epsilon = 0.1);
}

#[test]
fn late_platform_steps_still_claim_detected_ones() {
    let mut session = tracking_session();
    let rendered = straight_walk(10);
    // Stamped 100 ms after each peak, delivered 300 ms after it.
    let mut natives = rendered
        .peak_times_ns
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let native = NativeStep {
                t_ns: t + 100_000_000,
                total_steps: i as u64 + 1,
                length_m: Some(0.7),
            };
            (t + 300_000_000, native)
        })
        .peekable();

    for sample in &rendered.samples {
        while let Some((_, native)) = natives.next_if(|(delivered, _)| *delivered <= sample.t_ns) {
            session.push_native(native);
        }
        session.feed(sample).unwrap();
    }

    let steps = session.listener().steps();
    assert_eq!(steps.len(), 10);
    // Nothing to wait for before the platform reports its first step.
    assert_eq!(steps[0].source, StepSource::Detected);
    for (i, step) in steps.iter().enumerate().skip(1) {
        assert_eq!(
            step.source,
            StepSource::Native {
                total_steps: i as u64 + 1,
                length_m: Some(0.7)
            }
        );
        assert_eq!(step.confidence, 1.0);
        assert!(step.t_ns.abs_diff(rendered.peak_times_ns[i]) <= 2 * DT_NS);
    }
    assert_eq!(session.detector().counters.native_matched, 9);
    assert_relative_eq!(session.distance(), STRIDE_M + 9.0 * 0.7, epsilon = 1e-9);
    assert_relative_eq!(session.pose().x, STRIDE_M + 9.0 * 0.7, epsilon = 0.1);
}

/// Upward acceleration of a 5 Hz bump train, `tau` seconds into a bump.
fn fast_bump(tau: f64) -> f64 {
    if tau < 0.1 {
        1.2 * (PI * tau / 0.1).sin()
    } else {
        -0.6 * (PI * (tau - 0.1) / 0.1).sin()
    }
}

#[test]
fn fast_bump_burst_is_held_to_max_cadence() {
    let mut session = tracking_session();
    let mut synth = Synth::new(StepWave::Sharp);
    feed_all(&mut session, &synth.render(&[Segment::Stand(1.0)]).samples);

    let bumps = 10;
    let start = synth.t_ns;
    let burst: Vec<_> = (0..bumps * 10)
        .map(|_| {
            let tau = ((synth.t_ns - start) as f64 / 1e9) % 0.2;
            synth.next(fast_bump(tau), 0.0, 0.0, 1.0)
        })
        .collect();
    feed_all(&mut session, &burst);
    feed_all(&mut session, &synth.render(&[Segment::Stand(1.0)]).samples);

    let steps = session.listener().steps();
    assert!(
        (3..bumps).contains(&steps.len()),
        "{} steps from {} bumps",
        steps.len(),
        bumps
    );
    let min_interval = 60_000_000_000 / session.config().max_cadence_bpm as u64;
    for pair in steps.windows(2) {
        assert!(pair[1].t_ns - pair[0].t_ns >= min_interval);
    }
    assert!(steps.iter().all(|s| s.cadence_hz <= 4.0));

    let pose = session.pose();
    assert_relative_eq!(pose.x, session.distance(), epsilon = 0.1);
    assert!(pose.y.abs() < 0.05);
    let last_pose = session.listener().poses().last().copied().unwrap();
    assert_relative_eq!(last_pose.x, pose.x, epsilon = 1e-9);

    let points = session.trajectory().to_vec();
    assert_eq!(points.len(), steps.len() + 1);
    assert!(points.windows(2).all(|w| w[1].distance_to(&w[0]) >= 0.1));
}

#[test]
fn long_platform_strides_are_projected_then_reanchored() {
    let mut session = tracking_session();
    let lengths = [0.7, 0.7, 0.7, 2.5, 0.7, 0.7, 3.0, 3.0, 3.0, 0.7, 0.7];
    let rendered = straight_walk(lengths.len());
    let mut natives = rendered
        .peak_times_ns
        .iter()
        .zip(lengths)
        .enumerate()
        .map(|(i, (t, length))| NativeStep {
            t_ns: *t,
            total_steps: i as u64 + 1,
            length_m: Some(length),
        })
        .peekable();
    for sample in &rendered.samples {
        while let Some(native) = natives.next_if(|n| n.t_ns <= sample.t_ns) {
            session.push_native(native);
        }
        session.feed(sample).unwrap();
    }

    assert_eq!(session.step_count(), lengths.len() as u64);
    let total: f64 = lengths.iter().sum();
    assert_relative_eq!(session.distance(), total, epsilon = 1e-9);
    assert_relative_eq!(session.pose().x, total, epsilon = 0.2);

    let counters = &session.trajectory().counters;
    // 2.5 m once, then 3 m twice projected; the third 3 m stride re-anchors.
    assert_eq!(counters.outlier_corrected, 3);
    assert_eq!(counters.outlier_rejected, 1);

    let points = session.trajectory().to_vec();
    assert_eq!((points[0].x, points[0].y), (0.0, 0.0));
    let resets: Vec<_> = points.iter().filter(|p| p.after_reset).collect();
    assert_eq!(resets.len(), 1);
    let reanchor_x: f64 = lengths[..10].iter().sum();
    assert!((resets[0].x - reanchor_x).abs() < 0.2, "re-anchored at {}", resets[0].x);
    for pair in points.windows(2) {
        assert!(pair[1].distance_to(&pair[0]) <= 2.0 || pair[1].after_reset);
    }
    assert_eq!(points.iter().filter(|p| p.corrected).count(), 4);

    let trajectory = session.stop().unwrap();
    assert_eq!(trajectory, points);
    match session.listener().last() {
        Some(PdrEvent::SessionEnd { trajectory }) => {
            assert_eq!(trajectory.len(), points.len());
            assert_eq!(trajectory[0].t_ns, points[0].t_ns);
        }
        other => panic!("expected session end, got {:?}", other),
    }
}

#[test]
fn trajectory_starts_at_the_origin() {
    let mut session = tracking_session();
    let rendered = straight_walk(3);
    feed_all(&mut session, &rendered.samples);

    let trajectory = session.stop().unwrap();
    assert_eq!(trajectory.len(), 4);
    assert_eq!((trajectory[0].x, trajectory[0].y), (0.0, 0.0));
    assert!(!trajectory[0].corrected);
    assert!(trajectory[0].t_ns < rendered.peak_times_ns[0]);
    assert!(trajectory[1].x > 0.5);
}

#[test]
fn brief_field_disturbance_does_not_gate_steps() {
    let mut session = tracking_session();
    let rendered = Synth::new(StepWave::Sharp).render(&[
        Segment::Stand(1.0),
        Segment::Walk(4),
        Segment::DisturbedWalk {
            steps: 2,
            scale: 1.5,
        },
        Segment::Walk(4),
        Segment::Stand(1.0),
    ]);
    feed_all(&mut session, &rendered.samples);

    assert_eq!(session.step_count(), 10);
    assert_eq!(session.detector().counters.rejected_gyro, 0);
    assert!(session.ekf().counters.heading_gated > 0);
    assert!(!session.listener().modes().contains(&TrackingMode::Degraded));
}

#[test]
fn long_field_disturbance_turns_on_gyro_confirmation() {
    let mut session = tracking_session();
    let rendered = Synth::new(StepWave::Sharp).render(&[
        Segment::Stand(1.0),
        Segment::Walk(2),
        Segment::DisturbedWalk {
            steps: 10,
            scale: 1.5,
        },
        Segment::Stand(1.0),
    ]);
    feed_all(&mut session, &rendered.samples);

    assert!(session.listener().modes().contains(&TrackingMode::Degraded));
    // No hip swing on the gyro, so steps after the 2 s debounce are refused.
    let rejected = session.detector().counters.rejected_gyro;
    assert!(rejected >= 3, "{} rejected", rejected);
    assert_eq!(session.step_count() + rejected, 12);
}

#[test]
fn trajectory_respects_distance_and_outlier_gates() {
    let mut session = tracking_session();
    feed_all(&mut session, &right_turn_walk().samples);

    let points = session.trajectory().to_vec();
    assert!(points.len() >= 10);
    for pair in points.windows(2) {
        let d = pair[1].distance_to(&pair[0]);
        assert!(d >= 0.1 || pair[1].after_reset, "gap {} m", d);
        assert!(d <= 2.0 || pair[1].corrected, "jump {} m", d);
    }

    let trajectory = session.stop().unwrap();
    assert_eq!(trajectory, points);
    match session.listener().last() {
        Some(PdrEvent::SessionEnd { trajectory }) => assert_eq!(trajectory.len(), points.len()),
        other => panic!("expected session end, got {:?}", other),
    }
}

#[test]
fn pause_resume_leaves_pose_untouched() {
    let mut session = tracking_session();
    let rendered = straight_walk(6);
    feed_all(&mut session, &rendered.samples);

    let before = session.pose();
    let steps = session.step_count();
    let distance = session.distance();

    session.pause().unwrap();
    assert_eq!(session.state(), SessionState::Paused);
    let now = rendered.samples.last().unwrap().t_ns + 5 * SEC;
    session.resume(now).unwrap();
    assert_eq!(session.state(), SessionState::Tracking);

    let after = session.pose();
    assert_eq!(after.x.to_bits(), before.x.to_bits());
    assert_eq!(after.y.to_bits(), before.y.to_bits());
    assert_eq!(after.theta.to_bits(), before.theta.to_bits());
    assert_eq!(session.step_count(), steps);
    assert_eq!(session.distance().to_bits(), distance.to_bits());
}

/// Run the walking calibration for a phone mounted at `mount`, leaving the
/// synth ready to continue the same walk.
fn calibrate_by_walking(mount: Rot3) -> (PdrSession<Vec<PdrEvent>>, Synth) {
    let mut synth = Synth::new(StepWave::Balanced).with_mount(mount);
    let rendered = synth.render(&[Segment::Stand(1.0), Segment::Walk(16), Segment::Stand(0.5)]);

    let mut session = PdrSession::new(Vec::new());
    session
        .configure(PdrConfig::default(), UserProfile::default())
        .unwrap();
    session.start(0, None).unwrap();
    assert_eq!(session.state(), SessionState::Calibrating);
    feed_all(&mut session, &rendered.samples);
    assert_eq!(session.state(), SessionState::Tracking);
    (session, synth)
}

#[test]
fn walking_calibrates_a_rotated_pocket() {
    let mount = Quat::from_euler_angles(1.3, 0.2, 0.7).to_rotation_matrix();
    let (session, _) = calibrate_by_walking(mount);

    let calibration = session.calibration();
    let snapshot = match calibration.as_ref() {
        CalibrationState::Valid(s) => *s,
        CalibrationState::Degraded(_) => panic!("calibration degraded"),
    };
    let r = snapshot.r_body_to_phone.matrix();
    assert!(orthogonality_error(r) < 1e-3);
    assert!(r.determinant() > 0.0);

    // Body up recovered: phone-frame gravity maps back onto −z.
    let up_in_body = snapshot.r_phone_to_body() * (mount * pdr_core::types::Vec3::z());
    assert!(up_in_body.z > 0.99, "up axis {:?}", up_in_body);
    // Walking direction recovered with its sign.
    let forward_in_body = snapshot.r_phone_to_body() * (mount * pdr_core::types::Vec3::x());
    assert!(forward_in_body.x > 0.95, "forward axis {:?}", forward_in_body);

    let progress: Vec<f64> = session
        .listener()
        .iter()
        .filter_map(|e| match e {
            PdrEvent::CalibrationProgress { progress } => Some(progress.progress),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[1] >= w[0]));
    assert_eq!(progress.last().copied(), Some(1.0));
    assert!(session.step_count() >= 5, "{} steps", session.step_count());
}

#[test]
fn phone_facing_backwards_still_walks_forward() {
    for mount in [
        Quat::from_euler_angles(0.0, 0.0, PI),
        Quat::from_euler_angles(0.2, 0.1, PI),
        Quat::from_euler_angles(0.1, -0.2, 0.0),
    ] {
        let (mut session, mut synth) = calibrate_by_walking(mount.to_rotation_matrix());
        assert!(!session.calibration().is_degraded());
        let start = session.pose();
        let distance_before = session.distance();

        let walk = synth.render(&[Segment::Walk(12), Segment::Stand(1.0)]);
        feed_all(&mut session, &walk.samples);

        let pose = session.pose();
        let travelled = session.distance() - distance_before;
        let (dx, dy) = (pose.x - start.x, pose.y - start.y);
        assert!(travelled > 3.0, "travelled {} m", travelled);
        assert!(dx > 0.8 * travelled, "mount {:?}: moved ({}, {})", mount, dx, dy);
        assert!(dy.abs() < 0.5 * travelled, "mount {:?}: moved ({}, {})", mount, dx, dy);
    }
}

#[test]
fn readings_from_another_thread() {
    let mut session = tracking_session();
    let producer = session.producer();
    let rendered = Synth::new(StepWave::Sharp).render(&[Segment::Stand(4.0)]);
    let samples = rendered.samples.clone();

    let handle = std::thread::spawn(move || {
        for sample in &samples {
            producer.send_sample(sample).unwrap();
        }
    });
    handle.join().unwrap();

    let processed = session.process_pending().unwrap();
    assert_eq!(processed, rendered.samples.len());
    assert_eq!(session.intake().stats().emitted, processed as u64);
}
