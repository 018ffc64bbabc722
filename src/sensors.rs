// sensors.rs — Sensor intake
//
// Three independent sources push tri-axial readings at nominally equal rates.
// The accelerometer is the reference clock: every accel reading becomes one
// unified sample, with gyro and mag aligned to it inside ±1 nominal period.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;

use crate::config::PdrConfig;
use crate::error::{PdrError, PdrResult};
use crate::health_monitor::{HealthMonitor, HealthReport};
use crate::types::{Channel, ChannelReading, ChannelStatus, SensorSample, ValidFlags, Vec3};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntakeStats {
    pub emitted: u64,
    pub late_samples: u64,
    pub overflow_dropped: u64,
    pub invalid_values: u64,
}

/// Cloneable handle for feeding the intake from platform callbacks on other threads.
#[derive(Clone, Debug)]
pub struct IntakeProducer {
    tx: Sender<ChannelReading>,
}

impl IntakeProducer {
    pub fn send(&self, reading: ChannelReading) -> PdrResult<()> {
        self.tx
            .send(reading)
            .map_err(|_| PdrError::SensorUnavailable("intake dropped".to_string()))
    }

    pub fn send_sample(&self, sample: &SensorSample) -> PdrResult<()> {
        for reading in sample.readings() {
            self.send(reading)?;
        }
        Ok(())
    }
}

pub struct SensorIntake {
    tolerance_ns: u64,
    reorder_ns: u64,
    capacity: usize,
    queues: [VecDeque<ChannelReading>; 3],
    last_value: [Option<Vec3>; 3],
    last_emitted_ns: Option<u64>,
    health: HealthMonitor,
    stats: IntakeStats,
    tx: Sender<ChannelReading>,
    rx: Receiver<ChannelReading>,
}

impl SensorIntake {
    pub fn new(config: &PdrConfig) -> Self {
        let period_ns = config.period_ns() as f64;
        let (tx, rx) = unbounded();
        let reorder_ns = (period_ns * config.intake.reorder_periods).round() as u64;
        Self {
            tolerance_ns: (period_ns * config.intake.tolerance_periods).round() as u64,
            reorder_ns,
            capacity: config.intake.queue_capacity,
            queues: Default::default(),
            last_value: [None; 3],
            last_emitted_ns: None,
            health: HealthMonitor::new(
                (period_ns * config.intake.stale_periods).round() as u64,
                reorder_ns,
                config.intake.drop_rate_alpha,
            ),
            stats: IntakeStats::default(),
            tx,
            rx,
        }
    }

    pub fn producer(&self) -> IntakeProducer {
        IntakeProducer {
            tx: self.tx.clone(),
        }
    }

    /// Enqueue one reading. Returns false if it was dropped (late or non-finite).
    pub fn push(&mut self, reading: ChannelReading) -> bool {
        if !reading.value.iter().all(|v| v.is_finite()) {
            self.stats.invalid_values += 1;
            log::trace!("dropping non-finite {} reading", reading.channel);
            return false;
        }
        if self.is_late(&reading) {
            self.stats.late_samples += 1;
            self.health.record_late(reading.channel);
            log::trace!(
                "late {} reading at t={} (last emitted {:?})",
                reading.channel,
                reading.t_ns,
                self.last_emitted_ns
            );
            return false;
        }

        self.health.record_reading(reading.channel, reading.t_ns);
        let queue = &mut self.queues[reading.channel.index()];
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.stats.overflow_dropped += 1;
        }
        queue.push_back(reading);
        true
    }

    /// Split a unified sample into its channels and enqueue them.
    pub fn push_sample(&mut self, sample: &SensorSample) {
        for reading in sample.readings() {
            self.push(reading);
        }
    }

    fn is_late(&self, reading: &ChannelReading) -> bool {
        let queue = &self.queues[reading.channel.index()];
        if let Some(tail) = queue.back() {
            if reading.t_ns <= tail.t_ns {
                return true;
            }
        }
        match (reading.channel, self.last_emitted_ns) {
            (_, None) => false,
            (Channel::Accel, Some(last)) => reading.t_ns <= last,
            (_, Some(last)) => reading.t_ns + self.tolerance_ns < last,
        }
    }

    /// Emit the next unified sample if the reference reading can be resolved.
    ///
    /// Fails with `StaleSensor` when a channel skipped more than the configured
    /// number of periods, or trails the others beyond the reorder allowance.
    pub fn tick(&mut self) -> PdrResult<Option<SensorSample>> {
        while let Ok(reading) = self.rx.try_recv() {
            self.push(reading);
        }

        if let Some((channel, silent_ms)) = self.health.first_stale() {
            return Err(PdrError::StaleSensor { channel, silent_ms });
        }

        let Some(reference) = self.queues[Channel::Accel.index()].front().copied() else {
            return Ok(None);
        };
        if !self.ready(reference.t_ns) {
            return Ok(None);
        }
        self.queues[Channel::Accel.index()].pop_front();

        let mut sample = SensorSample {
            t_ns: reference.t_ns,
            accel: reference.value,
            gyro: Vec3::zeros(),
            mag: Vec3::zeros(),
            valid: ValidFlags::ALL_FRESH,
        };
        for channel in [Channel::Gyro, Channel::Mag] {
            let (value, status) = self.align(channel, reference.t_ns);
            match channel {
                Channel::Gyro => sample.gyro = value,
                _ => sample.mag = value,
            }
            sample.valid.set(channel, status);
            self.health
                .observe_emission(channel, status == ChannelStatus::Fresh);
        }
        self.health.observe_emission(Channel::Accel, true);

        self.last_emitted_ns = Some(reference.t_ns);
        self.stats.emitted += 1;
        Ok(Some(sample))
    }

    /// Other channels have caught up with `t_ref`, or the stream has moved on
    /// past the reorder allowance and the gaps get filled.
    fn ready(&self, t_ref: u64) -> bool {
        let caught_up = [Channel::Gyro, Channel::Mag].iter().all(|c| {
            self.health
                .channel(*c)
                .last_seen()
                .is_some_and(|t| t >= t_ref)
        });
        caught_up || self.health.newest_ns() > t_ref + self.reorder_ns
    }

    /// Staleness against the caller's clock (same time base as the readings).
    pub fn check_silence(&self, now_ns: u64) -> PdrResult<()> {
        match self.health.first_silent_at(now_ns) {
            Some((channel, silent_ms)) => Err(PdrError::StaleSensor { channel, silent_ms }),
            None => Ok(()),
        }
    }

    /// Closest reading within tolerance, else the carried value.
    fn align(&mut self, channel: Channel, t_ref: u64) -> (Vec3, ChannelStatus) {
        let idx = channel.index();
        let tolerance = self.tolerance_ns;
        let queue = &mut self.queues[idx];

        let mut best: Option<(u64, ChannelReading)> = None;
        let mut consumed = 0;
        for (i, r) in queue.iter().enumerate() {
            if r.t_ns > t_ref + tolerance {
                break;
            }
            if r.t_ns + tolerance < t_ref {
                // Too old for this or any later sample; still the latest known value.
                self.last_value[idx] = Some(r.value);
                consumed = i + 1;
                continue;
            }
            let dist = r.t_ns.abs_diff(t_ref);
            if best.map_or(true, |(d, _)| dist < d) {
                best = Some((dist, *r));
                consumed = i + 1;
            }
        }
        for _ in 0..consumed {
            queue.pop_front();
        }

        match best {
            Some((_, r)) => {
                self.last_value[idx] = Some(r.value);
                (r.value, ChannelStatus::Fresh)
            }
            None => match self.last_value[idx] {
                Some(v) => (v, ChannelStatus::Filled),
                None => (Vec3::zeros(), ChannelStatus::Missing),
            },
        }
    }

    /// Discard everything queued, including readings sitting in the producer channel.
    pub fn clear(&mut self) {
        while self.rx.try_recv().is_ok() {}
        for q in self.queues.iter_mut() {
            q.clear();
        }
        self.health.rebase();
    }

    /// Begin counting silence from `now_ns`, for a stream that may never start.
    pub fn anchor(&mut self, now_ns: u64) {
        self.health.anchor(now_ns);
    }

    pub fn pending(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum::<usize>() + self.rx.len()
    }

    pub fn drop_rate(&self) -> f64 {
        self.health.drop_rate()
    }

    pub fn health_report(&self) -> HealthReport {
        self.health.check_health()
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn stats(&self) -> &IntakeStats {
        &self.stats
    }
}
