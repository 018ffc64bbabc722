use serde::Serialize;

use crate::types::{Channel, NANOS_PER_MILLI};

/// Tracks health metrics for one sensor channel, on sample time.
#[derive(Clone, Debug)]
pub struct ChannelHealth {
    pub channel: Channel,
    last_seen_ns: Option<u64>,
    pub readings: u64,
    pub fills: u64,
    pub late: u64,
    drop_rate: f64,
    alpha: f64,
}

impl ChannelHealth {
    pub fn new(channel: Channel, alpha: f64) -> Self {
        ChannelHealth {
            channel,
            last_seen_ns: None,
            readings: 0,
            fills: 0,
            late: 0,
            drop_rate: 0.0,
            alpha,
        }
    }

    pub fn update(&mut self, t_ns: u64) {
        self.readings += 1;
        self.last_seen_ns = Some(self.last_seen_ns.map_or(t_ns, |t| t.max(t_ns)));
    }

    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen_ns
    }

    /// Record whether this channel contributed a fresh reading to an emitted sample.
    pub fn observe_emission(&mut self, fresh: bool) {
        if !fresh {
            self.fills += 1;
        }
        let dropped = if fresh { 0.0 } else { 1.0 };
        self.drop_rate += self.alpha * (dropped - self.drop_rate);
    }

    pub fn drop_rate(&self) -> f64 {
        self.drop_rate
    }

    /// Silence at `now_ns`, measured from the last reading or from `origin_ns` if none arrived yet.
    pub fn silence_ns(&self, now_ns: u64, origin_ns: u64) -> u64 {
        now_ns.saturating_sub(self.last_seen_ns.unwrap_or(origin_ns))
    }

    fn forget_last_seen(&mut self) {
        self.last_seen_ns = None;
    }
}

/// Staleness and drop-rate bookkeeping for the three channels.
///
/// A channel is stale when its own timestamps jump by more than `stale_after_ns`,
/// or when it trails the newest reading on any channel by more than
/// `stale_after_ns + reorder_ns`. The reorder allowance absorbs batched delivery.
#[derive(Clone, Debug)]
pub struct HealthMonitor {
    channels: [ChannelHealth; 3],
    stale_after_ns: u64,
    reorder_ns: u64,
    origin_ns: Option<u64>,
    /// Caller-supplied start time, used for silence before any reading arrives.
    anchor_ns: Option<u64>,
    newest_ns: u64,
    /// Largest in-sequence gap per channel since the last rebase.
    gaps_ns: [u64; 3],
}

impl HealthMonitor {
    pub fn new(stale_after_ns: u64, reorder_ns: u64, drop_rate_alpha: f64) -> Self {
        HealthMonitor {
            channels: [
                ChannelHealth::new(Channel::Accel, drop_rate_alpha),
                ChannelHealth::new(Channel::Gyro, drop_rate_alpha),
                ChannelHealth::new(Channel::Mag, drop_rate_alpha),
            ],
            stale_after_ns,
            reorder_ns,
            origin_ns: None,
            anchor_ns: None,
            newest_ns: 0,
            gaps_ns: [0; 3],
        }
    }

    pub fn record_reading(&mut self, channel: Channel, t_ns: u64) {
        if self.origin_ns.is_none() {
            self.origin_ns = Some(t_ns);
        }
        self.newest_ns = self.newest_ns.max(t_ns);
        let idx = channel.index();
        if let Some(last) = self.channels[idx].last_seen() {
            let gap = t_ns.saturating_sub(last);
            if gap > self.stale_after_ns {
                log::debug!("{} gap of {} ms", channel, gap / NANOS_PER_MILLI);
                self.gaps_ns[idx] = self.gaps_ns[idx].max(gap);
            }
        }
        self.channels[idx].update(t_ns);
    }

    pub fn record_late(&mut self, channel: Channel) {
        self.channels[channel.index()].late += 1;
    }

    pub fn observe_emission(&mut self, channel: Channel, fresh: bool) {
        self.channels[channel.index()].observe_emission(fresh);
    }

    pub fn channel(&self, channel: Channel) -> &ChannelHealth {
        &self.channels[channel.index()]
    }

    pub fn newest_ns(&self) -> u64 {
        self.newest_ns
    }

    /// Worst per-channel drop rate, fed into pose confidence.
    pub fn drop_rate(&self) -> f64 {
        self.channels
            .iter()
            .map(|c| c.drop_rate())
            .fold(0.0, f64::max)
    }

    /// How far a channel may trail the newest reading before it counts as silent.
    pub fn lag_limit_ns(&self) -> u64 {
        self.stale_after_ns + self.reorder_ns
    }

    /// First channel with a sequence gap or a lag beyond the limit, with the
    /// silence in ms.
    pub fn first_stale(&self) -> Option<(Channel, u64)> {
        let origin = self.origin_ns?;
        self.channels
            .iter()
            .map(|c| {
                let gap = self.gaps_ns[c.channel.index()];
                let lag = c.silence_ns(self.newest_ns, origin);
                let silence = if lag > self.lag_limit_ns() { lag } else { gap };
                (c.channel, silence)
            })
            .find(|(_, silence)| *silence > 0)
            .map(|(channel, silence)| (channel, silence / NANOS_PER_MILLI))
    }

    /// First channel with nothing newer than `now_ns − limit`, measured on the
    /// caller's clock. Catches every channel going quiet at once.
    pub fn first_silent_at(&self, now_ns: u64) -> Option<(Channel, u64)> {
        let origin = self.origin_ns.or(self.anchor_ns)?;
        self.channels
            .iter()
            .map(|c| (c.channel, c.silence_ns(now_ns, origin)))
            .find(|(_, silence)| *silence > self.lag_limit_ns())
            .map(|(channel, silence)| (channel, silence / NANOS_PER_MILLI))
    }

    /// Start the caller-clock silence count at `now_ns` if nothing arrived yet.
    pub fn anchor(&mut self, now_ns: u64) {
        self.anchor_ns = Some(now_ns);
    }

    /// Forget last-seen times and gaps so a pause does not read as silence.
    pub fn rebase(&mut self) {
        self.origin_ns = None;
        self.anchor_ns = None;
        self.gaps_ns = [0; 3];
        for c in self.channels.iter_mut() {
            c.forget_last_seen();
        }
    }

    pub fn check_health(&self) -> HealthReport {
        let origin = self.origin_ns.unwrap_or(self.newest_ns);
        let report = |c: &ChannelHealth| ChannelReport {
            healthy: c.silence_ns(self.newest_ns, origin) <= self.lag_limit_ns()
                && self.gaps_ns[c.channel.index()] == 0,
            silence_ms: c.silence_ns(self.newest_ns, origin) / NANOS_PER_MILLI,
            drop_rate: c.drop_rate(),
            readings: c.readings,
            fills: c.fills,
            late: c.late,
        };
        HealthReport {
            accel: report(&self.channels[0]),
            gyro: report(&self.channels[1]),
            mag: report(&self.channels[2]),
        }
    }

    /// Format health status for logging
    pub fn format_status(&self) -> String {
        let report = self.check_health();
        let fmt = |r: &ChannelReport| {
            if r.healthy {
                format!("ok ({:.0}% drop)", r.drop_rate * 100.0)
            } else {
                format!("SILENT {}ms", r.silence_ms)
            }
        };
        format!(
            "Health: Accel {} | Gyro {} | Mag {}",
            fmt(&report.accel),
            fmt(&report.gyro),
            fmt(&report.mag)
        )
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ChannelReport {
    pub healthy: bool,
    pub silence_ms: u64,
    pub drop_rate: f64,
    pub readings: u64,
    pub fills: u64,
    pub late: u64,
}

/// Report of sensor health status
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub accel: ChannelReport,
    pub gyro: ChannelReport,
    pub mag: ChannelReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = NANOS_PER_MILLI;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(80 * MS, 200 * MS, 0.02)
    }

    #[test]
    fn test_silence_detection() {
        let mut monitor = monitor();
        assert!(monitor.first_stale().is_none());

        for i in 0..20u64 {
            let t = i * 20 * MS;
            monitor.record_reading(Channel::Accel, t);
            monitor.record_reading(Channel::Gyro, t);
            if i < 2 {
                monitor.record_reading(Channel::Mag, t);
            }
            if i == 10 {
                // 180 ms behind, still inside the reorder allowance
                assert!(monitor.first_stale().is_none());
            }
        }
        // mag last seen at 20 ms, newest is 380 ms
        assert_eq!(monitor.first_stale(), Some((Channel::Mag, 360)));
        assert!(!monitor.check_health().mag.healthy);
        assert!(monitor.format_status().contains("Mag SILENT"));
    }

    #[test]
    fn test_never_seen_channel_counts_from_origin() {
        let mut monitor = monitor();
        monitor.record_reading(Channel::Accel, 1_000 * MS);
        monitor.record_reading(Channel::Gyro, 1_000 * MS);
        monitor.record_reading(Channel::Mag, 1_000 * MS);
        for t in (1_020..=1_300).step_by(20) {
            monitor.record_reading(Channel::Accel, t * MS);
            if t == 1_200 {
                assert!(monitor.first_stale().is_none());
            }
        }
        assert_eq!(monitor.first_stale().map(|(c, _)| c), Some(Channel::Gyro));
    }

    #[test]
    fn test_delayed_batch_is_not_silence() {
        let mut monitor = monitor();
        for i in 0..6u64 {
            monitor.record_reading(Channel::Accel, i * 20 * MS);
            monitor.record_reading(Channel::Gyro, i * 20 * MS);
        }
        assert!(monitor.first_stale().is_none());
        for i in 0..6u64 {
            monitor.record_reading(Channel::Mag, i * 20 * MS);
        }
        assert!(monitor.first_stale().is_none());
        assert!(monitor.check_health().mag.healthy);
    }

    #[test]
    fn test_sequence_gap_is_stale_even_after_catching_up() {
        let mut monitor = monitor();
        for t in [0, 20, 40, 60, 80, 100, 120] {
            monitor.record_reading(Channel::Accel, t * MS);
            monitor.record_reading(Channel::Gyro, t * MS);
        }
        monitor.record_reading(Channel::Mag, 0);
        monitor.record_reading(Channel::Mag, 120 * MS);
        assert_eq!(monitor.first_stale(), Some((Channel::Mag, 120)));
    }

    #[test]
    fn test_all_channels_quiet_on_caller_clock() {
        let mut monitor = monitor();
        for c in [Channel::Accel, Channel::Gyro, Channel::Mag] {
            monitor.record_reading(c, 100 * MS);
        }
        assert!(monitor.first_stale().is_none());
        assert!(monitor.first_silent_at(300 * MS).is_none());
        assert_eq!(monitor.first_silent_at(500 * MS), Some((Channel::Accel, 400)));
    }

    #[test]
    fn test_rebase_clears_silence() {
        let mut monitor = monitor();
        monitor.record_reading(Channel::Accel, 0);
        monitor.record_reading(Channel::Gyro, 0);
        monitor.record_reading(Channel::Mag, 0);
        monitor.rebase();
        monitor.record_reading(Channel::Accel, 5_000 * MS);
        assert!(monitor.first_stale().is_none());
    }

    #[test]
    fn test_anchor_covers_a_stream_that_never_starts() {
        let mut monitor = monitor();
        assert!(monitor.first_silent_at(1_000 * MS).is_none());
        monitor.anchor(1_000 * MS);
        assert!(monitor.first_silent_at(1_200 * MS).is_none());
        assert_eq!(
            monitor.first_silent_at(1_300 * MS).map(|(c, _)| c),
            Some(Channel::Accel)
        );
    }

    #[test]
    fn test_drop_rate_ema() {
        let mut monitor = HealthMonitor::new(80 * MS, 200 * MS, 0.5);
        monitor.observe_emission(Channel::Mag, false);
        assert_eq!(monitor.drop_rate(), 0.5);
        monitor.observe_emission(Channel::Mag, true);
        assert_eq!(monitor.drop_rate(), 0.25);
        assert_eq!(monitor.channel(Channel::Mag).fills, 1);
    }
}
