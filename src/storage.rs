// storage.rs — Persistence helpers
//
// Calibration snapshots on disk, the per-sample NDJSON session log, and the
// NDJSON recording format the replay tool consumes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, Write};
use std::path::Path;

use crate::calibration::CalibrationSnapshot;
use crate::error::{PdrError, PdrResult};
use crate::step_detector::DetectorPhase;
use crate::types::{Channel, ChannelReading, NativeStep, Pose, StepEvent, ValidFlags};

pub fn save_calibration(path: &Path, snapshot: &CalibrationSnapshot) -> PdrResult<()> {
    fs::write(path, snapshot.to_bytes())?;
    Ok(())
}

pub fn load_calibration(path: &Path) -> PdrResult<CalibrationSnapshot> {
    let bytes = fs::read(path)?;
    CalibrationSnapshot::from_bytes(&bytes)
}

/// One processed sample as written to the session log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionLogRecord {
    /// Seconds since the first processed sample.
    pub relative_time: f64,
    pub t_ns: u64,
    pub accel: [f64; 3],
    pub gyro: [f64; 3],
    pub mag: [f64; 3],
    pub valid: ValidFlags,
    /// Body→world attitude `[w, x, y, z]`, absent while calibrating.
    pub quaternion: Option<[f64; 4]>,
    pub step_phase: Option<DetectorPhase>,
    pub step: Option<StepEvent>,
    pub pose: Option<Pose>,
}

/// Newline-delimited JSON writer, one `SessionLogRecord` per line.
pub struct SessionLogWriter<W: Write> {
    writer: W,
    records: u64,
}

impl<W: Write> SessionLogWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, records: 0 }
    }

    pub fn write(&mut self, record: &SessionLogRecord) -> PdrResult<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn flush(&mut self) -> PdrResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// One line of a raw sensor recording.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordingEntry {
    Reading {
        channel: Channel,
        t_ns: u64,
        x: f64,
        y: f64,
        z: f64,
    },
    NativeStep {
        t_ns: u64,
        total_steps: u64,
        length_m: Option<f64>,
    },
}

impl RecordingEntry {
    pub fn t_ns(&self) -> u64 {
        match self {
            RecordingEntry::Reading { t_ns, .. } | RecordingEntry::NativeStep { t_ns, .. } => *t_ns,
        }
    }
}

impl From<ChannelReading> for RecordingEntry {
    fn from(r: ChannelReading) -> Self {
        RecordingEntry::Reading {
            channel: r.channel,
            t_ns: r.t_ns,
            x: r.value.x,
            y: r.value.y,
            z: r.value.z,
        }
    }
}

impl From<NativeStep> for RecordingEntry {
    fn from(n: NativeStep) -> Self {
        RecordingEntry::NativeStep {
            t_ns: n.t_ns,
            total_steps: n.total_steps,
            length_m: n.length_m,
        }
    }
}

/// Parse a recording, skipping blank lines. Errors carry the 1-based line number.
pub fn read_recording<R: BufRead>(reader: R) -> PdrResult<Vec<RecordingEntry>> {
    let mut entries = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry = serde_json::from_str(trimmed).map_err(|e| {
            PdrError::InvalidState(format!("recording line {}: {}", i + 1, e))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

pub fn write_recording<W: Write>(mut writer: W, entries: &[RecordingEntry]) -> PdrResult<()> {
    for entry in entries {
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
