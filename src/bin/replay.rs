use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::Parser;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;

use pdr_core::calibration::CalibrationState;
use pdr_core::events::{EventLog, PdrEvent};
use pdr_core::storage::{self, RecordingEntry};
use pdr_core::types::{ChannelReading, NativeStep};
use pdr_core::{PdrConfig, PdrSession, UserProfile};

#[derive(Parser, Debug)]
#[command(about = "Replay a raw sensor recording through the PDR core")]
struct Args {
    /// Path to a recording_*.ndjson[.gz] file
    #[arg(long, conflicts_with = "recording_dir")]
    log: Option<PathBuf>,

    /// Directory of recordings to batch replay (processes recording_*.ndjson[.gz])
    #[arg(long)]
    recording_dir: Option<PathBuf>,

    /// JSON configuration file; defaults apply to missing fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Walker height in meters
    #[arg(long, default_value = "1.75")]
    height: f64,

    /// Calibration record to start from; pocket calibration runs when absent or expired
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Write the resulting calibration record here
    #[arg(long)]
    save_calibration: Option<PathBuf>,

    /// Session log output (NDJSON, gzipped if the name ends in .gz); single recording only
    #[arg(long)]
    session_log: Option<PathBuf>,

    /// Write the final live status JSON here
    #[arg(long)]
    status: Option<PathBuf>,
}

fn is_gz(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

fn load_recording(path: &Path) -> anyhow::Result<Vec<RecordingEntry>> {
    let file = File::open(path)?;
    let reader: Box<dyn BufRead> = if is_gz(path) {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut entries = storage::read_recording(reader)?;
    // Channels are recorded by independent callbacks; replay in time order.
    entries.sort_by_key(|e| e.t_ns());
    Ok(entries)
}

fn open_session_log(path: &Path) -> anyhow::Result<Box<dyn Write + Send>> {
    let file = BufWriter::new(File::create(path)?);
    if is_gz(path) {
        Ok(Box::new(GzEncoder::new(file, Compression::default())))
    } else {
        Ok(Box::new(file))
    }
}

fn run_once(path: &Path, args: &Args, config: &PdrConfig) -> anyhow::Result<serde_json::Value> {
    let entries = load_recording(path)?;
    let Some(first_t) = entries.first().map(|e| e.t_ns()) else {
        anyhow::bail!("{} is empty", path.display());
    };

    let mut session = PdrSession::new(Vec::<PdrEvent>::new());
    session.configure(config.clone(), UserProfile::new(args.height))?;
    if let Some(log_path) = args.session_log.as_ref() {
        session.set_session_log(open_session_log(log_path)?);
    }

    let calibration = match args.calibration.as_ref() {
        Some(cal_path) => match storage::load_calibration(cal_path) {
            Ok(snapshot) => Some(CalibrationState::Valid(snapshot)),
            Err(e) => {
                log::warn!("ignoring calibration {}: {}", cal_path.display(), e);
                None
            }
        },
        None => None,
    };
    session.start(first_t, calibration)?;

    let mut readings = 0u64;
    let mut natives = 0u64;
    for entry in &entries {
        match *entry {
            RecordingEntry::Reading {
                channel,
                t_ns,
                x,
                y,
                z,
            } => {
                session.push(ChannelReading::new(channel, t_ns, x, y, z));
                readings += 1;
            }
            RecordingEntry::NativeStep {
                t_ns,
                total_steps,
                length_m,
            } => {
                session.push_native(NativeStep {
                    t_ns,
                    total_steps,
                    length_m,
                });
                natives += 1;
            }
        }
        session.process_pending()?;
    }

    let status = session.live_status();
    let pose = session.pose();
    let calibration = session.calibration();
    let trajectory = session.stop()?;

    if let Some(out) = args.save_calibration.as_ref() {
        storage::save_calibration(out, calibration.snapshot())?;
    }
    if let Some(out) = args.status.as_ref() {
        status.save(out)?;
    }

    let events = session.listener();
    Ok(json!({
        "log": path.display().to_string(),
        "replayed_at": Utc::now().to_rfc3339(),
        "readings": readings,
        "native_steps": natives,
        "samples": status.samples_processed,
        "late_samples": status.late_samples,
        "steps": status.step_count,
        "distance_m": status.distance_m,
        "final_x": pose.x,
        "final_y": pose.y,
        "final_heading_deg": pose.theta.to_degrees(),
        "final_confidence": pose.confidence,
        "trajectory_points": trajectory.len(),
        "calibration": status.calibration,
        "mode_changes": events.modes().len(),
        "warnings": events.warnings().len(),
        "rejected_cadence": status.rejected_cadence,
        "heading_reacquired": status.heading_reacquired,
        "outlier_corrected": status.outlier_corrected,
        "numerical_resets": status.numerical_resets,
    }))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match args.config.as_ref() {
        Some(path) => PdrConfig::from_json_str(&fs::read_to_string(path)?)?,
        None => PdrConfig::default(),
    };

    let mut results = Vec::new();
    if let Some(dir) = args.recording_dir.as_ref() {
        if args.session_log.is_some() {
            anyhow::bail!("--session-log needs a single --log");
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if path.is_file()
                && name.starts_with("recording_")
                && (name.ends_with(".ndjson") || name.ends_with(".ndjson.gz"))
            {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            match run_once(&path, &args, &config) {
                Ok(res) => results.push(res),
                Err(e) => eprintln!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, &args, &config)?);
    } else {
        anyhow::bail!("Provide --log or --recording-dir");
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
