//! Append-only reward log.
//!
//! Every completed report produces one [`RewardRecord`], written as a single
//! line `bucket,action,latency_us,reward,sequence`. Records travel through a
//! bounded channel to a dedicated writer thread, so a slow destination never
//! stalls `decide` or `report`; when the queue is full the record is dropped
//! and counted.
//!
//! Each line is formatted completely and handed to the OS in one write with
//! no user-space buffering, so a reader only ever sees whole lines plus, at
//! worst, one truncated trailing line.

use std::fmt::{self, Write as _};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Result, TunerError};
use crate::mab::{Action, Bucket};
use crate::metrics::TunerMetrics;

/// One reward observation. Immutable once written.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RewardRecord {
    pub bucket: Bucket,
    pub action: Action,
    pub latency_us: f64,
    pub reward: f64,
    pub sequence: u64,
}

impl fmt::Display for RewardRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `{}` on f64 prints the shortest text that parses back to the same value.
        write!(
            f,
            "{},{},{},{},{}",
            self.bucket, self.action, self.latency_us, self.reward, self.sequence
        )
    }
}

impl FromStr for RewardRecord {
    type Err = TunerError;

    fn from_str(line: &str) -> Result<Self> {
        let bad = |reason| TunerError::InvalidRecord {
            line: line.to_string(),
            reason,
        };
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(',').collect();
        let [bucket, action, latency_us, reward, sequence] = fields[..] else {
            return Err(bad("expected 5 fields"));
        };
        Ok(RewardRecord {
            bucket: bucket.parse()?,
            action: action.parse()?,
            latency_us: latency_us.parse().map_err(|_| bad("bad latency"))?,
            reward: reward.parse().map_err(|_| bad("bad reward"))?,
            sequence: sequence.parse().map_err(|_| bad("bad sequence"))?,
        })
    }
}

/// Read every complete record from a reward log.
///
/// Lines that fail to parse (such as a truncated final line) are skipped.
pub fn read_log(path: impl AsRef<Path>) -> std::io::Result<Vec<RewardRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        if let Ok(record) = line?.parse() {
            records.push(record);
        }
    }
    Ok(records)
}

/// Destination of reward records.
pub struct TelemetrySink {
    sender: RwLock<Option<Sender<RewardRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    path: Option<PathBuf>,
    metrics: TunerMetrics,
    warned_full: AtomicBool,
}

impl TelemetrySink {
    /// A sink that discards every record.
    pub fn disabled(metrics: TunerMetrics) -> Self {
        Self {
            sender: RwLock::new(None),
            writer: Mutex::new(None),
            path: None,
            metrics,
            warned_full: AtomicBool::new(false),
        }
    }

    /// Open `path` for appending and start the writer thread.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::TelemetryOpen`] if the file cannot be opened or
    /// the writer thread cannot be started.
    pub fn open(path: impl Into<PathBuf>, queue_len: usize, metrics: TunerMetrics) -> Result<Self> {
        let path = path.into();
        let open_err = |source| TunerError::TelemetryOpen {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;

        let (tx, rx) = crossbeam_channel::bounded(queue_len.max(1));
        let writer_path = path.clone();
        let writer_metrics = metrics.clone();
        let handle = std::thread::Builder::new()
            .name("nccl-tuner-telemetry".to_string())
            .spawn(move || run_writer(file, writer_path, rx, writer_metrics))
            .map_err(open_err)?;

        debug!(path = %path.display(), queue_len, "reward log opened");
        Ok(Self {
            sender: RwLock::new(Some(tx)),
            writer: Mutex::new(Some(handle)),
            path: Some(path),
            metrics,
            warned_full: AtomicBool::new(false),
        })
    }

    /// Log destination, if enabled.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Queue one record for writing. Never blocks.
    ///
    /// Returns false if the record was dropped.
    pub fn append(&self, record: RewardRecord) -> bool {
        let sender = self.sender.read();
        let Some(tx) = sender.as_ref() else {
            return false;
        };
        match tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.metrics.telemetry_dropped.inc();
                if !self.warned_full.swap(true, Ordering::Relaxed) {
                    warn!(
                        sequence = record.sequence,
                        "reward log queue full, dropping records"
                    );
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.metrics.telemetry_dropped.inc();
                warn!(sequence = record.sequence, "reward log writer has exited");
                false
            }
        }
    }

    /// Flush queued records and stop the writer. Idempotent.
    pub fn close(&self) {
        // Dropping the sender ends the writer's receive loop after it drains.
        drop(self.sender.write().take());
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                warn!("reward log writer panicked");
            }
        }
    }
}

impl Drop for TelemetrySink {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TelemetrySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetrySink")
            .field("path", &self.path)
            .field("open", &self.sender.read().is_some())
            .finish()
    }
}

fn run_writer(mut file: File, path: PathBuf, rx: Receiver<RewardRecord>, metrics: TunerMetrics) {
    let mut line = String::with_capacity(128);
    for record in rx.iter() {
        line.clear();
        // Writing into a String cannot fail.
        let _ = writeln!(line, "{}", record);
        if let Err(e) = file.write_all(line.as_bytes()) {
            metrics.telemetry_write_errors.inc();
            warn!(%e, path = %path.display(), sequence = record.sequence, "failed to append reward record");
        }
    }
    if let Err(e) = file.sync_data() {
        warn!(%e, path = %path.display(), "failed to sync reward log");
    }
    debug!(path = %path.display(), "reward log closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mab::{Algorithm, CollType, Protocol, Topology};

    fn record(sequence: u64) -> RewardRecord {
        RewardRecord {
            bucket: Bucket::new(CollType::AllReduce, 1 << 20, Topology::new(1, 8)),
            action: Action::pair(Algorithm::Ring, Protocol::Ll128),
            latency_us: 12_345.678,
            reward: 1000.0 / 12_345.678,
            sequence,
        }
    }

    #[test]
    fn test_record_line_round_trip() {
        let original = record(17);
        let line = original.to_string();
        assert_eq!(line.matches(',').count(), 4);
        let parsed: RewardRecord = line.parse().unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.reward.to_bits(), original.reward.to_bits());
    }

    #[test]
    fn test_record_line_format() {
        let r = RewardRecord {
            bucket: "allreduce/1MB".parse().unwrap(),
            action: Action::protocol(Protocol::Ll128),
            latency_us: 10_000.0,
            reward: 0.1,
            sequence: 0,
        };
        assert_eq!(r.to_string(), "allreduce/1MB,ll128,10000,0.1,0");
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!("allreduce/1MB,ll128,10000,0.1".parse::<RewardRecord>().is_err());
        assert!("allreduce/1MB,ll128,10000,0.1,0,extra"
            .parse::<RewardRecord>()
            .is_err());
        assert!("allreduce/1MB,ll128,fast,0.1,0".parse::<RewardRecord>().is_err());
    }

    #[test]
    fn test_sink_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rewards.log");
        let sink = TelemetrySink::open(&path, 16, TunerMetrics::new()).unwrap();
        for seq in 0..5 {
            assert!(sink.append(record(seq)));
        }
        sink.close();

        let records = read_log(&path).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[3], record(3));
        // Closed sinks drop silently.
        assert!(!sink.append(record(9)));
    }

    #[test]
    fn test_truncated_tail_does_not_corrupt_earlier_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rewards.log");
        {
            let sink = TelemetrySink::open(&path, 16, TunerMetrics::new()).unwrap();
            sink.append(record(0));
            sink.append(record(1));
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"allreduce/1MB@1x8,ring/ll1").unwrap();

        let records = read_log(&path).unwrap();
        assert_eq!(records, vec![record(0), record(1)]);
    }

    #[test]
    fn test_appends_to_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rewards.log");
        for seq in 0..2 {
            let sink = TelemetrySink::open(&path, 4, TunerMetrics::new()).unwrap();
            sink.append(record(seq));
        }
        assert_eq!(read_log(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_open_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("rewards.log");
        let err = TelemetrySink::open(&path, 4, TunerMetrics::new()).unwrap_err();
        assert!(matches!(err, TunerError::TelemetryOpen { .. }));
    }

    #[test]
    fn test_disabled_sink_drops_everything() {
        let sink = TelemetrySink::disabled(TunerMetrics::new());
        assert!(!sink.append(record(0)));
        assert!(sink.path().is_none());
        sink.close();
    }
}
