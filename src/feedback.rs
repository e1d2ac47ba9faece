//! Inbound latency feed written by the workload.
//!
//! The workload appends one line per measured collective:
//!
//! ```text
//! collType,nBytes,nNodes,nRanks,latency_ms
//! allreduce,1048576,1,8,0.412
//! 4,1048576,1,8,0.398
//! ```
//!
//! `collType` is either a name (`allreduce`) or the host's numeric code.
//! The feed is tailed from a remembered offset; only newline-terminated
//! lines are consumed, so a line still being written is picked up on the
//! next poll. If the file shrinks the offset resets to the start.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, TunerError};
use crate::mab::{Bucket, CollType, Topology};

/// One latency observation from the workload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeedbackSample {
    pub bucket: Bucket,
    pub latency_us: f64,
}

impl FeedbackSample {
    /// Parse one feed line. Comments and blank lines yield `Ok(None)`.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let bad = |reason| TunerError::InvalidRecord {
            line: line.to_string(),
            reason,
        };

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [coll, n_bytes, nodes, ranks, latency_ms] = fields[..] else {
            return Err(bad("expected 5 fields"));
        };
        let coll = match coll.parse::<i32>() {
            Ok(raw) => CollType::from_raw(raw).ok_or_else(|| bad("unknown collective code"))?,
            Err(_) => coll.parse()?,
        };
        let n_bytes: u64 = n_bytes.parse().map_err(|_| bad("bad byte count"))?;
        let nodes: u32 = nodes.parse().map_err(|_| bad("bad node count"))?;
        let ranks: u32 = ranks.parse().map_err(|_| bad("bad rank count"))?;
        let latency_ms: f64 = latency_ms.parse().map_err(|_| bad("bad latency"))?;

        Ok(Some(FeedbackSample {
            bucket: Bucket::new(coll, n_bytes, Topology::new(nodes, ranks)),
            latency_us: latency_ms * 1000.0,
        }))
    }
}

/// Result of one poll.
#[derive(Debug, Default)]
pub struct FeedBatch {
    pub samples: Vec<FeedbackSample>,
    /// Lines that were present but could not be parsed.
    pub malformed: usize,
}

/// Incremental reader over the feedback file.
#[derive(Debug)]
pub struct RewardFeed {
    path: PathBuf,
    offset: u64,
}

impl RewardFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the first unconsumed line.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read every complete line appended since the last poll.
    ///
    /// A missing file is not an error: the workload may not have started
    /// writing yet. The file is only opened when its length differs from
    /// the consumed offset.
    pub fn poll(&mut self) -> FeedBatch {
        let mut batch = FeedBatch::default();
        let len = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return batch,
            Err(e) => {
                warn!(%e, path = %self.path.display(), "cannot stat feedback file");
                return batch;
            }
        };
        if len == self.offset {
            return batch;
        }
        if len < self.offset {
            debug!(path = %self.path.display(), "feedback file truncated, rewinding");
            self.offset = 0;
        }

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                warn!(%e, path = %self.path.display(), "cannot open feedback file");
                return batch;
            }
        };
        if let Err(e) = self.read_from(file, &mut batch) {
            warn!(%e, path = %self.path.display(), "error reading feedback file");
        }
        batch
    }

    fn read_from(&mut self, file: File, batch: &mut FeedBatch) -> std::io::Result<()> {
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.offset))?;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 || line.last() != Some(&b'\n') {
                // Partial trailing line; retry on the next poll.
                break;
            }
            self.offset += read as u64;
            let Ok(text) = std::str::from_utf8(&line) else {
                batch.malformed += 1;
                warn!(offset = self.offset, "skipping non-UTF-8 feedback line");
                continue;
            };
            match FeedbackSample::parse_line(text) {
                Ok(Some(sample)) => batch.samples.push(sample),
                Ok(None) => {}
                Err(e) => {
                    batch.malformed += 1;
                    warn!(%e, "skipping feedback line");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_named_and_numeric_collectives() {
        let named = FeedbackSample::parse_line("allreduce,1048576,1,8,0.5\n")
            .unwrap()
            .unwrap();
        let numeric = FeedbackSample::parse_line("4,1048576,1,8,0.5")
            .unwrap()
            .unwrap();
        assert_eq!(named, numeric);
        assert_eq!(named.bucket.to_string(), "allreduce/1MB@1x8");
        assert!((named.latency_us - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        assert!(FeedbackSample::parse_line("# header").unwrap().is_none());
        assert!(FeedbackSample::parse_line("   \n").unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(FeedbackSample::parse_line("allreduce,1048576,1,8").is_err());
        assert!(FeedbackSample::parse_line("bogus,1,1,1,1.0").is_err());
        assert!(FeedbackSample::parse_line("99,1,1,1,1.0").is_err());
        assert!(FeedbackSample::parse_line("allreduce,lots,1,8,1.0").is_err());
    }

    #[test]
    fn test_poll_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut feed = RewardFeed::new(dir.path().join("absent.log"));
        let batch = feed.poll();
        assert!(batch.samples.is_empty());
        assert_eq!(feed.offset(), 0);
    }

    #[test]
    fn test_poll_is_incremental_and_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.log");
        let mut file = File::create(&path).unwrap();
        let mut feed = RewardFeed::new(&path);

        write!(file, "# collType,nBytes,nNodes,nRanks,latency_ms\nallreduce,1024,1,8,1.0\nallre").unwrap();
        file.flush().unwrap();
        assert_eq!(feed.poll().samples.len(), 1);

        write!(file, "duce,2048,1,8,2.0\n").unwrap();
        file.flush().unwrap();
        let batch = feed.poll();
        assert_eq!(batch.samples.len(), 1);
        assert!((batch.samples[0].latency_us - 2000.0).abs() < 1e-9);

        assert!(feed.poll().samples.is_empty());
    }

    #[test]
    fn test_poll_counts_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.log");
        std::fs::write(&path, "garbage\nallreduce,1024,1,8,1.0\n").unwrap();
        let batch = RewardFeed::new(&path).poll();
        assert_eq!(batch.samples.len(), 1);
        assert_eq!(batch.malformed, 1);
    }

    #[test]
    fn test_truncation_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.log");
        std::fs::write(&path, "allreduce,1024,1,8,1.0\nallreduce,1024,1,8,1.0\n").unwrap();
        let mut feed = RewardFeed::new(&path);
        assert_eq!(feed.poll().samples.len(), 2);

        std::fs::write(&path, "broadcast,64,1,2,0.1\n").unwrap();
        let batch = feed.poll();
        assert_eq!(batch.samples.len(), 1);
        assert_eq!(batch.samples[0].bucket.coll, CollType::Broadcast);
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.log");
        let mut bytes = b"allreduce,1024,1,8,1.0\n".to_vec();
        bytes.extend_from_slice(b"allreduce,1024,1,8,\xff\xfe\n");
        bytes.extend_from_slice(b"allreduce,2048,1,8,2.0\n");
        std::fs::write(&path, &bytes).unwrap();

        let mut feed = RewardFeed::new(&path);
        let batch = feed.poll();
        assert_eq!(batch.samples.len(), 2);
        assert_eq!(batch.malformed, 1);
        assert!((batch.samples[1].latency_us - 2000.0).abs() < 1e-9);
        assert_eq!(feed.offset(), bytes.len() as u64);

        // Later appends are still picked up.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "broadcast,64,1,2,0.1").unwrap();
        let batch = feed.poll();
        assert_eq!(batch.samples.len(), 1);
        assert_eq!(batch.malformed, 0);
    }

    #[test]
    fn test_unchanged_file_is_not_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.log");
        std::fs::write(&path, "allreduce,1024,1,8,1.0\nallre").unwrap();
        let mut feed = RewardFeed::new(&path);
        assert_eq!(feed.poll().samples.len(), 1);
        assert_eq!(feed.offset(), 23);

        // Partial tail keeps the length ahead of the offset; complete it.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "duce,2048,1,8,2.0\n").unwrap();
        assert_eq!(feed.poll().samples.len(), 1);
        let consumed = feed.offset();
        assert_eq!(consumed, std::fs::metadata(&path).unwrap().len());
        assert!(feed.poll().samples.is_empty());
        assert_eq!(feed.offset(), consumed);
    }
}
