//! Append-only write-ahead log.
//!
//! Records are length-prefixed binary frames carrying a monotonic
//! sequence, a wall-clock timestamp, the event topic and the payload
//! bytes, followed by a CRC32 over the frame body. A record counts as
//! durable once it has been flushed and fsync'd. Readers scan files
//! sequentially and truncate a corrupt tail back to the last valid
//! record.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use crc32fast::Hasher;
use tracing::{debug, warn};

use crate::{JournalError, JournalResult};

const FRAME_HEADER_LEN: usize = 4;
const FRAME_CRC_LEN: usize = 4;

/// One durable record recovered from or written to the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Settings controlling where segments live and when they rotate.
#[derive(Clone, Debug)]
pub struct WalWriterConfig {
    pub dir: PathBuf,
    /// Segment size that triggers rotation to a fresh file.
    pub rotate_bytes: u64,
}

impl WalWriterConfig {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            rotate_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Appender over the current log segment.
pub struct WalWriter {
    config: WalWriterConfig,
    file: File,
    segment_path: PathBuf,
    segment_index: u64,
    written: u64,
    next_sequence: u64,
}

impl WalWriter {
    /// Open the log directory, resuming the sequence after the last valid
    /// record found on disk.
    pub fn open(config: WalWriterConfig) -> JournalResult<Self> {
        fs::create_dir_all(&config.dir)?;
        let existing = segment_paths(&config.dir)?;
        let next_sequence = WalReader::replay_dir(&config.dir)?
            .last()
            .map(|record| record.sequence + 1)
            .unwrap_or(0);
        let segment_index = existing
            .last()
            .and_then(|path| segment_index_of(path))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        let segment_path = segment_file_path(&config.dir, segment_index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment_path)?;
        debug!(path = %segment_path.display(), next_sequence, "opened wal segment");
        Ok(Self {
            config,
            file,
            segment_path,
            segment_index,
            written: 0,
            next_sequence,
        })
    }

    /// Append one record and fsync it. Returns the durable record.
    ///
    /// Any write or sync failure (including a full disk) is surfaced to
    /// the caller; the record must not be considered durable.
    pub fn append(&mut self, topic: &str, payload: &[u8]) -> JournalResult<WalRecord> {
        let record = WalRecord {
            sequence: self.next_sequence,
            timestamp: Utc::now(),
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        let frame = encode_frame(&record);
        self.file.write_all(&frame)?;
        self.file.flush()?;
        self.file.sync_data()?;
        self.next_sequence += 1;
        self.written += frame.len() as u64;
        if self.written >= self.config.rotate_bytes {
            self.rotate()?;
        }
        Ok(record)
    }

    /// Path of the segment currently being appended to.
    #[must_use]
    pub fn segment_path(&self) -> &Path {
        &self.segment_path
    }

    fn rotate(&mut self) -> JournalResult<()> {
        self.segment_index += 1;
        self.segment_path = segment_file_path(&self.config.dir, self.segment_index);
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.segment_path)?;
        self.written = 0;
        debug!(path = %self.segment_path.display(), "rotated wal segment");
        Ok(())
    }
}

/// Sequential reader over log segments.
pub struct WalReader;

impl WalReader {
    /// Replay every record in a directory of segments, oldest first.
    ///
    /// A corrupt tail in any segment is truncated back to the last valid
    /// record before the scan continues. A sequence number that moves
    /// backwards across records is damage that cannot be repaired by
    /// truncation and is reported as corruption.
    pub fn replay_dir(dir: &Path) -> JournalResult<Vec<WalRecord>> {
        let mut records: Vec<WalRecord> = Vec::new();
        if !dir.exists() {
            return Ok(records);
        }
        for path in segment_paths(dir)? {
            for record in Self::replay_file(&path)? {
                if let Some(last) = records.last() {
                    if record.sequence <= last.sequence {
                        return Err(JournalError::Corrupt(format!(
                            "sequence regression in {}: {} after {}",
                            path.display(),
                            record.sequence,
                            last.sequence
                        )));
                    }
                }
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Replay one segment file, truncating a corrupt tail in place.
    pub fn replay_file(path: &Path) -> JournalResult<Vec<WalRecord>> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        let mut records = Vec::new();
        let mut offset = 0usize;
        loop {
            match decode_frame(&bytes[offset..]) {
                FrameOutcome::Record(record, consumed) => {
                    records.push(record);
                    offset += consumed;
                }
                FrameOutcome::End => break,
                FrameOutcome::Corrupt(reason) => {
                    warn!(
                        path = %path.display(),
                        offset,
                        reason,
                        "truncating corrupt wal tail"
                    );
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(offset as u64)?;
                    file.sync_data()?;
                    break;
                }
            }
        }
        Ok(records)
    }
}

enum FrameOutcome {
    Record(WalRecord, usize),
    End,
    Corrupt(&'static str),
}

fn encode_frame(record: &WalRecord) -> Vec<u8> {
    let topic = record.topic.as_bytes();
    let mut body =
        Vec::with_capacity(8 + 8 + 2 + topic.len() + record.payload.len());
    body.extend_from_slice(&record.sequence.to_le_bytes());
    body.extend_from_slice(&record.timestamp.timestamp_millis().to_le_bytes());
    body.extend_from_slice(&(topic.len() as u16).to_le_bytes());
    body.extend_from_slice(topic);
    body.extend_from_slice(&record.payload);

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len() + FRAME_CRC_LEN);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn decode_frame(bytes: &[u8]) -> FrameOutcome {
    if bytes.is_empty() {
        return FrameOutcome::End;
    }
    if bytes.len() < FRAME_HEADER_LEN {
        return FrameOutcome::Corrupt("truncated frame header");
    }
    let body_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let frame_len = FRAME_HEADER_LEN + body_len + FRAME_CRC_LEN;
    if bytes.len() < frame_len {
        return FrameOutcome::Corrupt("truncated frame body");
    }
    let body = &bytes[FRAME_HEADER_LEN..FRAME_HEADER_LEN + body_len];
    let crc_bytes = &bytes[FRAME_HEADER_LEN + body_len..frame_len];
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return FrameOutcome::Corrupt("crc mismatch");
    }
    if body.len() < 18 {
        return FrameOutcome::Corrupt("frame body too short");
    }
    let sequence = u64::from_le_bytes(body[0..8].try_into().unwrap());
    let ts_millis = i64::from_le_bytes(body[8..16].try_into().unwrap());
    let topic_len = u16::from_le_bytes(body[16..18].try_into().unwrap()) as usize;
    if body.len() < 18 + topic_len {
        return FrameOutcome::Corrupt("topic overruns frame");
    }
    let topic = match std::str::from_utf8(&body[18..18 + topic_len]) {
        Ok(topic) => topic.to_string(),
        Err(_) => return FrameOutcome::Corrupt("topic is not utf-8"),
    };
    let payload = body[18 + topic_len..].to_vec();
    let timestamp = match Utc.timestamp_millis_opt(ts_millis).single() {
        Some(ts) => ts,
        None => return FrameOutcome::Corrupt("timestamp out of range"),
    };
    FrameOutcome::Record(
        WalRecord {
            sequence,
            timestamp,
            topic,
            payload,
        },
        frame_len,
    )
}

fn segment_file_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("wal-{index:08}.log"))
}

fn segment_index_of(path: &Path) -> Option<u64> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.strip_prefix("wal-"))
        .and_then(|raw| raw.parse().ok())
}

fn segment_paths(dir: &Path) -> JournalResult<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| segment_index_of(path).is_some())
        .collect();
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn open_writer(dir: &TempDir) -> WalWriter {
        WalWriter::open(WalWriterConfig::new(dir.path())).unwrap()
    }

    #[test]
    fn append_then_replay_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut writer = open_writer(&dir);
        writer.append("risk:alert", b"{\"reason\":\"test\"}").unwrap();
        writer.append("system:error", b"{}").unwrap();

        let records = WalReader::replay_dir(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 0);
        assert_eq!(records[0].topic, "risk:alert");
        assert_eq!(records[1].sequence, 1);
    }

    #[test]
    fn sequence_resumes_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut writer = open_writer(&dir);
            writer.append("risk:alert", b"a").unwrap();
        }
        let mut writer = open_writer(&dir);
        let record = writer.append("risk:alert", b"b").unwrap();
        assert_eq!(record.sequence, 1);
        assert_eq!(WalReader::replay_dir(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn corrupt_tail_is_truncated_to_last_valid_record() {
        let dir = TempDir::new().unwrap();
        let segment = {
            let mut writer = open_writer(&dir);
            writer.append("risk:alert", b"good").unwrap();
            writer.segment_path().to_path_buf()
        };
        // Garbage after a valid frame simulates a torn write.
        let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(&[0xDE, 0xAD, 0xBE]).unwrap();
        drop(file);

        let records = WalReader::replay_file(&segment).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"good");
        // The tail was removed; a second replay sees a clean file.
        let records = WalReader::replay_file(&segment).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn rotation_starts_a_new_segment() {
        let dir = TempDir::new().unwrap();
        let mut config = WalWriterConfig::new(dir.path());
        config.rotate_bytes = 1;
        let mut writer = WalWriter::open(config).unwrap();
        let first = writer.segment_path().to_path_buf();
        writer.append("risk:alert", b"a").unwrap();
        assert_ne!(writer.segment_path(), first.as_path());
        writer.append("risk:alert", b"b").unwrap();
        assert_eq!(WalReader::replay_dir(dir.path()).unwrap().len(), 2);
    }
}
