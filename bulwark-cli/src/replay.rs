//! Reconstruct event bus history from the write-ahead log.

use std::path::Path;

use anyhow::{Context, Result};
use bulwark_core::Event;
use bulwark_journal::{WalReader, WalRecord};

/// Read every record under a WAL directory (or a single segment file).
pub fn load(path: &Path) -> Result<Vec<WalRecord>> {
    let records = if path.is_dir() {
        WalReader::replay_dir(path)
    } else {
        WalReader::replay_file(path)
    }
    .with_context(|| format!("failed to replay {}", path.display()))?;
    Ok(records)
}

/// Print the reconstructed history, one event per line.
pub fn print(records: &[WalRecord]) {
    for record in records {
        match serde_json::from_slice::<Event>(&record.payload) {
            Ok(event) => println!(
                "{:>8}  {}  {:<24} source={} payload={}",
                record.sequence,
                event.timestamp.to_rfc3339(),
                event.topic,
                event.source,
                event.payload
            ),
            Err(_) => println!(
                "{:>8}  {}  {:<24} {} raw byte(s)",
                record.sequence,
                record.timestamp.to_rfc3339(),
                record.topic,
                record.payload.len()
            ),
        }
    }
    println!("{} record(s)", records.len());
}
