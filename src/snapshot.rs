use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const FORMAT_VERSION: &str = "1.0";

// ── On-disk shape ─────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct Metadata {
    version: String,
    /// ISO-8601 UTC, second precision, `Z` suffix.
    timestamp: String,
    key_count: usize,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    metadata: Metadata,
    data: BTreeMap<String, String>,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

// ── Writer / reader ───────────────────────────────────────────────────────────

/// Serialize a point-in-time keyspace image to `path`.
///
/// The image is written to `<path>.tmp`, flushed and synced, then renamed
/// over `path` so a partial file is never visible under the canonical name.
/// On failure the temp file is removed and the previous snapshot survives.
pub fn save(entries: &HashMap<String, String>, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    if let Err(e) = write_snapshot(entries, &tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn write_snapshot(entries: &HashMap<String, String>, tmp: &Path) -> io::Result<()> {
    let snapshot = SnapshotFile {
        metadata: Metadata {
            version: FORMAT_VERSION.to_string(),
            timestamp: jiff::Timestamp::now()
                .strftime("%Y-%m-%dT%H:%M:%SZ")
                .to_string(),
            key_count: entries.len(),
        },
        data: entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    let file = File::create(tmp)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &snapshot)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Load a snapshot back into a key → value map.
///
/// Returns `Err` with `ErrorKind::NotFound` when no snapshot exists, which
/// callers use to distinguish "first run" from genuine I/O errors.
pub fn load(path: &Path) -> io::Result<HashMap<String, String>> {
    let file = File::open(path)?;
    let snapshot: SnapshotFile = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if snapshot.metadata.key_count != snapshot.data.len() {
        warn!(
            declared = snapshot.metadata.key_count,
            actual = snapshot.data.len(),
            "snapshot key_count does not match data section"
        );
    }
    Ok(snapshot.data.into_iter().collect())
}
