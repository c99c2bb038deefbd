//! On-disk key-frame formats.
//!
//! The structured document is a JSON list of named tracks. The legacy layout
//! keeps one binary file per track: a little-endian `u32` key count followed
//! by 9-byte records of `i32` row, `f32` value and `u8` interpolation.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::{Interpolation, TrackKey};
use crate::{DemoSyncError, Result};

const LEGACY_EXTENSION: &str = "track";
const LEGACY_RECORD_LEN: usize = 9;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackDocument {
    #[serde(default)]
    pub tracks: Vec<DocumentTrack>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTrack {
    pub name: String,
    #[serde(default)]
    pub keys: Vec<TrackKey>,
}

impl TrackDocument {
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

/// `<directory>/<prefix>_<name>.track`
pub fn legacy_path(directory: &Path, prefix: &str, name: &str) -> PathBuf {
    directory.join(format!("{prefix}_{name}.{LEGACY_EXTENSION}"))
}

/// Track names and paths of every legacy file in `directory` carrying
/// `prefix`, sorted by name.
pub fn list_legacy(directory: &Path, prefix: &str) -> Result<Vec<(String, PathBuf)>> {
    if !directory.is_dir() {
        return Ok(Vec::new());
    }

    let stem_prefix = format!("{prefix}_");
    let mut found = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(LEGACY_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if let Some(name) = stem.strip_prefix(&stem_prefix).filter(|name| !name.is_empty()) {
            found.push((name.to_string(), path.clone()));
        }
    }
    found.sort();
    Ok(found)
}

pub fn read_legacy(path: &Path) -> Result<Vec<TrackKey>> {
    let bytes = fs::read(path)?;
    decode_legacy(&bytes).map_err(|reason| DemoSyncError::decode(path.display().to_string(), reason))
}

pub fn write_legacy(path: &Path, keys: &[TrackKey]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, encode_legacy(keys))?;
    Ok(())
}

fn encode_legacy(keys: &[TrackKey]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + keys.len() * LEGACY_RECORD_LEN);
    bytes.extend_from_slice(&(keys.len() as u32).to_le_bytes());
    for key in keys {
        bytes.extend_from_slice(&(key.row as i32).to_le_bytes());
        bytes.extend_from_slice(&key.value.to_le_bytes());
        bytes.push(key.interpolation.code());
    }
    bytes
}

fn decode_legacy(bytes: &[u8]) -> std::result::Result<Vec<TrackKey>, String> {
    let (count, records) = bytes
        .split_first_chunk::<4>()
        .ok_or_else(|| "missing key count".to_string())?;
    let count = u32::from_le_bytes(*count) as usize;
    if records.len() != count * LEGACY_RECORD_LEN {
        return Err(format!(
            "expected {count} keys ({} bytes), found {} bytes",
            count * LEGACY_RECORD_LEN,
            records.len()
        ));
    }

    records
        .chunks_exact(LEGACY_RECORD_LEN)
        .map(|record| {
            let row = i32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            let value = f32::from_le_bytes([record[4], record[5], record[6], record[7]]);
            let row = u32::try_from(row).map_err(|_| format!("negative row {row}"))?;
            let interpolation = Interpolation::from_code(record[8])
                .ok_or_else(|| format!("unknown interpolation {} at row {row}", record[8]))?;
            Ok(TrackKey {
                row,
                value,
                interpolation,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(row: u32, value: f32, interpolation: Interpolation) -> TrackKey {
        TrackKey {
            row,
            value,
            interpolation,
        }
    }

    #[test]
    fn legacy_layout_is_little_endian_records() {
        let bytes = encode_legacy(&[key(2, 1.0, Interpolation::Linear)]);
        assert_eq!(bytes, [1, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0x80, 0x3f, 1]);
    }

    #[test]
    fn legacy_file_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = legacy_path(dir.path(), "sync", "camera:x");
        let keys = vec![
            key(0, -1.5, Interpolation::Smooth),
            key(64, 3.0, Interpolation::Step),
        ];
        write_legacy(&path, &keys).unwrap();
        assert_eq!(read_legacy(&path).unwrap(), keys);
        assert!(path.ends_with("sync_camera:x.track"));
    }

    #[test]
    fn truncated_legacy_file_is_rejected() {
        let mut bytes = encode_legacy(&[key(1, 1.0, Interpolation::Ramp)]);
        bytes.pop();
        assert!(decode_legacy(&bytes).unwrap_err().contains("expected 1 keys"));
        assert!(decode_legacy(&[]).is_err());
    }

    #[test]
    fn lists_only_prefixed_track_files() {
        let dir = tempfile::tempdir().unwrap();
        for file in ["sync_b.track", "sync_a.track", "other_c.track", "sync_d.txt"] {
            fs::write(dir.path().join(file), encode_legacy(&[])).unwrap();
        }
        let names: Vec<_> = list_legacy(dir.path(), "sync")
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, ["a", "b"]);
        assert!(list_legacy(&dir.path().join("missing"), "sync").unwrap().is_empty());
    }

    #[test]
    fn document_uses_lowercase_interpolation_names() {
        let doc: TrackDocument = serde_json::from_str(
            r#"{"tracks":[{"name":"fade","keys":[{"row":0,"value":0.0,"interpolation":"linear"},{"row":16,"value":1.0}]}]}"#,
        )
        .unwrap();
        assert_eq!(doc.tracks[0].keys[0].interpolation, Interpolation::Linear);
        assert_eq!(doc.tracks[0].keys[1].interpolation, Interpolation::Step);
    }
}
