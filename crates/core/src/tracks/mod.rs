//! Named key-frame tracks evaluated at fractional rows.

mod persist;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

pub use persist::{DocumentTrack, TrackDocument};

use crate::{config::SyncConfig, config::DEFAULT_ROWS_PER_BEAT, Result};

/// Curve applied from a key towards the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Hold the value until the next key.
    #[default]
    Step,
    Linear,
    /// Smooth-step, `t * t * (3 - 2t)`.
    Smooth,
    /// Quadratic ease-in, `t * t`.
    Ramp,
}

impl Interpolation {
    pub fn code(self) -> u8 {
        match self {
            Interpolation::Step => 0,
            Interpolation::Linear => 1,
            Interpolation::Smooth => 2,
            Interpolation::Ramp => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Interpolation::Step),
            1 => Some(Interpolation::Linear),
            2 => Some(Interpolation::Smooth),
            3 => Some(Interpolation::Ramp),
            _ => None,
        }
    }

    fn weight(self, t: f64) -> f64 {
        match self {
            Interpolation::Step => 0.0,
            Interpolation::Linear => t,
            Interpolation::Smooth => t * t * (3.0 - 2.0 * t),
            Interpolation::Ramp => t * t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackKey {
    pub row: u32,
    pub value: f32,
    #[serde(default)]
    pub interpolation: Interpolation,
}

/// Keys sorted by row, at most one per row.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyframeTrack {
    name: String,
    keys: Vec<TrackKey>,
    /// Keys were changed through the live session since the last load.
    edited: bool,
}

impl KeyframeTrack {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            edited: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &[TrackKey] {
        &self.keys
    }

    pub fn is_edited(&self) -> bool {
        self.edited
    }

    /// Inserts `key`, replacing any key on the same row.
    pub fn set_key(&mut self, key: TrackKey) {
        match self.keys.binary_search_by_key(&key.row, |existing| existing.row) {
            Ok(index) => self.keys[index] = key,
            Err(index) => self.keys.insert(index, key),
        }
    }

    /// Removes the key on `row`, returning whether one existed.
    pub fn delete_key(&mut self, row: u32) -> bool {
        match self.keys.binary_search_by_key(&row, |existing| existing.row) {
            Ok(index) => {
                self.keys.remove(index);
                true
            }
            Err(_) => false,
        }
    }

    fn replace_keys(&mut self, keys: impl IntoIterator<Item = TrackKey>) {
        self.keys.clear();
        for key in keys {
            self.set_key(key);
        }
    }

    /// Value at `row`. Rows outside the keyed range take the nearest
    /// endpoint value; a track without keys evaluates to zero.
    pub fn value(&self, row: f64) -> f64 {
        let after = self.keys.partition_point(|key| key.row as f64 <= row);
        let (Some(first), Some(last)) = (self.keys.first(), self.keys.last()) else {
            return 0.0;
        };
        if after == 0 {
            return first.value as f64;
        }
        if after == self.keys.len() {
            return last.value as f64;
        }

        let from = &self.keys[after - 1];
        let to = &self.keys[after];
        let t = (row - from.row as f64) / (to.row - from.row) as f64;
        let start = from.value as f64;
        start + (to.value as f64 - start) * from.interpolation.weight(t)
    }
}

/// Where the last successful load came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Document,
    Legacy,
    Empty,
}

/// Where [`KeyframeTrackStore::save`] wrote to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveTarget {
    Legacy(PathBuf),
    Document(PathBuf),
}

/// All tracks of a production, addressed by name or by creation index.
#[derive(Debug)]
pub struct KeyframeTrackStore {
    tracks: Vec<KeyframeTrack>,
    by_name: HashMap<String, usize>,
    announced: usize,
    rows_per_beat: f64,
    directory: PathBuf,
    prefix: String,
    document: PathBuf,
    had_legacy: bool,
}

impl KeyframeTrackStore {
    /// Creates an empty store persisting under `config.directory`.
    pub fn new(config: &SyncConfig) -> Self {
        let mut store = Self {
            tracks: Vec::new(),
            by_name: HashMap::new(),
            announced: 0,
            rows_per_beat: DEFAULT_ROWS_PER_BEAT,
            directory: config.directory.clone(),
            prefix: config.prefix.clone(),
            document: config.document_path(),
            had_legacy: false,
        };
        store.set_rows_per_beat(config.rows_per_beat);
        store
    }

    /// Creates a store and loads whatever tracks exist on disk.
    pub fn load(config: &SyncConfig) -> Result<Self> {
        let mut store = Self::new(config);
        store.load_from_disk(false)?;
        Ok(store)
    }

    pub fn rows_per_beat(&self) -> f64 {
        self.rows_per_beat
    }

    /// Sets rows per beat. Non-positive or non-finite values fall back to the
    /// default.
    pub fn set_rows_per_beat(&mut self, rows_per_beat: f64) {
        if rows_per_beat.is_finite() && rows_per_beat > 0.0 {
            self.rows_per_beat = rows_per_beat;
        } else {
            tracing::warn!(
                rows_per_beat,
                fallback = DEFAULT_ROWS_PER_BEAT,
                "invalid rows per beat, using default"
            );
            self.rows_per_beat = DEFAULT_ROWS_PER_BEAT;
        }
    }

    /// Row addressed by a position in beats.
    pub fn row_at_beats(&self, beats: f64) -> f64 {
        beats * self.rows_per_beat
    }

    pub fn document_path(&self) -> &Path {
        &self.document
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[KeyframeTrack] {
        &self.tracks
    }

    pub fn track(&self, name: &str) -> Option<&KeyframeTrack> {
        self.index_of(name).map(|index| &self.tracks[index])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Index of `name`, creating an empty track on first reference.
    pub fn get_or_create(&mut self, name: &str) -> usize {
        if let Some(index) = self.index_of(name) {
            return index;
        }
        let index = self.tracks.len();
        self.tracks.push(KeyframeTrack::new(name));
        self.by_name.insert(name.to_string(), index);
        tracing::trace!(track = name, index, "track created");
        index
    }

    /// Value of `name` at `row`, creating the track when it is new.
    pub fn evaluate(&mut self, name: &str, row: f64) -> f64 {
        let index = self.get_or_create(name);
        self.tracks[index].value(row)
    }

    /// Value of `name` at `row` without creating anything.
    pub fn value(&self, name: &str, row: f64) -> Option<f64> {
        self.track(name).map(|track| track.value(row))
    }

    /// Applies an edit to the track at `index`. Returns `false` for unknown
    /// indices.
    pub fn set_key(&mut self, index: usize, key: TrackKey) -> bool {
        let Some(track) = self.tracks.get_mut(index) else {
            return false;
        };
        track.set_key(key);
        track.edited = true;
        true
    }

    pub fn delete_key(&mut self, index: usize, row: u32) -> bool {
        let Some(track) = self.tracks.get_mut(index) else {
            return false;
        };
        track.edited = true;
        track.delete_key(row)
    }

    /// Tracks referenced since the last call, with their indices.
    pub fn take_unannounced(&mut self) -> Vec<(usize, String)> {
        let fresh = self.tracks[self.announced..]
            .iter()
            .enumerate()
            .map(|(offset, track)| (self.announced + offset, track.name.clone()))
            .collect();
        self.announced = self.tracks.len();
        fresh
    }

    /// Queues every known track again, as needed after a new connection.
    pub fn reset_announcements(&mut self) {
        self.announced = 0;
    }

    /// Loads the structured document, or the legacy files when no document
    /// exists. With `editor` set, document tracks are only created; their
    /// keys are expected from the live session.
    pub fn load_from_disk(&mut self, editor: bool) -> Result<TrackSource> {
        let legacy = persist::list_legacy(&self.directory, &self.prefix)?;
        self.had_legacy |= !legacy.is_empty();

        if self.document.is_file() {
            match TrackDocument::read(&self.document) {
                Ok(document) => {
                    for (name, _) in &legacy {
                        tracing::trace!(track = %name, "legacy track skipped, document in use");
                    }
                    let loaded = self.apply_document(document, editor);
                    tracing::info!(path = %self.document.display(), tracks = loaded, "loaded key-frame document");
                    return Ok(TrackSource::Document);
                }
                Err(err) => {
                    tracing::error!(path = %self.document.display(), %err, "could not load key-frame document");
                }
            }
        }

        if legacy.is_empty() {
            tracing::debug!(directory = %self.directory.display(), "no key-frame tracks on disk");
            return Ok(TrackSource::Empty);
        }
        for (name, path) in &legacy {
            let keys = persist::read_legacy(path)?;
            let index = self.get_or_create(name);
            self.tracks[index].replace_keys(keys);
        }
        tracing::info!(directory = %self.directory.display(), tracks = legacy.len(), "loaded legacy tracks");
        Ok(TrackSource::Legacy)
    }

    fn apply_document(&mut self, document: TrackDocument, editor: bool) -> usize {
        let mut loaded = 0;
        for entry in document.tracks {
            if editor {
                self.get_or_create(&entry.name);
                continue;
            }
            if self.contains(&entry.name) || entry.keys.is_empty() {
                continue;
            }
            let index = self.get_or_create(&entry.name);
            self.tracks[index].replace_keys(entry.keys);
            loaded += 1;
        }
        loaded
    }

    /// Re-reads the tracks on disk. Tracks edited through the live session
    /// keep their in-memory keys; indices never change.
    pub fn reload_from_disk(&mut self) -> Result<TrackSource> {
        let mut fresh = Self {
            tracks: Vec::new(),
            by_name: HashMap::new(),
            announced: 0,
            rows_per_beat: self.rows_per_beat,
            directory: self.directory.clone(),
            prefix: self.prefix.clone(),
            document: self.document.clone(),
            had_legacy: false,
        };
        let source = fresh.load_from_disk(false)?;
        self.had_legacy |= fresh.had_legacy;

        let mut kept = 0;
        for track in fresh.tracks {
            let index = self.get_or_create(&track.name);
            let current = &mut self.tracks[index];
            if current.edited {
                kept += 1;
            } else {
                current.keys = track.keys;
            }
        }
        tracing::info!(tracks = self.tracks.len(), kept_edits = kept, "tracks reloaded from disk");
        Ok(source)
    }

    /// Persists every track. Productions that ever had legacy track files
    /// keep that layout; all others write the structured document.
    pub fn save(&self) -> Result<SaveTarget> {
        if self.had_legacy {
            self.write_legacy()?;
            tracing::info!(directory = %self.directory.display(), tracks = self.tracks.len(), "saved legacy tracks");
            Ok(SaveTarget::Legacy(self.directory.clone()))
        } else {
            self.write_document(&self.document)?;
            Ok(SaveTarget::Document(self.document.clone()))
        }
    }

    /// Writes one legacy file per track.
    pub fn write_legacy(&self) -> Result<()> {
        let mut failed = 0;
        for track in &self.tracks {
            let path = persist::legacy_path(&self.directory, &self.prefix, &track.name);
            if let Err(err) = persist::write_legacy(&path, &track.keys) {
                tracing::error!(path = %path.display(), %err, "could not save track");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(format!("{failed} track file(s) could not be saved").into());
        }
        Ok(())
    }

    pub fn to_document(&self) -> TrackDocument {
        TrackDocument {
            tracks: self
                .tracks
                .iter()
                .map(|track| DocumentTrack {
                    name: track.name.clone(),
                    keys: track.keys.clone(),
                })
                .collect(),
        }
    }

    /// Writes every track as a structured document at `path`.
    pub fn write_document(&self, path: &Path) -> Result<()> {
        self.to_document().write(path)?;
        tracing::info!(path = %path.display(), tracks = self.tracks.len(), "saved key-frame document");
        Ok(())
    }
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

    fn sync_config(dir: &Path) -> SyncConfig {
        SyncConfig {
            directory: dir.to_path_buf(),
            ..SyncConfig::default()
        }
    }

    fn track(keys: &[TrackKey]) -> KeyframeTrack {
        let mut track = KeyframeTrack::new("t");
        for key in keys {
            track.set_key(*key);
        }
        track
    }

    #[test]
    fn fade_scenario_hits_half_way() {
        let fade = track(&[
            key(0, 0.0, Interpolation::Linear),
            key(16, 1.0, Interpolation::Linear),
        ]);
        // 120 bpm, 4 rows per beat: one second is eight rows.
        let beats = 1.0 * 120.0 / 60.0;
        assert_eq!(fade.value(beats * 4.0), 0.5);
    }

    #[test]
    fn exact_key_rows_return_key_values() {
        for interpolation in [
            Interpolation::Step,
            Interpolation::Linear,
            Interpolation::Smooth,
            Interpolation::Ramp,
        ] {
            let track = track(&[
                key(2, 0.3, interpolation),
                key(7, -4.25, interpolation),
                key(11, 9.5, interpolation),
            ]);
            assert_eq!(track.value(2.0), 0.3_f32 as f64);
            assert_eq!(track.value(7.0), -4.25);
            assert_eq!(track.value(11.0), 9.5);
        }
    }

    #[test]
    fn extrapolation_is_flat() {
        let track = track(&[
            key(4, 2.0, Interpolation::Linear),
            key(8, 6.0, Interpolation::Linear),
        ]);
        assert_eq!(track.value(-3.0), 2.0);
        assert_eq!(track.value(3.99), 2.0);
        assert_eq!(track.value(8.5), 6.0);
        assert_eq!(track.value(1e9), 6.0);
        assert_eq!(KeyframeTrack::new("empty").value(3.0), 0.0);
    }

    #[test]
    fn interpolation_curves() {
        let value_at = |interpolation| {
            track(&[key(0, 0.0, interpolation), key(4, 1.0, interpolation)]).value(1.0)
        };
        assert_eq!(value_at(Interpolation::Step), 0.0);
        assert_eq!(value_at(Interpolation::Linear), 0.25);
        assert_eq!(value_at(Interpolation::Smooth), 0.15625);
        assert_eq!(value_at(Interpolation::Ramp), 0.0625);
    }

    #[test]
    fn keys_stay_sorted_and_unique() {
        let mut track = track(&[
            key(8, 1.0, Interpolation::Step),
            key(2, 2.0, Interpolation::Step),
            key(5, 3.0, Interpolation::Step),
            key(2, 4.0, Interpolation::Linear),
        ]);
        let rows: Vec<_> = track.keys().iter().map(|key| key.row).collect();
        assert_eq!(rows, [2, 5, 8]);
        assert_eq!(track.keys()[0].value, 4.0);

        assert!(track.delete_key(5));
        assert!(!track.delete_key(5));
        assert_eq!(track.keys().len(), 2);
    }

    #[test]
    fn evaluate_creates_tracks_and_queues_them_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyframeTrackStore::new(&sync_config(dir.path()));
        assert_eq!(store.value("camera:x", 0.0), None);
        assert_eq!(store.evaluate("camera:x", 3.0), 0.0);
        store.evaluate("camera:y", 3.0);
        store.evaluate("camera:x", 4.0);

        assert_eq!(
            store.take_unannounced(),
            [(0, "camera:x".to_string()), (1, "camera:y".to_string())]
        );
        assert!(store.take_unannounced().is_empty());
        store.evaluate("fade", 0.0);
        assert_eq!(store.take_unannounced(), [(2, "fade".to_string())]);

        store.reset_announcements();
        assert_eq!(store.take_unannounced().len(), 3);
    }

    #[test]
    fn invalid_rows_per_beat_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyframeTrackStore::new(&sync_config(dir.path()));
        store.set_rows_per_beat(4.0);
        assert_eq!(store.row_at_beats(2.0), 8.0);
        store.set_rows_per_beat(0.0);
        assert_eq!(store.rows_per_beat(), DEFAULT_ROWS_PER_BEAT);
        store.set_rows_per_beat(f64::NAN);
        assert_eq!(store.rows_per_beat(), DEFAULT_ROWS_PER_BEAT);
    }

    #[test]
    fn document_wins_over_legacy_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = sync_config(dir.path());
        persist::write_legacy(
            &persist::legacy_path(dir.path(), "sync", "legacy"),
            &[key(0, 7.0, Interpolation::Step)],
        )
        .unwrap();
        TrackDocument {
            tracks: vec![
                DocumentTrack {
                    name: "fade".into(),
                    keys: vec![key(16, 1.0, Interpolation::Linear), key(0, 0.0, Interpolation::Linear)],
                },
                DocumentTrack {
                    name: "unused".into(),
                    keys: Vec::new(),
                },
            ],
        }
        .write(&config.document_path())
        .unwrap();

        let store = KeyframeTrackStore::load(&config).unwrap();
        assert!(!store.contains("legacy"));
        assert!(!store.contains("unused"));
        assert_eq!(store.value("fade", 8.0), Some(0.5));
    }

    #[test]
    fn editor_mode_creates_document_tracks_without_keys() {
        let dir = tempfile::tempdir().unwrap();
        let config = sync_config(dir.path());
        TrackDocument {
            tracks: vec![DocumentTrack {
                name: "fade".into(),
                keys: vec![key(0, 1.0, Interpolation::Step)],
            }],
        }
        .write(&config.document_path())
        .unwrap();

        let mut store = KeyframeTrackStore::new(&config);
        assert_eq!(store.load_from_disk(true).unwrap(), TrackSource::Document);
        assert!(store.track("fade").unwrap().keys().is_empty());
    }

    #[test]
    fn legacy_files_load_when_no_document_exists() {
        let dir = tempfile::tempdir().unwrap();
        let config = sync_config(dir.path());
        persist::write_legacy(
            &persist::legacy_path(dir.path(), "sync", "pulse"),
            &[key(0, 1.0, Interpolation::Linear), key(10, 3.0, Interpolation::Step)],
        )
        .unwrap();

        let mut store = KeyframeTrackStore::new(&config);
        assert_eq!(store.load_from_disk(false).unwrap(), TrackSource::Legacy);
        assert_eq!(store.value("pulse", 5.0), Some(2.0));
    }

    #[test]
    fn save_keeps_legacy_layout_when_it_existed() {
        let dir = tempfile::tempdir().unwrap();
        let config = sync_config(dir.path());
        persist::write_legacy(
            &persist::legacy_path(dir.path(), "sync", "pulse"),
            &[key(0, 1.0, Interpolation::Step)],
        )
        .unwrap();
        TrackDocument::default().write(&config.document_path()).unwrap();

        let mut store = KeyframeTrackStore::load(&config).unwrap();
        let index = store.get_or_create("pulse");
        store.set_key(index, key(4, 2.0, Interpolation::Step));
        assert_eq!(store.save().unwrap(), SaveTarget::Legacy(dir.path().to_path_buf()));

        let keys = persist::read_legacy(&persist::legacy_path(dir.path(), "sync", "pulse")).unwrap();
        assert_eq!(keys, [key(4, 2.0, Interpolation::Step)]);
    }

    #[test]
    fn save_writes_document_for_new_productions() {
        let dir = tempfile::tempdir().unwrap();
        let config = sync_config(dir.path());
        let mut store = KeyframeTrackStore::load(&config).unwrap();
        let index = store.get_or_create("fade");
        store.set_key(index, key(0, 0.5, Interpolation::Ramp));

        assert_eq!(store.save().unwrap(), SaveTarget::Document(config.document_path()));
        let reloaded = KeyframeTrackStore::load(&config).unwrap();
        assert_eq!(reloaded.track("fade").unwrap().keys(), store.track("fade").unwrap().keys());
    }

    #[test]
    fn reload_keeps_edited_tracks_and_indices() {
        let dir = tempfile::tempdir().unwrap();
        let config = sync_config(dir.path());
        let pulse = persist::legacy_path(dir.path(), "sync", "pulse");
        let glow = persist::legacy_path(dir.path(), "sync", "glow");
        persist::write_legacy(&pulse, &[key(0, 1.0, Interpolation::Step)]).unwrap();
        persist::write_legacy(&glow, &[key(0, 1.0, Interpolation::Step)]).unwrap();

        let mut store = KeyframeTrackStore::load(&config).unwrap();
        let live = store.get_or_create("live");
        store.set_key(live, key(0, 9.0, Interpolation::Step));
        let glow_index = store.index_of("glow").unwrap();
        store.set_key(glow_index, key(0, 5.0, Interpolation::Step));

        persist::write_legacy(&pulse, &[key(0, 2.0, Interpolation::Step)]).unwrap();
        persist::write_legacy(&glow, &[key(0, 3.0, Interpolation::Step)]).unwrap();
        store.reload_from_disk().unwrap();

        assert_eq!(store.value("pulse", 0.0), Some(2.0));
        assert_eq!(store.value("glow", 0.0), Some(5.0));
        assert_eq!(store.value("live", 0.0), Some(9.0));
        assert_eq!(store.index_of("live"), Some(live));
    }
}
