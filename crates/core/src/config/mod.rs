use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{DemoSyncError, Result};

pub const DEFAULT_BEATS_PER_MINUTE: f64 = 100.0;
pub const DEFAULT_ROWS_PER_BEAT: f64 = 8.0;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub demo: DemoConfig,
    pub audio: AudioConfig,
    pub fft: FftConfig,
    pub sync: SyncConfig,
    /// Authoring mode: keeps the spectrum seek log and allows the live sync
    /// session to connect.
    pub tool: bool,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing fields fall back to their
    /// defaults; the result is validated before it is returned.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&text)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Authoring defaults: tool mode with spectrum capture enabled.
    pub fn tool_defaults() -> Self {
        Self {
            tool: true,
            fft: FftConfig {
                enable: true,
                ..FftConfig::default()
            },
            ..Self::default()
        }
    }

    /// Checks the values that cannot be repaired silently at startup.
    pub fn validate(&self) -> Result<()> {
        if !(self.demo.beats_per_minute > 0.0) {
            return Err(DemoSyncError::config(format!(
                "beats_per_minute must be positive, got {}",
                self.demo.beats_per_minute
            )));
        }
        if !(self.sync.rows_per_beat > 0.0) {
            return Err(DemoSyncError::config(format!(
                "rows_per_beat must be positive, got {}",
                self.sync.rows_per_beat
            )));
        }
        if self.audio.samples == 0 || !self.audio.samples.is_power_of_two() {
            return Err(DemoSyncError::config(format!(
                "audio samples must be a power of two, got {}",
                self.audio.samples
            )));
        }
        if !(0.0..=1.0).contains(&self.audio.mix_volume) {
            return Err(DemoSyncError::config(format!(
                "mix_volume must lie in [0, 1], got {}",
                self.audio.mix_volume
            )));
        }
        if !(0.0..=1.0).contains(&self.audio.capture_mix_volume) {
            return Err(DemoSyncError::config(format!(
                "capture_mix_volume must lie in [0, 1], got {}",
                self.audio.capture_mix_volume
            )));
        }
        self.fft.validate(self.audio.samples)
    }
}

/// Timing and song settings of the production being played.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub beats_per_minute: f64,
    /// Total length in seconds. `None` uses the song length when one plays.
    pub length_seconds: Option<f64>,
    pub song_loop: bool,
    pub start_position: f64,
    pub song: Option<PathBuf>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            beats_per_minute: DEFAULT_BEATS_PER_MINUTE,
            length_seconds: None,
            song_loop: false,
            start_position: 0.0,
            song: None,
        }
    }
}

/// Which audio backend the source opens at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Hardware when available, headless otherwise.
    #[default]
    Auto,
    Cpal,
    Headless,
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Frames per device callback. Also the FFT window length.
    pub samples: usize,
    /// Synchronize the clock to the audio position while a song plays.
    pub time_source: bool,
    pub mute: bool,
    pub mix_volume: f32,
    pub backend: BackendKind,
    /// Output device name. `None` opens the host's default device.
    pub device: Option<String>,
    /// Mix the default input device into the output (and the spectrum).
    pub capture: bool,
    pub capture_mix_volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            samples: 4096,
            time_source: true,
            mute: false,
            mix_volume: 1.0,
            backend: BackendKind::Auto,
            device: None,
            capture: false,
            capture_mix_volume: 1.0,
        }
    }
}

/// Spectrum capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FftConfig {
    pub enable: bool,
    /// Magnitude bins kept per row.
    pub size: usize,
    /// Rows kept in the ring buffer.
    pub history: usize,
    pub divisor: f32,
    pub clip_min: f32,
    pub clip_max: f32,
}

impl Default for FftConfig {
    fn default() -> Self {
        Self {
            enable: false,
            size: 256,
            history: 16,
            divisor: 25.0,
            clip_min: 0.0,
            clip_max: 1.0,
        }
    }
}

impl FftConfig {
    fn validate(&self, window: usize) -> Result<()> {
        if self.size == 0 || self.size > window {
            return Err(DemoSyncError::config(format!(
                "fft size must be in 1..={window}, got {}",
                self.size
            )));
        }
        if self.history == 0 {
            return Err(DemoSyncError::config("fft history must hold at least one row"));
        }
        if !(self.divisor > 0.0) {
            return Err(DemoSyncError::config("fft divisor must be positive"));
        }
        if self.clip_min > self.clip_max {
            return Err(DemoSyncError::config(format!(
                "fft clip range is empty: [{}, {}]",
                self.clip_min, self.clip_max
            )));
        }
        Ok(())
    }
}

/// Key-frame storage and live editor connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub directory: PathBuf,
    /// File name prefix of the legacy per-track files.
    pub prefix: String,
    /// File name of the structured key-frame document inside `directory`.
    pub document: String,
    pub rows_per_beat: f64,
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("sync"),
            prefix: "sync".to_string(),
            document: "sync.json".to_string(),
            rows_per_beat: DEFAULT_ROWS_PER_BEAT,
            host: "localhost".to_string(),
            port: 1338,
            connect_timeout_ms: 2000,
        }
    }
}

impl SyncConfig {
    pub fn document_path(&self) -> PathBuf {
        self.directory.join(&self.document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().unwrap();
        AppConfig::tool_defaults().validate().unwrap();
    }

    #[test]
    fn rejects_non_positive_tempo() {
        let mut config = AppConfig::default();
        config.demo.beats_per_minute = 0.0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DemoSyncError::Configuration(_)));
    }

    #[test]
    fn rejects_invalid_rows_per_beat_and_window() {
        let mut config = AppConfig::default();
        config.sync.rows_per_beat = -1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.samples = 1000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.fft.size = 8192;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.capture_mix_volume = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_partial_json_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.json");
        std::fs::write(
            &path,
            r#"{ "demo": { "beats_per_minute": 120.0 }, "audio": { "backend": "headless", "device": "USB DAC" }, "tool": true }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.demo.beats_per_minute, 120.0);
        assert_eq!(config.audio.backend, BackendKind::Headless);
        assert_eq!(config.audio.samples, 4096);
        assert_eq!(config.audio.device.as_deref(), Some("USB DAC"));
        assert!(!config.audio.capture);
        assert_eq!(config.sync.port, 1338);
        assert!(config.tool);
    }
}
