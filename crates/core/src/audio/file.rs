use std::{io::Cursor, path::Path, sync::Arc};

use crate::{DemoSyncError, Result};

/// Fully decoded song held in memory as interleaved `f32` PCM.
#[derive(Clone)]
pub struct AudioFile {
    name: String,
    sample_rate: u32,
    channels: u16,
    samples: Arc<[f32]>,
    duration: Option<f64>,
}

impl AudioFile {
    /// Reads and decodes a WAV file from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|err| DemoSyncError::decode(path.display().to_string(), err))?;
        Self::decode(path.display().to_string(), &bytes)
    }

    /// Decodes WAV bytes. Integer PCM is scaled to `[-1, 1]`.
    pub fn decode(name: impl Into<String>, bytes: &[u8]) -> Result<Self> {
        let name = name.into();
        let mut reader =
            hound::WavReader::new(Cursor::new(bytes)).map_err(|err| DemoSyncError::decode(&name, err))?;
        let spec = reader.spec();

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|err| DemoSyncError::decode(&name, err))?,
            hound::SampleFormat::Int => {
                let max_value = (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|sample| sample.map(|value| value as f32 / max_value))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|err| DemoSyncError::decode(&name, err))?
            }
        };

        Self::from_samples(name, spec.sample_rate, spec.channels, samples)
    }

    /// Wraps already decoded interleaved samples.
    pub fn from_samples(
        name: impl Into<String>,
        sample_rate: u32,
        channels: u16,
        samples: Vec<f32>,
    ) -> Result<Self> {
        let name = name.into();
        if sample_rate == 0 || channels == 0 {
            return Err(DemoSyncError::decode(
                name,
                format!("unsupported format: {sample_rate} Hz, {channels} channels"),
            ));
        }
        if samples.is_empty() {
            return Err(DemoSyncError::decode(name, "no audio samples"));
        }
        if samples.len() % channels as usize != 0 {
            return Err(DemoSyncError::decode(name, "truncated final frame"));
        }

        Ok(Self {
            name,
            sample_rate,
            channels,
            samples: samples.into(),
            duration: None,
        })
    }

    /// Stops playback after `duration` seconds instead of at the end of the
    /// decoded data.
    pub fn with_duration(mut self, duration: Option<f64>) -> Self {
        self.duration = duration.filter(|seconds| *seconds >= 0.0);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// Length of the decoded data in seconds.
    pub fn total_seconds(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

impl std::fmt::Debug for AudioFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFile")
            .field("name", &self.name)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("frames", &self.frames())
            .field("duration", &self.duration)
            .finish()
    }
}
