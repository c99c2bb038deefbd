use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{traits::Producer, HeapProd};

use super::{AudioBackend, AudioCallback, StreamFormat};
use crate::{DemoSyncError, Result};

/// Hardware output through the platform's default cpal host.
#[derive(Default)]
pub struct CpalBackend {
    /// Output device name; `None` opens the host default.
    device: Option<String>,
    stream: Option<cpal::Stream>,
    input: Option<cpal::Stream>,
    playing: bool,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(device: Option<String>) -> Self {
        Self {
            device: device.filter(|name| !name.is_empty()),
            ..Self::default()
        }
    }

    fn output_device(&self, host: &cpal::Host) -> Result<cpal::Device> {
        let Some(wanted) = self.device.as_deref() else {
            return host
                .default_output_device()
                .ok_or_else(|| DemoSyncError::DeviceUnavailable("no default output device".into()));
        };
        let devices = host
            .output_devices()
            .map_err(|err| DemoSyncError::DeviceUnavailable(err.to_string()))?;
        for device in devices {
            let name = device.name().unwrap_or_default();
            tracing::trace!(device = %name, "found output device");
            if name == wanted {
                return Ok(device);
            }
        }
        Err(DemoSyncError::DeviceUnavailable(format!(
            "no output device named {wanted:?}"
        )))
    }

    fn build(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        callback: AudioCallback,
    ) -> std::result::Result<cpal::Stream, cpal::BuildStreamError> {
        let mut callback = callback;
        device.build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| callback.process(data),
            |err| tracing::error!(%err, "audio stream error"),
            None,
        )
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn open(&mut self, requested: StreamFormat, callback: AudioCallback) -> Result<StreamFormat> {
        self.close();

        let host = cpal::default_host();
        let device = self.output_device(&host)?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        tracing::debug!(host = ?host.id(), device = %device_name, "opening audio device");

        let mut config = cpal::StreamConfig {
            channels: requested.channels,
            sample_rate: cpal::SampleRate(requested.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(requested.buffer_frames as u32),
        };

        // Devices that refuse a fixed buffer size run at their own cadence.
        // The callback is only built once, so probe support before handing it over.
        let fixed_supported = device
            .supported_output_configs()
            .map(|mut configs| {
                configs.any(|range| {
                    range.channels() == requested.channels
                        && range.sample_format() == cpal::SampleFormat::F32
                        && matches!(
                            range.buffer_size(),
                            cpal::SupportedBufferSize::Range { min, max }
                                if *min as usize <= requested.buffer_frames
                                    && requested.buffer_frames <= *max as usize
                        )
                })
            })
            .unwrap_or(false);
        if !fixed_supported {
            config.buffer_size = cpal::BufferSize::Default;
        }

        let stream = Self::build(&device, &config, callback)
            .map_err(|err| DemoSyncError::DeviceUnavailable(err.to_string()))?;
        if let Err(err) = stream.pause() {
            tracing::debug!(%err, "audio device cannot start paused");
        }

        let negotiated = StreamFormat {
            buffer_frames: match config.buffer_size {
                cpal::BufferSize::Fixed(frames) => frames as usize,
                // Unknown cadence; reported as larger than requested.
                cpal::BufferSize::Default => usize::MAX,
            },
            ..requested
        };
        tracing::debug!(
            device = %device_name,
            sample_rate = negotiated.sample_rate,
            channels = negotiated.channels,
            fixed_buffer = fixed_supported,
            "audio device opened"
        );
        self.stream = Some(stream);
        Ok(negotiated)
    }

    fn output_devices(&self) -> Result<Vec<String>> {
        let devices = cpal::default_host()
            .output_devices()
            .map_err(|err| DemoSyncError::DeviceUnavailable(err.to_string()))?;
        Ok(devices.filter_map(|device| device.name().ok()).collect())
    }

    fn open_capture(&mut self, format: StreamFormat, feed: HeapProd<f32>) -> Result<()> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| DemoSyncError::DeviceUnavailable("no default input device".into()))?;
        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let mut feed = feed;
        let stream = device
            .build_input_stream(
                &config,
                // A full ring drops the newest input; the output callback catches up.
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    feed.push_slice(data);
                },
                |err| tracing::error!(%err, "audio capture error"),
                None,
            )
            .map_err(|err| DemoSyncError::DeviceUnavailable(err.to_string()))?;
        if self.playing {
            stream
                .play()
                .map_err(|err| DemoSyncError::DeviceUnavailable(err.to_string()))?;
        } else if let Err(err) = stream.pause() {
            tracing::debug!(%err, "capture device cannot start paused");
        }

        tracing::debug!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            "capture device opened"
        );
        self.input = Some(stream);
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| DemoSyncError::msg("audio device is not open"))?;
        stream
            .play()
            .map_err(|err| DemoSyncError::DeviceUnavailable(err.to_string()))?;
        self.playing = true;
        if let Some(input) = self.input.as_ref() {
            input
                .play()
                .map_err(|err| DemoSyncError::DeviceUnavailable(err.to_string()))?;
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.playing = false;
        for stream in self.stream.iter().chain(self.input.iter()) {
            stream
                .pause()
                .map_err(|err| DemoSyncError::DeviceUnavailable(err.to_string()))?;
        }
        Ok(())
    }

    fn close(&mut self) {
        // Dropping a stream joins cpal's callback thread.
        self.input = None;
        self.stream = None;
        self.playing = false;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl std::fmt::Debug for CpalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalBackend")
            .field("device", &self.device)
            .field("open", &self.stream.is_some())
            .field("capturing", &self.input.is_some())
            .finish()
    }
}
