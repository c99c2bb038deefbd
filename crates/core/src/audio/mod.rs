//! Song playback acting as the clock's time source.
//!
//! [`AudioClockSource`] lives on the main loop. It hands an [`AudioCallback`]
//! to an [`AudioBackend`] which invokes it from the device thread; the two
//! halves only share the atomics in `StreamShared` and the
//! [`SpectrumExchange`] double buffer.

mod backend;
mod callback;
#[cfg(feature = "cpal")]
mod cpal_backend;
mod file;

use std::{
    cell::{Cell, RefCell},
    path::Path,
    sync::Arc,
};

pub use backend::{AudioBackend, HeadlessBackend, StreamFormat};
#[cfg(test)]
pub(crate) use backend::ManualBackend;
pub use callback::AudioCallback;
#[cfg(feature = "cpal")]
pub use cpal_backend::CpalBackend;
pub use file::AudioFile;

use callback::{ActiveStream, Capture, CaptureInput, Mixing, StreamShared, SuspendGuard};
use ringbuf::{traits::Split, HeapProd, HeapRb};

use crate::{
    analysis::SpectrumAnalyzer,
    config::{AppConfig, AudioConfig, BackendKind, FftConfig},
    spectrum::{SpectrumExchange, SpectrumHistory},
    timeline::{PauseReason, TimeSource, WallClock},
    DemoSyncError, Result,
};

/// Seeks further than this from the newest captured row discard the
/// spectrum history instead of rewinding it.
const SPECTRUM_REWIND_LIMIT_SECONDS: f64 = 0.5;

/// Callback buffers of input the capture ring can hold.
const CAPTURE_RING_BUFFERS: usize = 4;

/// Plays one song through an audio backend and reports its position.
pub struct AudioClockSource {
    audio: AudioConfig,
    fft: FftConfig,
    song_loop: bool,
    wall: Arc<dyn WallClock>,
    shared: Arc<StreamShared>,
    exchange: Option<Arc<SpectrumExchange>>,
    history: RefCell<SpectrumHistory>,
    backend: RefCell<Box<dyn AudioBackend>>,
    format: Cell<Option<StreamFormat>>,
    file: RefCell<Option<AudioFile>>,
    synchronizable: Cell<bool>,
}

impl AudioClockSource {
    /// Creates a source using the backend selected in `config.audio`.
    pub fn new(config: &AppConfig, wall: Arc<dyn WallClock>) -> Self {
        Self::with_backend(config, wall, select_backend(&config.audio))
    }

    pub fn with_backend(
        config: &AppConfig,
        wall: Arc<dyn WallClock>,
        backend: Box<dyn AudioBackend>,
    ) -> Self {
        let fft = config.fft.clone();
        let exchange = fft
            .enable
            .then(|| Arc::new(SpectrumExchange::new(fft.size, fft.history)));
        let history = SpectrumHistory::new(fft.size, fft.history, fft.enable && config.tool);
        tracing::debug!(
            backend = backend.name(),
            capture = fft.enable,
            seek_log = history.is_logging(),
            "audio source created"
        );

        Self {
            audio: config.audio.clone(),
            fft,
            song_loop: config.demo.song_loop,
            wall,
            shared: Arc::new(StreamShared::new()),
            exchange,
            history: RefCell::new(history),
            backend: RefCell::new(backend),
            format: Cell::new(None),
            file: RefCell::new(None),
            synchronizable: Cell::new(false),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.borrow().name()
    }

    /// Output devices the current backend can open by name.
    pub fn output_devices(&self) -> Result<Vec<String>> {
        self.backend.borrow().output_devices()
    }

    /// Decodes and plays the song at `path`.
    pub fn play(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = AudioFile::open(path)?;
        self.play_file(file)
    }

    /// Replaces the current song with `file` and starts it from zero.
    pub fn play_file(&self, file: AudioFile) -> Result<()> {
        self.stop();

        let requested = StreamFormat {
            sample_rate: file.sample_rate(),
            channels: file.channels(),
            buffer_frames: self.audio.samples,
        };
        let format = self.open_device(requested)?;

        let synchronizable = format.buffer_frames <= requested.buffer_frames;
        if !synchronizable {
            tracing::warn!(
                requested = requested.buffer_frames,
                "audio device runs larger buffers than requested, not usable as time source"
            );
        }
        self.synchronizable.set(synchronizable);

        self.shared.set_paused(false, PauseReason::User);
        self.shared.reposition(0, self.wall.now_millis());
        self.shared
            .install(Some(ActiveStream::new(file.clone(), self.song_loop)))?;
        self.format.set(Some(format));
        tracing::info!(
            song = file.name(),
            sample_rate = file.sample_rate(),
            channels = file.channels(),
            seconds = file.total_seconds(),
            backend = self.backend_name(),
            "playing song"
        );
        *self.file.borrow_mut() = Some(file);

        let started = self.backend.borrow_mut().play();
        if let Err(err) = started {
            self.stop();
            return Err(err);
        }
        Ok(())
    }

    /// Pauses or resumes the song on behalf of the transport.
    pub fn pause(&self, paused: bool) {
        self.pause_with_reason(paused, PauseReason::User);
    }

    pub fn pause_with_reason(&self, paused: bool, reason: PauseReason) {
        let was_paused = self.shared.is_paused();
        self.shared.set_paused(paused, reason);
        let now_paused = self.shared.is_paused();
        if was_paused == now_paused {
            return;
        }
        if !now_paused {
            // Interpolation restarts from the resume instant.
            self.shared
                .reposition(self.shared.sample_position(), self.wall.now_millis());
        }

        let mut backend = self.backend.borrow_mut();
        if !backend.is_open() {
            return;
        }
        let result = if now_paused {
            backend.pause()
        } else {
            backend.play()
        };
        if let Err(err) = result {
            tracing::warn!(%err, paused = now_paused, "audio device did not follow pause");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    /// Stops the song and closes the device.
    pub fn stop(&self) {
        if let Err(err) = self.shared.install(None) {
            tracing::warn!(%err, "failed to detach audio stream");
        }
        self.backend.borrow_mut().close();
        self.shared.reposition(0, self.wall.now_millis());
        self.format.set(None);
        self.synchronizable.set(false);
        if self.file.borrow_mut().take().is_some() {
            tracing::debug!("audio stopped");
        }
        self.clear_spectrum();
    }

    /// Moves the song to `seconds` and rewinds the spectrum history to match.
    pub fn set_position(&self, seconds: f64) -> Result<()> {
        let Some(format) = self.format.get() else {
            return Ok(());
        };
        let seconds = seconds.max(0.0);
        let channels = format.channels.max(1) as u64;
        let mut target = (seconds * format.sample_rate as f64).round() as u64 * channels;

        let _suspend = SuspendGuard::new(&self.shared, PauseReason::Seek);
        {
            let slot = self
                .shared
                .stream
                .lock()
                .map_err(|_| DemoSyncError::msg("audio stream state has been poisoned"))?;
            if let Some(stream) = slot.as_ref() {
                let total = stream.file.samples().len() as u64;
                if stream.looping && total > 0 {
                    target %= total;
                }
            }
            self.shared.reposition(target, self.wall.now_millis());
        }

        self.seek_spectrum(target, seconds, format)
    }

    fn seek_spectrum(&self, target: u64, seconds: f64, format: StreamFormat) -> Result<()> {
        let Some(exchange) = self.exchange.as_ref() else {
            return Ok(());
        };
        let mut history = self.history.borrow_mut();
        exchange.drain_into(&mut history)?;

        let newest = history
            .newest_time(format.sample_rate, format.channels)
            .unwrap_or(0.0);
        if target == 0 || (newest - seconds).abs() >= SPECTRUM_REWIND_LIMIT_SECONDS {
            tracing::trace!(seconds, newest, "clearing spectrum history");
            history.clear();
            exchange.discard()?;
        }

        let tolerance = self.audio.samples as u64 * format.channels as u64;
        match history.seek_approx(target, tolerance) {
            Ok(()) | Err(DemoSyncError::SeekMiss { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Song position in seconds, interpolated between callbacks.
    pub fn time_in_seconds(&self) -> f64 {
        let Some(format) = self.format.get() else {
            return 0.0;
        };
        let sample_rate = format.sample_rate.max(1) as f64;
        let channels = format.channels.max(1) as f64;
        let mut seconds = self.shared.sample_position() as f64 / sample_rate / channels;

        if self.shared.is_active() && !self.shared.is_paused() {
            let since_callback = self
                .wall
                .now_millis()
                .saturating_sub(self.shared.callback_millis()) as f64
                / 1000.0;
            let interval = format.buffer_frames.min(self.audio.samples) as f64 / sample_rate;
            seconds += since_callback.min(interval);
        }
        seconds
    }

    /// The song being played, `None` when nothing plays or the song ended.
    pub fn audio_file(&self) -> Option<AudioFile> {
        self.file.borrow().clone()
    }

    /// Whether the clock may follow this source.
    pub fn is_synchronizable(&self) -> bool {
        self.synchronizable.get() && self.file.borrow().is_some()
    }

    /// Per-frame housekeeping: applies captured spectrum rows and notices
    /// the end of a non-looping song.
    pub fn update(&self) -> Result<usize> {
        let applied = match self.exchange.as_ref() {
            Some(exchange) => exchange.drain_into(&mut self.history.borrow_mut())?,
            None => 0,
        };

        if !self.shared.is_active() {
            let ended = self.file.borrow_mut().take();
            if let Some(file) = ended {
                tracing::info!(song = file.name(), seconds = self.time_in_seconds(), "song finished");
                self.synchronizable.set(false);
                self.backend.borrow_mut().close();
            }
        }
        Ok(applied)
    }

    /// Runs `f` with the spectrum window, oldest row first.
    pub fn with_spectrum_window<R>(&self, f: impl FnOnce(&[f32]) -> R) -> R {
        let mut history = self.history.borrow_mut();
        f(history.current_window())
    }

    /// `(bins, rows)` of the spectrum window.
    pub fn spectrum_shape(&self) -> (usize, usize) {
        let history = self.history.borrow();
        (history.bins(), history.capacity())
    }

    pub fn is_capturing(&self) -> bool {
        self.exchange.is_some()
    }

    /// Discards the spectrum history and any rows not yet applied.
    pub fn clear_spectrum(&self) {
        self.history.borrow_mut().clear();
        if let Some(exchange) = self.exchange.as_ref() {
            if let Err(err) = exchange.discard() {
                tracing::warn!(%err, "failed to discard pending spectrum rows");
            }
        }
    }

    /// Callbacks that found the stream busy and output silence instead.
    pub fn underruns(&self) -> u64 {
        self.shared.underruns()
    }

    fn open_device(&self, requested: StreamFormat) -> Result<StreamFormat> {
        let mut backend = self.backend.borrow_mut();
        let (callback, mut feed) = self.callback(requested)?;
        let format = match backend.open(requested, callback) {
            Err(DemoSyncError::DeviceUnavailable(reason))
                if self.audio.backend == BackendKind::Auto && backend.name() != "headless" =>
            {
                tracing::warn!(
                    backend = backend.name(),
                    %reason,
                    "audio device unavailable, continuing without sound"
                );
                *backend = Box::new(HeadlessBackend::new());
                let (callback, retry_feed) = self.callback(requested)?;
                feed = retry_feed;
                backend.open(requested, callback)?
            }
            result => result?,
        };

        if let Some(feed) = feed {
            match backend.open_capture(format, feed) {
                Ok(()) => tracing::info!(backend = backend.name(), "capturing audio input"),
                Err(err) => tracing::warn!(%err, "audio capture unavailable, playing output only"),
            }
        }
        Ok(format)
    }

    /// Builds the realtime callback, plus the producer end of the capture
    /// ring when input capture is enabled.
    fn callback(&self, format: StreamFormat) -> Result<(AudioCallback, Option<HeapProd<f32>>)> {
        let capture = match self.exchange.as_ref() {
            Some(exchange) => Some(Capture {
                analyzer: SpectrumAnalyzer::new(format.buffer_frames, &self.fft)?,
                exchange: exchange.clone(),
            }),
            None => None,
        };
        let mixing = Mixing {
            channels: format.channels as usize,
            volume: self.audio.mix_volume,
            mute: self.audio.mute,
        };
        let (input, feed) = if self.audio.capture {
            let capacity = (format.buffer_samples() as usize).max(1) * CAPTURE_RING_BUFFERS;
            let (feed, queue) = HeapRb::<f32>::new(capacity).split();
            let input = CaptureInput::new(queue, self.audio.capture_mix_volume, capacity);
            (Some(input), Some(feed))
        } else {
            (None, None)
        };
        let callback = AudioCallback::new(
            self.shared.clone(),
            self.wall.clone(),
            mixing,
            format.sample_rate,
            capture,
            input,
        );
        Ok((callback, feed))
    }
}

impl TimeSource for AudioClockSource {
    fn time_in_seconds(&self) -> f64 {
        AudioClockSource::time_in_seconds(self)
    }

    fn seek(&self, seconds: f64) {
        if let Err(err) = self.set_position(seconds) {
            tracing::warn!(%err, seconds, "audio seek failed");
        }
    }

    fn set_paused(&self, paused: bool, reason: PauseReason) {
        self.pause_with_reason(paused, reason);
    }
}

impl Drop for AudioClockSource {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AudioClockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioClockSource")
            .field("backend", &self.backend_name())
            .field("format", &self.format.get())
            .field("file", &self.file.borrow().as_ref().map(|file| file.name().to_string()))
            .field("paused", &self.shared.is_paused())
            .finish()
    }
}

fn select_backend(audio: &AudioConfig) -> Box<dyn AudioBackend> {
    match audio.backend {
        BackendKind::Headless => Box::new(HeadlessBackend::new()),
        #[cfg(feature = "cpal")]
        BackendKind::Auto | BackendKind::Cpal => {
            Box::new(CpalBackend::with_device(audio.device.clone()))
        }
        #[cfg(not(feature = "cpal"))]
        BackendKind::Auto => Box::new(HeadlessBackend::new()),
        #[cfg(not(feature = "cpal"))]
        BackendKind::Cpal => {
            tracing::warn!("built without the cpal feature, using the headless backend");
            Box::new(HeadlessBackend::new())
        }
    }
}
