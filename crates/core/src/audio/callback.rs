use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    Arc, Mutex, TryLockError,
};

use ringbuf::{
    traits::{Consumer, Observer},
    HeapCons,
};

use crate::{
    analysis::SpectrumAnalyzer, spectrum::SpectrumExchange, timeline::PauseReason, AudioFile,
    WallClock,
};

const LOG_INTERVAL_MILLIS: u64 = 1_000;

/// State read by the main loop and written by the audio callback.
#[derive(Debug)]
pub(crate) struct StreamShared {
    /// Interleaved samples consumed since the stream started.
    sample_position: AtomicU64,
    /// Wall-clock millis of the last callback that advanced the stream.
    callback_millis: AtomicU64,
    pause_reasons: AtomicU8,
    active: AtomicBool,
    underruns: AtomicU64,
    pub(super) stream: Mutex<Option<ActiveStream>>,
}

#[derive(Debug)]
pub(crate) struct ActiveStream {
    pub file: AudioFile,
    pub looping: bool,
    duration_warned: bool,
}

impl ActiveStream {
    pub fn new(file: AudioFile, looping: bool) -> Self {
        Self {
            file,
            looping,
            duration_warned: false,
        }
    }
}

impl StreamShared {
    pub fn new() -> Self {
        Self {
            sample_position: AtomicU64::new(0),
            callback_millis: AtomicU64::new(0),
            pause_reasons: AtomicU8::new(0),
            active: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
            stream: Mutex::new(None),
        }
    }

    pub fn sample_position(&self) -> u64 {
        self.sample_position.load(Ordering::Acquire)
    }

    pub fn callback_millis(&self) -> u64 {
        self.callback_millis.load(Ordering::Acquire)
    }

    /// Repositions the stream and restarts sub-callback interpolation.
    pub fn reposition(&self, sample_position: u64, now_millis: u64) {
        self.sample_position.store(sample_position, Ordering::Release);
        self.callback_millis.store(now_millis, Ordering::Release);
    }

    /// Sets or clears one pause reason, with the same resume rule as
    /// [`crate::Clock`]. Returns whether the stream was paused for any
    /// reason before the call.
    pub fn set_paused(&self, paused: bool, reason: PauseReason) -> bool {
        let previous = if paused {
            self.pause_reasons.fetch_or(reason.bit(), Ordering::AcqRel)
        } else {
            self.pause_reasons
                .fetch_and(!reason.resume_mask(), Ordering::AcqRel)
        };
        previous != 0
    }

    pub fn is_paused(&self) -> bool {
        self.pause_reasons.load(Ordering::Acquire) != 0
    }

    pub fn is_paused_for(&self, reason: PauseReason) -> bool {
        self.pause_reasons.load(Ordering::Acquire) & reason.bit() != 0
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn install(&self, stream: Option<ActiveStream>) -> crate::Result<()> {
        let mut slot = self
            .stream
            .lock()
            .map_err(|_| crate::DemoSyncError::msg("audio stream state has been poisoned"))?;
        self.active.store(stream.is_some(), Ordering::Release);
        *slot = stream;
        Ok(())
    }
}

/// Clears a pause reason when dropped, unless it was already set when the
/// guard was taken.
pub(crate) struct SuspendGuard<'a> {
    shared: &'a StreamShared,
    reason: PauseReason,
    owned: bool,
}

impl<'a> SuspendGuard<'a> {
    pub fn new(shared: &'a StreamShared, reason: PauseReason) -> Self {
        let owned = !shared.is_paused_for(reason);
        shared.set_paused(true, reason);
        Self {
            shared,
            reason,
            owned,
        }
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.shared.set_paused(false, self.reason);
        }
    }
}

/// Spectrum capture performed on every consumed buffer.
pub(crate) struct Capture {
    pub analyzer: SpectrumAnalyzer,
    pub exchange: Arc<SpectrumExchange>,
}

/// Input device samples queued for mixing into the output.
pub(crate) struct CaptureInput {
    feed: HeapCons<f32>,
    volume: f32,
    scratch: Vec<f32>,
}

impl CaptureInput {
    /// `max_samples` bounds how much input one callback can mix.
    pub fn new(feed: HeapCons<f32>, volume: f32, max_samples: usize) -> Self {
        Self {
            feed,
            volume,
            scratch: vec![0.0; max_samples],
        }
    }

    /// Adds queued input to `out`. Missing input counts as silence.
    fn mix_into(&mut self, out: &mut [f32]) {
        let len = out.len().min(self.scratch.len());
        let scratch = &mut self.scratch[..len];
        let read = self.feed.pop_slice(scratch);
        for (target, sample) in out.iter_mut().zip(&scratch[..read]) {
            *target = (*target + sample * self.volume).clamp(-1.0, 1.0);
        }
    }

    /// Drops queued input so a resume does not replay stale audio.
    fn discard(&mut self) {
        let queued = self.feed.occupied_len();
        self.feed.skip(queued);
    }
}

/// Output settings applied by the callback.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Mixing {
    pub channels: usize,
    pub volume: f32,
    pub mute: bool,
}

/// The realtime half of the audio source, handed to a backend on open.
///
/// [`AudioCallback::process`] must return within the device's time budget:
/// it only takes the stream lock with `try_lock`, never allocates in steady
/// state and reports problems through a rate-limited log.
pub struct AudioCallback {
    shared: Arc<StreamShared>,
    wall: Arc<dyn WallClock>,
    mixing: Mixing,
    sample_rate: u32,
    capture: Option<Capture>,
    input: Option<CaptureInput>,
    busy_log: RateLimitedLog,
    capture_log: RateLimitedLog,
}

enum Rendered {
    Playing,
    Ended,
}

impl AudioCallback {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        wall: Arc<dyn WallClock>,
        mixing: Mixing,
        sample_rate: u32,
        capture: Option<Capture>,
        input: Option<CaptureInput>,
    ) -> Self {
        Self {
            shared,
            wall,
            mixing,
            sample_rate,
            capture,
            input,
            busy_log: RateLimitedLog::new(LOG_INTERVAL_MILLIS),
            capture_log: RateLimitedLog::new(LOG_INTERVAL_MILLIS),
        }
    }

    /// Fills one interleaved output buffer.
    pub fn process(&mut self, out: &mut [f32]) {
        let now = self.wall.now_millis();
        out.fill(0.0);
        if self.shared.is_paused() {
            if let Some(input) = self.input.as_mut() {
                input.discard();
            }
            return;
        }

        match self.shared.stream.try_lock() {
            Ok(mut slot) => {
                if let Some(stream) = slot.as_mut() {
                    let rendered =
                        render(&self.shared, self.mixing, self.sample_rate, stream, out, now);
                    if let Rendered::Ended = rendered {
                        *slot = None;
                        self.shared.active.store(false, Ordering::Release);
                    }
                }
            }
            Err(TryLockError::WouldBlock) | Err(TryLockError::Poisoned(_)) => {
                self.shared.underruns.fetch_add(1, Ordering::Relaxed);
                if let Some(suppressed) = self.busy_log.should_emit(now) {
                    tracing::warn!(suppressed, "audio stream busy, output silence");
                }
                return;
            }
        }

        if let Some(input) = self.input.as_mut() {
            input.mix_into(out);
        }

        if let Some(capture) = self.capture.as_mut() {
            let offset = self.shared.sample_position();
            match capture.analyzer.analyze(out, self.mixing.channels) {
                Ok(row) => {
                    capture.exchange.publish(offset, row);
                }
                Err(err) => {
                    if let Some(suppressed) = self.capture_log.should_emit(now) {
                        tracing::warn!(%err, suppressed, "spectrum capture failed");
                    }
                }
            }
        }

        if self.mixing.mute {
            out.fill(0.0);
        }
    }
}

fn render(
    shared: &StreamShared,
    mixing: Mixing,
    sample_rate: u32,
    stream: &mut ActiveStream,
    out: &mut [f32],
    now: u64,
) -> Rendered {
    let samples = stream.file.samples();
    let channels = mixing.channels.max(1) as f64;
    let mut position = shared.sample_position() as usize;

    if let Some(duration) = stream.file.duration() {
        let seconds = position as f64 / sample_rate as f64 / channels;
        if seconds >= duration {
            if stream.looping && !stream.duration_warned {
                stream.duration_warned = true;
                tracing::error!("duration and loop are not supported together");
            }
            return Rendered::Ended;
        }
    }

    if position >= samples.len() {
        if !stream.looping {
            return Rendered::Ended;
        }
        position = 0;
    }

    let mut written = 0;
    while written < out.len() {
        let count = (samples.len() - position).min(out.len() - written);
        for (target, sample) in out[written..written + count]
            .iter_mut()
            .zip(&samples[position..position + count])
        {
            *target = sample * mixing.volume;
        }
        written += count;
        position += count;
        if position >= samples.len() {
            if !stream.looping {
                break;
            }
            position = 0;
        }
    }

    shared.reposition(position as u64, now);
    if !stream.looping && position >= samples.len() {
        Rendered::Ended
    } else {
        Rendered::Playing
    }
}

impl std::fmt::Debug for AudioCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCallback")
            .field("mixing", &self.mixing)
            .field("sample_rate", &self.sample_rate)
            .field("capture", &self.capture.is_some())
            .field("input", &self.input.is_some())
            .finish()
    }
}

/// Lets one message through per interval and counts the rest.
#[derive(Debug)]
pub(crate) struct RateLimitedLog {
    interval_millis: u64,
    last_millis: Option<u64>,
    suppressed: u64,
}

impl RateLimitedLog {
    pub fn new(interval_millis: u64) -> Self {
        Self {
            interval_millis,
            last_millis: None,
            suppressed: 0,
        }
    }

    /// Returns the number of suppressed messages when one may be emitted now.
    pub fn should_emit(&mut self, now_millis: u64) -> Option<u64> {
        let due = self
            .last_millis
            .map_or(true, |last| now_millis.saturating_sub(last) >= self.interval_millis);
        if due {
            self.last_millis = Some(now_millis);
            Some(std::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::FftConfig, spectrum::SpectrumHistory, ManualWallClock};

    fn mixing(channels: usize) -> Mixing {
        Mixing {
            channels,
            volume: 1.0,
            mute: false,
        }
    }

    fn callback_for(
        file: AudioFile,
        looping: bool,
        mixing: Mixing,
    ) -> (AudioCallback, Arc<StreamShared>, Arc<ManualWallClock>) {
        let shared = Arc::new(StreamShared::new());
        let wall = Arc::new(ManualWallClock::new(0));
        let sample_rate = file.sample_rate();
        shared.install(Some(ActiveStream::new(file, looping))).unwrap();
        let callback = AudioCallback::new(shared.clone(), wall.clone(), mixing, sample_rate, None, None);
        (callback, shared, wall)
    }

    fn ramp(len: usize) -> AudioFile {
        let samples = (0..len).map(|i| i as f32).collect();
        AudioFile::from_samples("ramp", 10, 1, samples).unwrap()
    }

    #[test]
    fn advances_position_by_consumed_samples() {
        let (mut callback, shared, wall) = callback_for(ramp(10), false, mixing(1));
        let mut out = [0.0; 4];
        wall.set(40);
        callback.process(&mut out);
        assert_eq!(out, [0.0, 1.0, 2.0, 3.0]);
        assert_eq!(shared.sample_position(), 4);
        assert_eq!(shared.callback_millis(), 40);
    }

    #[test]
    fn paused_stream_outputs_silence_and_holds_position() {
        let (mut callback, shared, _) = callback_for(ramp(10), false, mixing(1));
        shared.set_paused(true, PauseReason::User);
        let mut out = [9.0; 4];
        callback.process(&mut out);
        assert_eq!(out, [0.0; 4]);
        assert_eq!(shared.sample_position(), 0);
    }

    #[test]
    fn non_looping_stream_ends_after_tail() {
        let (mut callback, shared, _) = callback_for(ramp(6), false, mixing(1));
        let mut out = [0.0; 4];
        callback.process(&mut out);
        callback.process(&mut out);
        assert_eq!(out, [4.0, 5.0, 0.0, 0.0]);
        assert!(!shared.is_active());
        assert_eq!(shared.sample_position(), 6);
    }

    #[test]
    fn looping_stream_wraps() {
        let (mut callback, shared, _) = callback_for(ramp(6), true, mixing(1));
        let mut out = [0.0; 4];
        callback.process(&mut out);
        callback.process(&mut out);
        assert_eq!(out, [4.0, 5.0, 0.0, 1.0]);
        assert!(shared.is_active());
        assert_eq!(shared.sample_position(), 2);
    }

    #[test]
    fn duration_limit_ends_stream() {
        let file = ramp(100).with_duration(Some(0.5));
        let (mut callback, shared, _) = callback_for(file, false, mixing(1));
        let mut out = [0.0; 5];
        callback.process(&mut out);
        assert!(shared.is_active());
        callback.process(&mut out);
        assert!(!shared.is_active());
    }

    #[test]
    fn busy_stream_lock_degrades_to_silence() {
        let (mut callback, shared, _) = callback_for(ramp(10), false, mixing(1));
        let _held = shared.stream.lock().unwrap();
        let mut out = [9.0; 4];
        callback.process(&mut out);
        assert_eq!(out, [0.0; 4]);
        assert_eq!(shared.underruns(), 1);
    }

    #[test]
    fn mute_and_volume_apply_to_output() {
        let mut quiet = mixing(1);
        quiet.volume = 0.5;
        let (mut callback, _, _) = callback_for(ramp(10), false, quiet);
        let mut out = [0.0; 3];
        callback.process(&mut out);
        assert_eq!(out, [0.0, 0.5, 1.0]);

        let mut muted = mixing(1);
        muted.mute = true;
        let (mut callback, shared, _) = callback_for(ramp(10), false, muted);
        callback.process(&mut out);
        assert_eq!(out, [0.0; 3]);
        assert_eq!(shared.sample_position(), 3);
    }

    #[test]
    fn captures_spectrum_rows_tagged_with_offset() {
        let file = AudioFile::from_samples("dc", 100, 2, vec![1.0; 64]).unwrap();
        let shared = Arc::new(StreamShared::new());
        shared.install(Some(ActiveStream::new(file, false))).unwrap();
        let fft = FftConfig {
            enable: true,
            size: 4,
            history: 4,
            divisor: 1.0,
            clip_min: 0.0,
            clip_max: 1.0,
        };
        let exchange = Arc::new(SpectrumExchange::new(4, 4));
        let capture = Capture {
            analyzer: SpectrumAnalyzer::new(8, &fft).unwrap(),
            exchange: exchange.clone(),
        };
        let mut callback = AudioCallback::new(
            shared,
            Arc::new(ManualWallClock::new(0)),
            mixing(2),
            100,
            Some(capture),
            None,
        );

        let mut out = [0.0; 16];
        callback.process(&mut out);
        let mut history = SpectrumHistory::new(4, 4, true);
        assert_eq!(exchange.drain_into(&mut history).unwrap(), 1);
        assert_eq!(history.newest_offset(), Some(16));
        let window = history.current_window();
        assert_eq!(window[12], 1.0);
    }

    #[test]
    fn input_is_mixed_before_analysis() {
        use ringbuf::{traits::{Producer, Split}, HeapRb};

        let file = AudioFile::from_samples("silence", 100, 2, vec![0.0; 64]).unwrap();
        let shared = Arc::new(StreamShared::new());
        shared.install(Some(ActiveStream::new(file, false))).unwrap();
        let fft = FftConfig {
            enable: true,
            size: 4,
            history: 4,
            divisor: 1.0,
            clip_min: 0.0,
            clip_max: 1.0,
        };
        let exchange = Arc::new(SpectrumExchange::new(4, 4));
        let capture = Capture {
            analyzer: SpectrumAnalyzer::new(8, &fft).unwrap(),
            exchange: exchange.clone(),
        };
        let (mut feed, queue) = HeapRb::<f32>::new(64).split();
        let mut callback = AudioCallback::new(
            shared.clone(),
            Arc::new(ManualWallClock::new(0)),
            mixing(2),
            100,
            Some(capture),
            Some(CaptureInput::new(queue, 0.5, 64)),
        );

        assert_eq!(feed.push_slice(&[2.0; 16]), 16);
        let mut out = [0.0; 16];
        callback.process(&mut out);
        assert_eq!(out, [1.0; 16]);
        let mut history = SpectrumHistory::new(4, 4, true);
        exchange.drain_into(&mut history).unwrap();
        assert_eq!(history.current_window()[12], 1.0);

        // Input queued while paused is dropped, not replayed.
        shared.set_paused(true, PauseReason::User);
        feed.push_slice(&[0.5; 8]);
        callback.process(&mut out);
        shared.set_paused(false, PauseReason::User);
        callback.process(&mut out);
        assert_eq!(out, [0.0; 16]);
    }

    #[test]
    fn suspend_guard_restores_prior_state() {
        let shared = StreamShared::new();
        {
            let _guard = SuspendGuard::new(&shared, PauseReason::Seek);
            assert!(shared.is_paused());
        }
        assert!(!shared.is_paused());

        shared.set_paused(true, PauseReason::Seek);
        {
            let _guard = SuspendGuard::new(&shared, PauseReason::Seek);
        }
        assert!(shared.is_paused_for(PauseReason::Seek));
    }

    #[test]
    fn rate_limited_log_counts_suppressed_messages() {
        let mut log = RateLimitedLog::new(1_000);
        assert_eq!(log.should_emit(0), Some(0));
        assert_eq!(log.should_emit(10), None);
        assert_eq!(log.should_emit(999), None);
        assert_eq!(log.should_emit(1_000), Some(2));
    }
}
