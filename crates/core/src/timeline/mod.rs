//! Authoritative playback clock.
//!
//! The clock derives elapsed time from a [`WallClock`] unless it has been
//! synchronized to a [`TimeSource`] (normally the audio stream), in which
//! case the source's sample position wins. An attached source follows every
//! pause and seek whether or not it drives "now". Elapsed time is
//! snapshotted by [`Clock::update`] once per frame so that every reader in a
//! frame sees the same value.

use std::{
    rc::Rc,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::config::DEFAULT_BEATS_PER_MINUTE;

/// Monotonic millisecond counter.
pub trait WallClock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// [`WallClock`] backed by [`Instant`], counting from construction.
#[derive(Debug, Clone)]
pub struct SystemWallClock {
    origin: Instant,
}

impl SystemWallClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemWallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock for SystemWallClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven [`WallClock`] for deterministic timing.
#[derive(Debug, Default)]
pub struct ManualWallClock {
    now: AtomicU64,
}

impl ManualWallClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl WallClock for ManualWallClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Why playback is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PauseReason {
    /// Transport pause requested by the user or the live editor.
    User,
    /// Internal suspension while spectrum history is rebuilt.
    Seek,
    /// Automatic pause after a playback failure.
    Fault,
}

impl PauseReason {
    pub(crate) fn bit(self) -> u8 {
        match self {
            PauseReason::User => 0b001,
            PauseReason::Seek => 0b010,
            PauseReason::Fault => 0b100,
        }
    }

    /// Bits lifted when resuming for this reason. A user resume also lifts a
    /// fault pause.
    pub(crate) fn resume_mask(self) -> u8 {
        match self {
            PauseReason::User => PauseReason::User.bit() | PauseReason::Fault.bit(),
            other => other.bit(),
        }
    }

    /// Applies a pause or resume for `reason` to a reason set.
    pub(crate) fn apply(self, reasons: u8, paused: bool) -> u8 {
        if paused {
            reasons | self.bit()
        } else {
            reasons & !self.resume_mask()
        }
    }
}

/// A position provider the clock can delegate "now" to.
pub trait TimeSource {
    /// Current position in seconds.
    fn time_in_seconds(&self) -> f64;
    /// Best-effort reposition.
    fn seek(&self, seconds: f64);
    fn set_paused(&self, paused: bool, reason: PauseReason);
}

/// Playback clock holding elapsed time, pause state and tempo.
pub struct Clock {
    wall: Arc<dyn WallClock>,
    source: Option<Rc<dyn TimeSource>>,
    /// Read "now" from `source` instead of the wall clock.
    follow_source: bool,
    start_millis: u64,
    delta_millis: i64,
    elapsed_millis: u64,
    pause_reasons: u8,
    paused_at: Option<u64>,
    beats_per_minute: f64,
}

impl Clock {
    pub fn new(beats_per_minute: f64) -> Self {
        Self::with_wall_clock(beats_per_minute, Arc::new(SystemWallClock::new()))
    }

    pub fn with_wall_clock(beats_per_minute: f64, wall: Arc<dyn WallClock>) -> Self {
        let now = wall.now_millis();
        let mut clock = Self {
            wall,
            source: None,
            follow_source: false,
            start_millis: now,
            delta_millis: 0,
            elapsed_millis: 0,
            pause_reasons: 0,
            paused_at: None,
            beats_per_minute: DEFAULT_BEATS_PER_MINUTE,
        };
        clock.set_beats_per_minute(beats_per_minute);
        clock
    }

    /// Restarts from zero and resumes playback.
    pub fn start(&mut self) {
        let now = self.wall.now_millis();
        self.start_millis = now;
        self.delta_millis = 0;
        self.pause_reasons = 0;
        self.paused_at = None;
        if let Some(source) = &self.source {
            source.set_paused(false, PauseReason::User);
        }
        self.set_time_in_seconds(0.0);
    }

    /// Rewinds to zero and pauses.
    pub fn stop(&mut self) {
        self.pause(true);
        let now = self.wall.now_millis();
        self.start_millis = now;
        self.delta_millis = 0;
        self.paused_at = Some(now);
        if let Some(source) = &self.source {
            source.seek(0.0);
        }
        self.update();
    }

    /// Transport pause. Repeated calls with the same value are no-ops for the
    /// paused-time bookkeeping.
    pub fn pause(&mut self, paused: bool) {
        self.pause_with_reason(paused, PauseReason::User);
    }

    /// Pauses or resumes on behalf of `reason`. The clock stays paused while
    /// any reason remains set; resuming with a non-user reason does not lift
    /// a pause another reason put in place.
    pub fn pause_with_reason(&mut self, paused: bool, reason: PauseReason) {
        if let Some(source) = &self.source {
            source.set_paused(paused, reason);
        }

        let was_paused = self.is_pause();
        self.pause_reasons = reason.apply(self.pause_reasons, paused);
        let now_paused = self.is_pause();
        if was_paused == now_paused {
            return;
        }

        let now = self.wall.now_millis();
        if now_paused {
            self.paused_at = Some(now);
        } else if let Some(paused_at) = self.paused_at.take() {
            self.delta_millis -= now.saturating_sub(paused_at) as i64;
        }
        tracing::debug!(paused = now_paused, ?reason, "clock pause");
        self.update();
    }

    pub fn is_pause(&self) -> bool {
        self.pause_reasons != 0
    }

    pub fn is_paused_for(&self, reason: PauseReason) -> bool {
        self.pause_reasons & reason.bit() != 0
    }

    /// Attaches the source that follows pause and seek, without reading
    /// "now" from it. `None` detaches it and returns to wall time.
    pub fn attach_audio(&mut self, source: Option<Rc<dyn TimeSource>>) {
        if let Some(source) = &source {
            // User first: its resume also clears a fault pause.
            for reason in [PauseReason::User, PauseReason::Fault] {
                source.set_paused(self.is_paused_for(reason), reason);
            }
        }
        if source.is_none() {
            self.follow_source = false;
        }
        self.source = source;
        self.update();
    }

    /// Delegates "now" to `source`, attaching it as with
    /// [`Clock::attach_audio`]. `None` returns "now" to the wall clock while
    /// the attached source keeps following pause and seek.
    pub fn synchronize_to_audio(&mut self, source: Option<Rc<dyn TimeSource>>) {
        match source {
            Some(source) => {
                self.follow_source = true;
                self.attach_audio(Some(source));
                tracing::trace!("clock synchronized to audio");
            }
            None => {
                if self.follow_source {
                    tracing::trace!("clock synchronization to audio removed");
                }
                self.follow_source = false;
                self.update();
            }
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.follow_source && self.source.is_some()
    }

    pub fn is_audio_attached(&self) -> bool {
        self.source.is_some()
    }

    /// Takes the per-frame snapshot of elapsed time.
    pub fn update(&mut self) {
        self.elapsed_millis = match &self.source {
            Some(source) if self.follow_source => {
                (source.time_in_seconds().max(0.0) * 1000.0) as u64
            }
            _ => self.wall_elapsed(),
        };
    }

    /// Moves playback to `seconds`. A negative value restarts the clock from
    /// zero and resumes it.
    pub fn set_time_in_seconds(&mut self, seconds: f64) {
        if seconds < 0.0 {
            self.start();
            return;
        }

        if let Some(source) = &self.source {
            source.seek(seconds);
        }
        let target = (seconds * 1000.0).round() as i64;
        self.delta_millis += target - self.wall_elapsed() as i64;
        self.update();
    }

    pub fn time_in_milliseconds(&self) -> u64 {
        self.elapsed_millis
    }

    pub fn time_in_seconds(&self) -> f64 {
        self.elapsed_millis as f64 / 1000.0
    }

    /// Sets the tempo. Non-positive or non-finite values fall back to the
    /// default tempo.
    pub fn set_beats_per_minute(&mut self, beats_per_minute: f64) {
        if beats_per_minute.is_finite() && beats_per_minute > 0.0 {
            self.beats_per_minute = beats_per_minute;
        } else {
            tracing::warn!(
                beats_per_minute,
                fallback = DEFAULT_BEATS_PER_MINUTE,
                "invalid tempo, using default"
            );
            self.beats_per_minute = DEFAULT_BEATS_PER_MINUTE;
        }
    }

    pub fn beats_per_minute(&self) -> f64 {
        self.beats_per_minute
    }

    pub fn beats_per_second(&self) -> f64 {
        self.beats_per_minute / 60.0
    }

    pub fn seconds_per_beat(&self) -> f64 {
        60.0 / self.beats_per_minute
    }

    pub fn set_time_in_beats(&mut self, beats: f64) {
        self.set_time_in_seconds(beats * self.seconds_per_beat());
    }

    pub fn time_in_beats(&self) -> f64 {
        self.time_in_seconds() * self.beats_per_second()
    }

    fn wall_elapsed(&self) -> u64 {
        let now = self.paused_at.unwrap_or_else(|| self.wall.now_millis());
        (now as i64 - self.start_millis as i64 + self.delta_millis).max(0) as u64
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("elapsed_millis", &self.elapsed_millis)
            .field("pause_reasons", &self.pause_reasons)
            .field("beats_per_minute", &self.beats_per_minute)
            .field("attached", &self.source.is_some())
            .field("synchronized", &self.is_synchronized())
            .finish()
    }
}

/// Formats milliseconds as `mm:ss.SSS`.
pub fn format_time(millis: u64) -> String {
    let minutes = millis / 60_000;
    let seconds = (millis / 1000) % 60;
    format!("{minutes:02}:{seconds:02}.{:03}", millis % 1000)
}
