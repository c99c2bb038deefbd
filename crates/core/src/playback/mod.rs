//! The one owned object tying clock, song, tracks and live sync together.

use std::{path::Path, rc::Rc, sync::Arc};

use crate::{
    audio::{AudioBackend, AudioClockSource, AudioFile},
    config::AppConfig,
    sync::{LiveSyncSession, Transport},
    timeline::{Clock, PauseReason, SystemWallClock, TimeSource, WallClock},
    tracks::KeyframeTrackStore,
    DemoSyncError, Result,
};

/// Playback state for a production, constructed once at startup and passed
/// by reference to the frame loop.
pub struct PlaybackContext {
    config: AppConfig,
    clock: Clock,
    audio: Rc<AudioClockSource>,
    tracks: KeyframeTrackStore,
    sync: Option<LiveSyncSession>,
    current_row: f64,
    length_seconds: Option<f64>,
    finished: bool,
}

impl PlaybackContext {
    pub fn new(config: AppConfig) -> Result<Self> {
        let wall: Arc<dyn WallClock> = Arc::new(SystemWallClock::new());
        let audio = AudioClockSource::new(&config, wall.clone());
        Self::assemble(config, wall, audio)
    }

    /// Builds a context around an explicit wall clock and audio backend.
    pub fn with_parts(
        config: AppConfig,
        wall: Arc<dyn WallClock>,
        backend: Box<dyn AudioBackend>,
    ) -> Result<Self> {
        let audio = AudioClockSource::with_backend(&config, wall.clone(), backend);
        Self::assemble(config, wall, audio)
    }

    fn assemble(config: AppConfig, wall: Arc<dyn WallClock>, audio: AudioClockSource) -> Result<Self> {
        config.validate()?;
        let mut clock = Clock::with_wall_clock(config.demo.beats_per_minute, wall);
        let tracks = KeyframeTrackStore::load(&config.sync)?;
        let sync = config.tool.then(|| LiveSyncSession::new(&config.sync));

        // The audio follows every pause and seek; only `load_song_file`
        // decides whether it also drives "now".
        let audio = Rc::new(audio);
        let source: Rc<dyn TimeSource> = audio.clone();
        clock.attach_audio(Some(source));

        Ok(Self {
            length_seconds: config.demo.length_seconds,
            config,
            clock,
            audio,
            tracks,
            sync,
            current_row: 0.0,
            finished: false,
        })
    }

    /// Starts the clock from zero, plays the configured song and moves to the
    /// configured start position.
    pub fn start(&mut self) -> Result<()> {
        self.finished = false;
        self.clock.start();
        if let Some(song) = self.config.demo.song.clone() {
            self.load_song(song)?;
        }
        if self.config.demo.start_position > 0.0 {
            self.seek(self.config.demo.start_position);
        }
        self.refresh_row();
        Ok(())
    }

    /// Plays the song at `path`. On failure the clock keeps running on wall
    /// time.
    pub fn load_song(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let file = AudioFile::open(path)?;
        self.load_song_file(file)
    }

    pub fn load_song_file(&mut self, file: AudioFile) -> Result<()> {
        let seconds = self.clock.time_in_seconds();
        self.desynchronize();
        self.audio.play_file(file)?;

        if self.length_seconds.is_none() {
            self.length_seconds = self.audio.audio_file().map(|file| file.total_seconds());
        }
        // Re-attaching hands the clock's pause state to the new stream.
        let source: Rc<dyn TimeSource> = self.audio.clone();
        if self.config.audio.time_source && self.audio.is_synchronizable() {
            self.clock.synchronize_to_audio(Some(source));
        } else {
            tracing::debug!("song plays without driving the clock");
            self.clock.attach_audio(Some(source));
        }
        self.clock.set_time_in_seconds(seconds);
        Ok(())
    }

    /// Falls back to wall time without a jump.
    fn desynchronize(&mut self) {
        if !self.clock.is_synchronized() {
            return;
        }
        let seconds = self.clock.time_in_seconds();
        self.clock.synchronize_to_audio(None);
        self.clock.set_time_in_seconds(seconds);
    }

    /// Connects the live sync session. Only available in tool mode.
    pub fn connect_sync(&mut self) -> Result<()> {
        let session = self
            .sync
            .as_mut()
            .ok_or_else(|| DemoSyncError::config("live sync requires tool mode"))?;
        session.connect(&mut self.tracks)
    }

    /// Reloads tracks from disk and connects again.
    pub fn reconnect_sync(&mut self) -> Result<()> {
        let session = self
            .sync
            .as_mut()
            .ok_or_else(|| DemoSyncError::config("live sync requires tool mode"))?;
        session.reconnect(&mut self.tracks)
    }

    pub fn is_sync_online(&self) -> bool {
        self.sync.as_ref().is_some_and(LiveSyncSession::is_online)
    }

    /// Advances one frame.
    pub fn tick(&mut self) {
        self.clock.update();

        if let Err(err) = self.audio.update() {
            tracing::error!(%err, "audio update failed, pausing");
            self.clock.pause_with_reason(true, PauseReason::Fault);
        }
        if self.clock.is_synchronized() && self.audio.audio_file().is_none() {
            self.desynchronize();
        }
        self.refresh_row();

        if let Some(session) = self.sync.as_mut() {
            let mut transport = ClockTransport {
                clock: &mut self.clock,
                rows_per_beat: self.tracks.rows_per_beat(),
            };
            if let Err(err) = session.update(self.current_row, &mut self.tracks, &mut transport) {
                tracing::debug!(%err, "live sync went offline");
            }
            self.refresh_row();
        }

        self.check_end();
    }

    fn check_end(&mut self) {
        let Some(length) = self.length_seconds else {
            return;
        };
        if self.clock.time_in_seconds() < length {
            self.finished = false;
            return;
        }
        if self.is_sync_online() {
            if !self.clock.is_pause() {
                tracing::debug!(length, "end reached, pausing for the editor");
                self.clock.pause(true);
            }
        } else if !self.finished {
            tracing::info!(length, "end reached");
            self.finished = true;
        }
    }

    fn refresh_row(&mut self) {
        self.current_row = self.tracks.row_at_beats(self.clock.time_in_beats());
    }

    pub fn toggle_pause(&mut self) {
        let paused = !self.clock.is_pause();
        self.clock.pause(paused);
    }

    /// Moves playback to `seconds`; negative values restart from zero.
    pub fn seek(&mut self, seconds: f64) {
        self.clock.set_time_in_seconds(seconds);
        self.finished = false;
        self.refresh_row();
    }

    /// Saves edits when connected, then stops the song.
    pub fn shutdown(&mut self) {
        if let Some(session) = self.sync.as_mut() {
            session.disconnect(&self.tracks);
        }
        self.desynchronize();
        self.audio.stop();
    }

    pub fn time_in_seconds(&self) -> f64 {
        self.clock.time_in_seconds()
    }

    pub fn current_row(&self) -> f64 {
        self.current_row
    }

    /// Value of track `name` at the current row.
    pub fn evaluate(&mut self, name: &str) -> f64 {
        self.tracks.evaluate(name, self.current_row)
    }

    /// Runs `f` with the spectrum window, oldest row first.
    pub fn with_spectrum_window<R>(&self, f: impl FnOnce(&[f32]) -> R) -> R {
        self.audio.with_spectrum_window(f)
    }

    /// Copy of the spectrum window for upload as a `rows x bins` texture.
    pub fn spectrum_window(&self) -> Vec<f32> {
        self.with_spectrum_window(<[f32]>::to_vec)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn length_seconds(&self) -> Option<f64> {
        self.length_seconds
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn audio(&self) -> &AudioClockSource {
        &self.audio
    }

    pub fn tracks(&self) -> &KeyframeTrackStore {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> &mut KeyframeTrackStore {
        &mut self.tracks
    }
}

impl std::fmt::Debug for PlaybackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackContext")
            .field("clock", &self.clock)
            .field("audio", &self.audio)
            .field("tracks", &self.tracks.len())
            .field("sync_online", &self.is_sync_online())
            .field("current_row", &self.current_row)
            .finish()
    }
}

/// Lets the editor drive the clock.
struct ClockTransport<'a> {
    clock: &'a mut Clock,
    rows_per_beat: f64,
}

impl Transport for ClockTransport<'_> {
    fn pause(&mut self, paused: bool) {
        self.clock.pause(paused);
    }

    fn set_row(&mut self, row: u32) {
        self.clock.set_time_in_beats(row as f64 / self.rows_per_beat);
    }

    fn is_playing(&self) -> bool {
        !self.clock.is_pause()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread,
    };

    use super::*;
    use crate::{
        audio::ManualBackend,
        sync::protocol::{ServerCommand, CLIENT_GREETING, SERVER_GREETING},
        tracks::{DocumentTrack, Interpolation, TrackDocument, TrackKey},
        ManualWallClock,
    };

    fn base_config(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.sync.directory = dir.to_path_buf();
        config.audio.samples = 128;
        config.fft.size = 16;
        config
    }

    fn context(config: AppConfig) -> (PlaybackContext, Arc<ManualWallClock>, ManualBackend) {
        let wall = Arc::new(ManualWallClock::new(0));
        let backend = ManualBackend::default();
        let handle = ManualBackend {
            callback: backend.callback.clone(),
            playing: backend.playing.clone(),
            capture: backend.capture.clone(),
            fail_open: false,
        };
        let context = PlaybackContext::with_parts(config, wall.clone(), Box::new(backend)).unwrap();
        (context, wall, handle)
    }

    #[test]
    fn fade_track_follows_clock() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.demo.beats_per_minute = 120.0;
        config.sync.rows_per_beat = 4.0;
        TrackDocument {
            tracks: vec![DocumentTrack {
                name: "fade".into(),
                keys: vec![
                    TrackKey {
                        row: 0,
                        value: 0.0,
                        interpolation: Interpolation::Linear,
                    },
                    TrackKey {
                        row: 16,
                        value: 1.0,
                        interpolation: Interpolation::Linear,
                    },
                ],
            }],
        }
        .write(&config.sync.document_path())
        .unwrap();

        let (mut context, wall, _) = context(config);
        context.start().unwrap();
        wall.advance(1_000);
        context.tick();
        assert_eq!(context.time_in_seconds(), 1.0);
        assert_eq!(context.current_row(), 8.0);
        assert_eq!(context.evaluate("fade"), 0.5);
    }

    #[test]
    fn negative_seek_restarts_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut context, wall, _) = context(base_config(dir.path()));
        context.start().unwrap();
        context.seek(10.0);
        context.toggle_pause();
        wall.advance(300);
        context.tick();
        assert_eq!(context.time_in_seconds(), 10.0);

        context.seek(-1.0);
        assert_eq!(context.time_in_seconds(), 0.0);
        assert!(!context.clock().is_pause());
    }

    #[test]
    fn missing_song_keeps_wall_clock() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.demo.song = Some(dir.path().join("missing.wav"));
        let (mut context, _, _) = context(config);
        let err = context.start().unwrap_err();
        assert!(matches!(err, DemoSyncError::Decode { .. }));
        assert!(!context.clock().is_synchronized());
        assert!(context.audio().audio_file().is_none());
    }

    #[test]
    fn song_drives_clock_until_it_ends() {
        let dir = tempfile::tempdir().unwrap();
        let (mut context, wall, device) = context(base_config(dir.path()));
        context.start().unwrap();
        // Half a second of mono audio at 512 Hz.
        let song = AudioFile::from_samples("song", 512, 1, vec![0.1; 256]).unwrap();
        context.load_song_file(song).unwrap();
        assert!(context.clock().is_synchronized());
        assert_eq!(context.length_seconds(), Some(0.5));
        assert!(device.playing.get());

        ManualBackend::tick(&device.callback, 128);
        context.tick();
        assert_eq!(context.time_in_seconds(), 0.25);

        context.toggle_pause();
        assert!(context.audio().is_paused());
        assert!(!device.playing.get());
        context.toggle_pause();

        ManualBackend::tick(&device.callback, 128);
        context.tick();
        assert!(!context.clock().is_synchronized());
        assert_eq!(context.time_in_seconds(), 0.5);
        assert!(context.is_finished());

        wall.advance(250);
        context.tick();
        assert_eq!(context.time_in_seconds(), 0.75);
    }

    #[test]
    fn transport_reaches_audio_when_song_does_not_drive_clock() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.audio.time_source = false;
        let (mut context, wall, device) = context(config);
        context.start().unwrap();
        let song = AudioFile::from_samples("song", 512, 1, vec![0.1; 512]).unwrap();
        context.load_song_file(song).unwrap();
        assert!(!context.clock().is_synchronized());
        assert!(context.clock().is_audio_attached());

        context.toggle_pause();
        assert!(context.clock().is_pause());
        assert!(context.audio().is_paused());
        assert!(!device.playing.get());

        context.toggle_pause();
        assert!(!context.audio().is_paused());
        assert!(device.playing.get());

        context.seek(0.25);
        assert_eq!(context.time_in_seconds(), 0.25);
        assert_eq!(context.audio().time_in_seconds(), 0.25);

        wall.advance(100);
        context.tick();
        assert_eq!(context.time_in_seconds(), 0.35);
    }

    #[test]
    fn paused_clock_keeps_new_song_paused() {
        let dir = tempfile::tempdir().unwrap();
        let (mut context, _, device) = context(base_config(dir.path()));
        context.start().unwrap();
        context.toggle_pause();
        let song = AudioFile::from_samples("song", 512, 1, vec![0.1; 512]).unwrap();
        context.load_song_file(song).unwrap();
        assert!(context.audio().is_paused());
        assert!(!device.playing.get());
    }

    #[test]
    fn user_pause_over_fault_keeps_audio_and_clock_in_step() {
        let dir = tempfile::tempdir().unwrap();
        let (mut context, _, device) = context(base_config(dir.path()));
        context.start().unwrap();
        let song = AudioFile::from_samples("song", 512, 1, vec![0.1; 512]).unwrap();
        context.load_song_file(song).unwrap();

        context.clock.pause_with_reason(true, PauseReason::Fault);
        context.clock.pause(true);
        context.clock.pause_with_reason(false, PauseReason::Fault);
        assert!(context.clock().is_pause());
        assert!(context.audio().is_paused());
        assert!(!device.playing.get());

        context.clock.pause_with_reason(true, PauseReason::Fault);
        context.toggle_pause();
        assert!(!context.clock().is_pause());
        assert!(!context.audio().is_paused());
        assert!(device.playing.get());
    }

    #[test]
    fn demo_length_finishes_playback() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.demo.length_seconds = Some(2.0);
        let (mut context, wall, _) = context(config);
        context.start().unwrap();
        wall.advance(1_999);
        context.tick();
        assert!(!context.is_finished());
        wall.advance(1);
        context.tick();
        assert!(context.is_finished());

        context.seek(0.5);
        assert!(!context.is_finished());
    }

    #[test]
    fn sync_requires_tool_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (mut context, _, _) = context(base_config(dir.path()));
        assert!(matches!(
            context.connect_sync(),
            Err(DemoSyncError::Configuration(_))
        ));
        assert!(!context.is_sync_online());
    }

    #[test]
    fn editor_pauses_and_moves_the_clock() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = base_config(dir.path());
        config.tool = true;
        config.demo.beats_per_minute = 60.0;
        config.sync.rows_per_beat = 4.0;
        config.sync.host = "127.0.0.1".into();
        config.sync.port = listener.local_addr().unwrap().port();

        let editor = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut greeting = [0_u8; 19];
            stream.read_exact(&mut greeting).unwrap();
            assert_eq!(&greeting, CLIENT_GREETING);
            stream.write_all(SERVER_GREETING).unwrap();
            let mut out = Vec::new();
            ServerCommand::Pause(true).encode(&mut out);
            ServerCommand::SetRow(40).encode(&mut out);
            stream.write_all(&out).unwrap();
            // Keep the connection open until the client leaves.
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest);
        });

        let (mut context, _, _) = context(config);
        context.start().unwrap();
        context.connect_sync().unwrap();
        assert!(context.is_sync_online());

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while context.current_row() != 40.0 {
            assert!(std::time::Instant::now() < deadline, "editor commands not applied");
            context.tick();
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(context.clock().is_pause());
        assert_eq!(context.time_in_seconds(), 10.0);

        context.shutdown();
        assert!(!context.is_sync_online());
        editor.join().unwrap();
    }
}
