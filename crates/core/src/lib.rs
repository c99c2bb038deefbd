//! Core library of the demosync playback engine.
//!
//! A production is driven by one [`PlaybackContext`]: a [`Clock`] that may
//! follow the song played by [`AudioClockSource`], a spectrum history filled
//! from the audio callback, and [`KeyframeTrackStore`] tracks that can be
//! edited live through a [`LiveSyncSession`].

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod playback;
pub mod spectrum;
pub mod sync;
pub mod timeline;
pub mod tracks;

pub use analysis::SpectrumAnalyzer;
pub use audio::{AudioBackend, AudioClockSource, AudioFile, HeadlessBackend, StreamFormat};
pub use config::{AppConfig, AudioConfig, BackendKind, DemoConfig, FftConfig, SyncConfig};
pub use error::{DemoSyncError, Result};
pub use playback::PlaybackContext;
pub use spectrum::{SpectrumHistory, SpectrumRow};
pub use sync::{LiveSyncSession, Transport};
pub use timeline::{
    format_time, Clock, ManualWallClock, PauseReason, SystemWallClock, TimeSource, WallClock,
};
pub use tracks::{
    DocumentTrack, Interpolation, KeyframeTrack, KeyframeTrackStore, SaveTarget, TrackDocument,
    TrackKey, TrackSource,
};
