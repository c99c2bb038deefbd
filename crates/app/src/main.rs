use std::{path::PathBuf, sync::Arc, thread, time::Duration};

use clap::{Parser, Subcommand};
use demosync_core::{
    format_time, AppConfig, AudioClockSource, DemoSyncError, KeyframeTrackStore, PlaybackContext,
    SystemWallClock,
};
use tracing_subscriber::EnvFilter;

fn main() -> demosync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play {
            config,
            song,
            fps,
            seconds,
            connect,
        } => {
            let mut config = load_config(config.as_ref())?;
            if song.is_some() {
                config.demo.song = song;
            }
            config.tool |= connect;
            run_play(config, fps, seconds, connect)
        }
        Commands::Tracks {
            config,
            from,
            to,
            step,
        } => run_tracks(&load_config(config.as_ref())?, from, to, step),
        Commands::Convert { config } => run_convert(&load_config(config.as_ref())?),
        Commands::Devices { config } => run_devices(&load_config(config.as_ref())?),
    }
}

fn load_config(path: Option<&PathBuf>) -> demosync_core::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path),
        None => Ok(AppConfig::default()),
    }
}

fn run_play(
    mut config: AppConfig,
    fps: u32,
    seconds: Option<f64>,
    connect: bool,
) -> demosync_core::Result<()> {
    if fps == 0 {
        return Err(DemoSyncError::config("fps must be at least 1"));
    }
    let song = config.demo.song.take();
    let mut context = PlaybackContext::new(config)?;
    tracing::info!(backend = context.audio().backend_name(), fps, "starting playback");

    context.start()?;
    if let Some(song) = song {
        match context.load_song(&song) {
            Ok(()) => tracing::info!(song = %song.display(), "playing song"),
            Err(err @ (DemoSyncError::DeviceUnavailable(_) | DemoSyncError::Decode { .. })) => {
                tracing::warn!(%err, "continuing without audio");
            }
            Err(err) => return Err(err),
        }
    }
    if connect {
        if let Err(err) = context.connect_sync() {
            tracing::warn!(%err, "editor not reachable, using tracks from disk");
        }
    }

    let frame = Duration::from_secs_f64(1.0 / f64::from(fps));
    let mut reported = None;
    loop {
        context.tick();

        let now = context.time_in_seconds();
        let second = now.floor() as i64;
        if reported != Some(second) {
            reported = Some(second);
            let peak = context.with_spectrum_window(|window| {
                window.iter().copied().fold(0.0_f32, f32::max)
            });
            tracing::info!(
                time = %format_time(context.clock().time_in_milliseconds()),
                row = context.current_row(),
                paused = context.clock().is_pause(),
                sync = context.is_sync_online(),
                peak,
                "status"
            );
        }

        if context.is_finished() || seconds.is_some_and(|limit| now >= limit) {
            break;
        }
        thread::sleep(frame);
    }

    context.shutdown();
    tracing::info!("playback finished");
    Ok(())
}

fn run_tracks(config: &AppConfig, from: f64, to: f64, step: f64) -> demosync_core::Result<()> {
    if !(step > 0.0) {
        return Err(DemoSyncError::config("step must be positive"));
    }
    config.validate()?;
    let store = KeyframeTrackStore::load(&config.sync)?;
    if store.is_empty() {
        tracing::warn!(directory = %config.sync.directory.display(), "no tracks found");
        return Ok(());
    }

    let names: Vec<&str> = store.tracks().iter().map(|track| track.name()).collect();
    println!("time\trow\t{}", names.join("\t"));

    let beats_per_second = config.demo.beats_per_minute / 60.0;
    let mut index = 0_u32;
    loop {
        let seconds = from + f64::from(index) * step;
        if seconds > to {
            break;
        }
        let row = store.row_at_beats(seconds * beats_per_second);
        let values: Vec<String> = store
            .tracks()
            .iter()
            .map(|track| format!("{:.4}", track.value(row)))
            .collect();
        println!("{seconds:.3}\t{row:.2}\t{}", values.join("\t"));
        index += 1;
    }
    Ok(())
}

fn run_convert(config: &AppConfig) -> demosync_core::Result<()> {
    let store = KeyframeTrackStore::load(&config.sync)?;
    let path = config.sync.document_path();
    store.write_document(&path)?;
    tracing::info!(path = %path.display(), tracks = store.len(), "wrote key-frame document");
    Ok(())
}

fn run_devices(config: &AppConfig) -> demosync_core::Result<()> {
    let audio = AudioClockSource::new(config, Arc::new(SystemWallClock::new()));
    let devices = audio.output_devices()?;
    if devices.is_empty() {
        tracing::warn!(backend = audio.backend_name(), "no output devices listed");
    }
    for name in devices {
        println!("{name}");
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Music-synchronized demo playback engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the headless frame loop.
    Play {
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Song to play instead of the configured one.
        #[arg(short, long)]
        song: Option<PathBuf>,
        #[arg(long, default_value_t = 60)]
        fps: u32,
        /// Stop after this many seconds of demo time.
        #[arg(long)]
        seconds: Option<f64>,
        /// Connect to the key-frame editor (enables tool mode).
        #[arg(long)]
        connect: bool,
    },
    /// Print track values over a time range.
    Tracks {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 0.0)]
        from: f64,
        #[arg(long, default_value_t = 10.0)]
        to: f64,
        #[arg(long, default_value_t = 0.5)]
        step: f64,
    },
    /// Write the loaded tracks as the structured key-frame document.
    Convert {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// List the output devices `audio.device` can name.
    Devices {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
