use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use ringbuf::HeapProd;

use super::AudioCallback;
use crate::{DemoSyncError, Result};

/// Negotiated output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per callback.
    pub buffer_frames: usize,
}

impl StreamFormat {
    /// Interleaved samples consumed by one callback.
    pub fn buffer_samples(&self) -> u64 {
        self.buffer_frames as u64 * self.channels as u64
    }

    pub fn buffer_duration(&self) -> Duration {
        Duration::from_secs_f64(self.buffer_frames as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Output device capability used by [`super::AudioClockSource`].
///
/// The backend owns the device and drives the [`AudioCallback`] it receives
/// in [`AudioBackend::open`]; position tracking and seeking live in the
/// callback's shared state, so every backend gets them for free.
pub trait AudioBackend {
    fn name(&self) -> &'static str;

    /// Opens the device for `requested`, returning the format the device
    /// actually runs at. The device starts paused.
    fn open(&mut self, requested: StreamFormat, callback: AudioCallback) -> Result<StreamFormat>;

    fn play(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    /// Tears the device down synchronously, capture input included.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Names of the output devices this backend can open.
    fn output_devices(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Starts recording from the input device into `feed`, in the format the
    /// output was opened with. Follows the output's play and pause.
    fn open_capture(&mut self, _format: StreamFormat, _feed: HeapProd<f32>) -> Result<()> {
        Err(DemoSyncError::DeviceUnavailable(format!(
            "{} backend has no capture input",
            self.name()
        )))
    }
}

/// Backend for machines without audio hardware: a worker thread invokes the
/// callback at buffer cadence and discards the output, so the stream still
/// advances as an elapsed-sample counter.
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    worker: Option<HeadlessWorker>,
}

#[derive(Debug)]
struct HeadlessWorker {
    running: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn open(&mut self, requested: StreamFormat, mut callback: AudioCallback) -> Result<StreamFormat> {
        self.close();

        let running = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));
        let interval = requested.buffer_duration();
        let mut buffer = vec![0.0_f32; requested.buffer_samples() as usize];

        let thread = {
            let running = running.clone();
            let stopping = stopping.clone();
            thread::Builder::new()
                .name("demosync-headless-audio".to_string())
                .spawn(move || {
                    let mut deadline = Instant::now();
                    while !stopping.load(Ordering::Acquire) {
                        if running.load(Ordering::Acquire) {
                            callback.process(&mut buffer);
                        }
                        deadline += interval;
                        let now = Instant::now();
                        if deadline > now {
                            thread::sleep(deadline - now);
                        } else {
                            deadline = now;
                        }
                    }
                })
                .map_err(|err| DemoSyncError::DeviceUnavailable(err.to_string()))?
        };

        self.worker = Some(HeadlessWorker {
            running,
            stopping,
            thread,
        });
        tracing::debug!(
            sample_rate = requested.sample_rate,
            channels = requested.channels,
            buffer_frames = requested.buffer_frames,
            "headless audio opened"
        );
        Ok(requested)
    }

    fn play(&mut self) -> Result<()> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| DemoSyncError::msg("headless audio is not open"))?;
        worker.running.store(true, Ordering::Release);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.as_ref() {
            worker.running.store(false, Ordering::Release);
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::Release);
            worker.stopping.store(true, Ordering::Release);
            if worker.thread.join().is_err() {
                tracing::error!("headless audio thread panicked");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Backend that keeps the callback so tests can drive it by hand.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct ManualBackend {
    pub callback: std::rc::Rc<std::cell::RefCell<Option<AudioCallback>>>,
    pub playing: std::rc::Rc<std::cell::Cell<bool>>,
    pub capture: std::rc::Rc<std::cell::RefCell<Option<HeapProd<f32>>>>,
    pub fail_open: bool,
}

#[cfg(test)]
impl ManualBackend {
    /// Runs one device callback producing `samples` interleaved samples.
    pub fn tick(
        callback: &std::cell::RefCell<Option<AudioCallback>>,
        samples: usize,
    ) {
        let mut out = vec![0.0; samples];
        if let Some(callback) = callback.borrow_mut().as_mut() {
            callback.process(&mut out);
        }
    }
}

#[cfg(test)]
impl AudioBackend for ManualBackend {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn open(&mut self, requested: StreamFormat, callback: AudioCallback) -> Result<StreamFormat> {
        if self.fail_open {
            return Err(DemoSyncError::DeviceUnavailable("unplugged".into()));
        }
        *self.callback.borrow_mut() = Some(callback);
        Ok(requested)
    }

    fn play(&mut self) -> Result<()> {
        self.playing.set(true);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.playing.set(false);
        Ok(())
    }

    fn close(&mut self) {
        self.playing.set(false);
        self.callback.borrow_mut().take();
        self.capture.borrow_mut().take();
    }

    fn is_open(&self) -> bool {
        self.callback.borrow().is_some()
    }

    fn output_devices(&self) -> Result<Vec<String>> {
        Ok(vec!["manual".to_string()])
    }

    fn open_capture(&mut self, _format: StreamFormat, feed: HeapProd<f32>) -> Result<()> {
        *self.capture.borrow_mut() = Some(feed);
        Ok(())
    }
}
