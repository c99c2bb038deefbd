//! Spectrum history shared between the audio callback and rendering.
//!
//! The callback never touches [`SpectrumHistory`] directly. It publishes rows
//! into a [`SpectrumExchange`], whose pending queue the main loop swaps out in
//! constant time and replays into the history once per frame.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use crate::{DemoSyncError, Result};

/// One analysis result tagged with the stream position it was captured at.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumRow {
    pub sample_offset: u64,
    pub magnitudes: Vec<f32>,
}

impl SpectrumRow {
    pub fn new(sample_offset: u64, magnitudes: Vec<f32>) -> Self {
        Self {
            sample_offset,
            magnitudes,
        }
    }
}

/// Fixed-capacity ring of spectrum rows plus an optional seek log.
#[derive(Debug)]
pub struct SpectrumHistory {
    bins: usize,
    capacity: usize,
    ring: Vec<f32>,
    /// Row slot written next, which is also the oldest row.
    cursor: usize,
    seek_log: Option<Vec<SpectrumRow>>,
    window: Vec<f32>,
}

impl SpectrumHistory {
    /// Creates a ring of `capacity` rows by `bins` magnitudes. With
    /// `seek_log` every appended row is also kept for [`Self::seek_approx`].
    pub fn new(bins: usize, capacity: usize, seek_log: bool) -> Self {
        let bins = bins.max(1);
        let capacity = capacity.max(1);
        Self {
            bins,
            capacity,
            ring: vec![0.0; bins * capacity],
            cursor: 0,
            seek_log: seek_log.then(Vec::new),
            window: vec![0.0; bins * capacity],
        }
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_logging(&self) -> bool {
        self.seek_log.is_some()
    }

    /// Rows currently held by the seek log.
    pub fn logged_rows(&self) -> usize {
        self.seek_log.as_ref().map_or(0, Vec::len)
    }

    /// Sample offset of the most recently logged row.
    pub fn newest_offset(&self) -> Option<u64> {
        self.seek_log
            .as_ref()
            .and_then(|log| log.last())
            .map(|row| row.sample_offset)
    }

    /// [`Self::newest_offset`] in seconds of an interleaved stream.
    pub fn newest_time(&self, sample_rate: u32, channels: u16) -> Option<f64> {
        let samples_per_second = sample_rate.max(1) as f64 * channels.max(1) as f64;
        self.newest_offset()
            .map(|offset| offset as f64 / samples_per_second)
    }

    /// Inserts a row, overwriting the oldest one when the ring is full.
    pub fn append_row(&mut self, sample_offset: u64, magnitudes: &[f32]) {
        self.write_slot(magnitudes);
        if let Some(log) = self.seek_log.as_mut() {
            log.push(SpectrumRow::new(sample_offset, magnitudes.to_vec()));
        }
    }

    fn write_slot(&mut self, magnitudes: &[f32]) {
        let start = self.cursor * self.bins;
        let slot = &mut self.ring[start..start + self.bins];
        let copied = magnitudes.len().min(self.bins);
        slot[..copied].copy_from_slice(&magnitudes[..copied]);
        slot[copied..].fill(0.0);
        self.cursor = (self.cursor + 1) % self.capacity;
    }

    /// Row-major magnitudes ordered oldest to newest, `capacity * bins` long.
    pub fn current_window(&mut self) -> &[f32] {
        let split = self.cursor * self.bins;
        let tail = self.ring.len() - split;
        self.window[..tail].copy_from_slice(&self.ring[split..]);
        self.window[tail..].copy_from_slice(&self.ring[..split]);
        &self.window
    }

    /// Zeroes the ring and forgets the seek log.
    pub fn clear(&mut self) {
        self.ring.fill(0.0);
        self.cursor = 0;
        if let Some(log) = self.seek_log.as_mut() {
            log.clear();
        }
    }

    /// Rebuilds the ring so that its newest row is the logged row closest in
    /// capture order to `target` (within `tolerance` samples), followed
    /// backwards by the rows captured before it. Leaves the ring untouched
    /// when nothing matches.
    pub fn seek_approx(&mut self, target: u64, tolerance: u64) -> Result<()> {
        let Some(log) = self.seek_log.as_ref() else {
            return Ok(());
        };
        let (Some(first), Some(last)) = (log.first(), log.last()) else {
            tracing::trace!(target, "no spectrum rows logged, nothing to rewind");
            return Ok(());
        };

        let Some(matched) = log
            .iter()
            .rposition(|row| row.sample_offset.abs_diff(target) <= tolerance)
        else {
            tracing::warn!(
                target,
                tolerance,
                logged = log.len(),
                min_offset = first.sample_offset,
                max_offset = last.sample_offset,
                "no spectrum row found for seek"
            );
            return Err(DemoSyncError::SeekMiss { target, tolerance });
        };

        self.ring.fill(0.0);
        for (slot, row) in (0..self.capacity).rev().zip(log[..=matched].iter().rev()) {
            let start = slot * self.bins;
            let copied = row.magnitudes.len().min(self.bins);
            self.ring[start..start + copied].copy_from_slice(&row.magnitudes[..copied]);
        }
        self.cursor = 0;
        Ok(())
    }
}

/// Double buffer between the capture callback and the main loop.
#[derive(Debug)]
pub struct SpectrumExchange {
    bins: usize,
    capacity: usize,
    pending: Mutex<PendingRows>,
    front: Mutex<VecDeque<SpectrumRow>>,
}

#[derive(Debug)]
struct PendingRows {
    rows: VecDeque<SpectrumRow>,
    spare: Vec<Vec<f32>>,
    dropped: u64,
}

impl SpectrumExchange {
    /// Holds at most `capacity` unconsumed rows of `bins` magnitudes.
    pub fn new(bins: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bins,
            capacity,
            pending: Mutex::new(PendingRows {
                rows: VecDeque::with_capacity(capacity),
                spare: (0..capacity).map(|_| Vec::with_capacity(bins)).collect(),
                dropped: 0,
            }),
            front: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Callback side. Returns `false` without waiting when the main loop
    /// currently holds the pending queue.
    pub fn publish(&self, sample_offset: u64, magnitudes: &[f32]) -> bool {
        let Ok(mut pending) = self.pending.try_lock() else {
            return false;
        };

        let recycled = if pending.rows.len() >= self.capacity {
            pending.dropped += 1;
            pending.rows.pop_front().map(|row| row.magnitudes)
        } else {
            pending.spare.pop()
        };
        let mut buffer = recycled.unwrap_or_else(|| Vec::with_capacity(self.bins));
        buffer.clear();
        buffer.extend_from_slice(magnitudes);
        pending.rows.push_back(SpectrumRow::new(sample_offset, buffer));
        true
    }

    /// Main-loop side: moves every pending row into `history`, oldest first.
    /// Returns the number of rows applied.
    pub fn drain_into(&self, history: &mut SpectrumHistory) -> Result<usize> {
        let mut front = lock(&self.front)?;
        let dropped = {
            let mut pending = lock(&self.pending)?;
            std::mem::swap(&mut pending.rows, &mut *front);
            std::mem::take(&mut pending.dropped)
        };
        if dropped > 0 {
            tracing::warn!(dropped, "spectrum rows overwritten before the main loop read them");
        }

        let applied = front.len();
        let mut buffers = Vec::with_capacity(applied);
        for row in front.drain(..) {
            history.append_row(row.sample_offset, &row.magnitudes);
            buffers.push(row.magnitudes);
        }
        lock(&self.pending)?.spare.extend(buffers);
        Ok(applied)
    }

    /// Drops every pending row.
    pub fn discard(&self) -> Result<()> {
        let mut pending = lock(&self.pending)?;
        let rows: Vec<_> = pending.rows.drain(..).map(|row| row.magnitudes).collect();
        pending.spare.extend(rows);
        pending.dropped = 0;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| DemoSyncError::msg("spectrum exchange has been poisoned"))
}
