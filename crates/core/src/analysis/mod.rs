use std::{fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{config::FftConfig, DemoSyncError, Result};

/// Reduces one audio buffer to a row of normalised magnitude bins.
///
/// All buffers are allocated up front so [`SpectrumAnalyzer::analyze`] can run
/// inside the audio callback without touching the allocator.
pub struct SpectrumAnalyzer {
    window: usize,
    bins: usize,
    divisor: f32,
    clip_min: f32,
    clip_max: f32,
    plan: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
    row: Vec<f32>,
}

impl SpectrumAnalyzer {
    /// Creates an analyzer over `window` frames producing `config.size` bins.
    pub fn new(window: usize, config: &FftConfig) -> Result<Self> {
        if window < 2 || config.size == 0 || config.size > window {
            return Err(DemoSyncError::config(format!(
                "cannot reduce a {window} sample window to {} bins",
                config.size
            )));
        }

        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(window);
        let input = plan.make_input_vec();
        let spectrum = plan.make_output_vec();
        let scratch = plan.make_scratch_vec();
        Ok(Self {
            window,
            bins: config.size,
            divisor: config.divisor,
            clip_min: config.clip_min,
            clip_max: config.clip_max,
            plan,
            input,
            spectrum,
            scratch,
            row: vec![0.0; config.size],
        })
    }

    /// Analyses the first channel of an interleaved buffer. Frames beyond the
    /// end of `interleaved` are treated as silence.
    pub fn analyze(&mut self, interleaved: &[f32], channels: usize) -> Result<&[f32]> {
        let channels = channels.max(1);
        for (index, slot) in self.input.iter_mut().enumerate() {
            *slot = interleaved.get(index * channels).copied().unwrap_or(0.0);
        }

        self.plan
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
            .map_err(|err| DemoSyncError::msg(format!("fft failed: {err}")))?;

        // The half spectrum mirrors onto the upper bins of the full transform.
        let stride = self.window / self.bins;
        for (bin, value) in self.row.iter_mut().enumerate() {
            let start = bin * stride;
            let sum: f32 = (start..start + stride)
                .map(|index| {
                    let mirrored = index.min(self.window - index);
                    self.spectrum[mirrored].norm()
                })
                .sum();
            *value = (sum / stride as f32 / self.divisor).clamp(self.clip_min, self.clip_max);
        }

        Ok(&self.row)
    }
}

impl fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("window", &self.window)
            .field("bins", &self.bins)
            .field("divisor", &self.divisor)
            .field("clip", &(self.clip_min, self.clip_max))
            .finish()
    }
}
