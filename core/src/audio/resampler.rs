//! Fractional sample-rate conversion driven by the latency tuner.
//!
//! Two quality profiles: `High` runs a polyphase sinc FIR, `Low` a linear
//! interpolator. Both consume `output_rate x scaling` input samples per
//! `output_rate` output samples; the scaling knob is how the latency tuner
//! trades buffer level against pitch.

use rubato::{
    FastFixedOut, PolynomialDegree, Resampler as RubatoResampler, SincFixedOut,
    SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Resampler quality profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResamplerProfile {
    /// Polyphase sinc FIR.
    High,
    /// Linear interpolation.
    Low,
}

/// Output frames produced per processing chunk.
const CHUNK_SIZE: usize = 512;

const SINC_LEN: usize = 128;

enum Backend {
    Sinc(SincFixedOut<f32>),
    Fast(FastFixedOut<f32>),
    /// Rates match and tuning is off; input copies straight through.
    Passthrough,
}

/// Streaming fractional resampler over interleaved f32 PCM.
///
/// Output is pulled: [`Resampler::read`] fills an output slice, requesting
/// exactly as much input as the current ratio demands through the `fill`
/// callback. The callback always fills its whole slice (the depacketizer
/// produces silence when it runs dry) and returns the frame flag bits of the
/// data it produced.
pub struct Resampler {
    backend: Backend,
    channels: usize,
    /// Deinterleaved staging for one input chunk.
    chunk_in: Vec<Vec<f32>>,
    /// Interleaved staging handed to the fill callback.
    fill_buf: Vec<f32>,
    /// Interleaved output spillover not yet consumed.
    out_fifo: Vec<f32>,
    /// Flag bits accumulated from inputs since the last read drained.
    pending_flags: u8,
    scaling: f64,
}

impl Resampler {
    /// Creates a resampler converting `in_rate` to `out_rate`.
    ///
    /// When the rates match and `tuned` is false the resampler is a
    /// passthrough with no added latency.
    pub fn new(
        profile: ResamplerProfile,
        in_rate: u32,
        out_rate: u32,
        channels: u16,
        tuned: bool,
    ) -> Result<Self> {
        let channels = channels as usize;
        let ratio = out_rate as f64 / in_rate as f64;

        let backend = if in_rate == out_rate && !tuned {
            Backend::Passthrough
        } else {
            match profile {
                ResamplerProfile::High => {
                    let parameters = SincInterpolationParameters {
                        sinc_len: SINC_LEN,
                        f_cutoff: 0.95,
                        interpolation: SincInterpolationType::Linear,
                        oversampling_factor: 256,
                        window: WindowFunction::BlackmanHarris2,
                    };
                    let inner =
                        SincFixedOut::new(ratio, 2.0, parameters, CHUNK_SIZE, channels)
                            .map_err(|e| {
                                debug!(error = %e, "resampler: sinc construction failed");
                                Error::BadOperation
                            })?;
                    Backend::Sinc(inner)
                }
                ResamplerProfile::Low => {
                    let inner = FastFixedOut::new(
                        ratio,
                        2.0,
                        PolynomialDegree::Linear,
                        CHUNK_SIZE,
                        channels,
                    )
                    .map_err(|e| {
                        debug!(error = %e, "resampler: fast construction failed");
                        Error::BadOperation
                    })?;
                    Backend::Fast(inner)
                }
            }
        };

        Ok(Resampler {
            backend,
            channels,
            chunk_in: vec![Vec::new(); channels],
            fill_buf: Vec::new(),
            out_fifo: Vec::new(),
            pending_flags: 0,
            scaling: 1.0,
        })
    }

    /// True when input copies straight to output.
    pub fn is_passthrough(&self) -> bool {
        matches!(self.backend, Backend::Passthrough)
    }

    /// Applies the tuner's scaling factor: the resampler consumes
    /// `scaling x` nominal input per output sample.
    pub fn set_scaling(&mut self, scaling: f64) {
        if (scaling - self.scaling).abs() < 1e-9 {
            return;
        }
        self.scaling = scaling;
        // More input per output means a lower output/input ratio.
        let rel = 1.0 / scaling;
        let result = match &mut self.backend {
            Backend::Sinc(inner) => inner.set_resample_ratio_relative(rel, true),
            Backend::Fast(inner) => inner.set_resample_ratio_relative(rel, true),
            Backend::Passthrough => Ok(()),
        };
        if let Err(e) = result {
            debug!(error = %e, scaling, "resampler: ratio update rejected");
        }
    }

    /// Input frames currently buffered, in output-rate frames. Counts toward
    /// the session's queue latency.
    pub fn buffered_output_frames(&self) -> usize {
        self.out_fifo.len() / self.channels.max(1)
    }

    /// Fills `out` (interleaved) with resampled data, pulling input through
    /// `fill`. Returns the OR of the flag bits reported by `fill` for all
    /// input consumed to produce this output.
    pub fn read(
        &mut self,
        out: &mut [f32],
        mut fill: impl FnMut(&mut [f32]) -> u8,
    ) -> Result<u8> {
        debug_assert!(out.len() % self.channels == 0);

        if let Backend::Passthrough = self.backend {
            let flags = fill(out);
            return Ok(flags);
        }

        while self.out_fifo.len() < out.len() {
            let need = match &self.backend {
                Backend::Sinc(inner) => inner.input_frames_next(),
                Backend::Fast(inner) => inner.input_frames_next(),
                Backend::Passthrough => unreachable!(),
            };

            self.fill_buf.clear();
            self.fill_buf.resize(need * self.channels, 0.0);
            self.pending_flags |= fill(&mut self.fill_buf);

            for ch in &mut self.chunk_in {
                ch.clear();
            }
            for (i, &sample) in self.fill_buf.iter().enumerate() {
                self.chunk_in[i % self.channels].push(sample);
            }

            let output = match &mut self.backend {
                Backend::Sinc(inner) => inner.process(&self.chunk_in, None),
                Backend::Fast(inner) => inner.process(&self.chunk_in, None),
                Backend::Passthrough => unreachable!(),
            }
            .map_err(|e| {
                debug!(error = %e, "resampler: processing failed");
                Error::BadOperation
            })?;

            let frames_out = output[0].len();
            for frame in 0..frames_out {
                for ch in 0..self.channels {
                    self.out_fifo.push(output[ch][frame]);
                }
            }
        }

        out.copy_from_slice(&self.out_fifo[..out.len()]);
        self.out_fifo.drain(..out.len());
        Ok(std::mem::take(&mut self.pending_flags))
    }
}
