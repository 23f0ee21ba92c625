//! Channel conversion and sample-rate conversion on interleaved i16 PCM.
//!
//! Rate conversion goes through `rubato`. The pipeline owns one
//! [`StreamResampler`] per direction for the whole session, so filter state
//! carries across frames and across message boundaries on the raw downlink.

use rubato::{FastFixedIn, PolynomialDegree, Resampler as _};

use crate::error::PipelineError;

const SCALE: f32 = 32768.0;

/// Convert interleaved samples from `from` channels to `to` channels.
///
/// - many → mono: average all channels
/// - same count: passthrough
/// - otherwise: wrap source channels (mono → stereo duplicates)
pub fn convert_channels(pcm: &[i16], from: u16, to: u16) -> Vec<i16> {
    let from = from.max(1) as usize;
    let to = to.max(1) as usize;
    let frames = pcm.len() / from;

    if from == to {
        return pcm[..frames * from].to_vec();
    }
    if to == 1 {
        return pcm
            .chunks_exact(from)
            .map(|f| (f.iter().map(|&s| s as i32).sum::<i32>() / from as i32) as i16)
            .collect();
    }

    let mut out = vec![0i16; frames * to];
    for i in 0..frames {
        for c in 0..to {
            out[i * to + c] = pcm[i * from + (c % from)];
        }
    }
    out
}

fn build(
    from_rate: u32,
    to_rate: u32,
    channels: usize,
    chunk: usize,
) -> Result<FastFixedIn<f32>, PipelineError> {
    FastFixedIn::new(
        to_rate as f64 / from_rate as f64,
        1.0,
        PolynomialDegree::Cubic,
        chunk,
        channels,
    )
    .map_err(|e| PipelineError::Resample(e.to_string()))
}

fn to_i16(s: f32) -> i16 {
    (s * SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

fn interleave(planar: &[Vec<f32>], out: &mut Vec<i16>) {
    let frames = planar.first().map_or(0, Vec::len);
    out.reserve(frames * planar.len());
    for i in 0..frames {
        for channel in planar {
            out.push(to_i16(channel[i]));
        }
    }
}

/// Stateful rate converter between two fixed sample rates.
///
/// Input is buffered until a whole chunk is available, so the output does
/// not depend on how the caller splits the stream.
pub struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    channels: usize,
    chunk: usize,
    /// `None` when both rates match.
    inner: Option<FastFixedIn<f32>>,
    /// Deinterleaved input waiting for a whole chunk.
    pending: Vec<Vec<f32>>,
}

impl StreamResampler {
    /// `chunk` is the number of input frames converted per step.
    pub fn new(from_rate: u32, to_rate: u32, channels: u16, chunk: usize) -> Result<Self, PipelineError> {
        let channels = channels.max(1) as usize;
        let chunk = chunk.max(1);
        let inner = if from_rate == to_rate {
            None
        } else {
            Some(build(from_rate, to_rate, channels, chunk)?)
        };
        Ok(Self {
            from_rate,
            to_rate,
            channels,
            chunk,
            inner,
            pending: vec![Vec::with_capacity(chunk * 2); channels],
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Input frames buffered short of a chunk.
    pub fn pending(&self) -> usize {
        self.pending[0].len()
    }

    /// Feed interleaved samples and return whatever output is ready.
    pub fn process(&mut self, pcm: &[i16]) -> Result<Vec<i16>, PipelineError> {
        let Some(inner) = self.inner.as_mut() else {
            let whole = pcm.len() / self.channels * self.channels;
            return Ok(pcm[..whole].to_vec());
        };

        for frame in pcm.chunks_exact(self.channels) {
            for (channel, &s) in self.pending.iter_mut().zip(frame) {
                channel.push(s as f32 / SCALE);
            }
        }

        let mut out = Vec::new();
        loop {
            let need = inner.input_frames_next();
            if self.pending[0].len() < need {
                break;
            }
            let chunk: Vec<&[f32]> = self.pending.iter().map(|c| &c[..need]).collect();
            let converted = inner
                .process(&chunk, None)
                .map_err(|e| PipelineError::Resample(e.to_string()))?;
            interleave(&converted, &mut out);
            for channel in &mut self.pending {
                channel.drain(..need);
            }
        }
        Ok(out)
    }

    /// Push buffered input out (zero-padded to a chunk) and start over with
    /// fresh filter state.
    pub fn flush(&mut self) -> Result<Vec<i16>, PipelineError> {
        let mut out = Vec::new();
        if let Some(inner) = self.inner.as_mut() {
            if !self.pending[0].is_empty() {
                let converted = inner
                    .process_partial(Some(self.pending.as_slice()), None)
                    .map_err(|e| PipelineError::Resample(e.to_string()))?;
                interleave(&converted, &mut out);
            }
        }
        self.reset()?;
        Ok(out)
    }

    /// Forget buffered input and filter history.
    pub fn reset(&mut self) -> Result<(), PipelineError> {
        for channel in &mut self.pending {
            channel.clear();
        }
        if self.inner.is_some() {
            self.inner = Some(build(self.from_rate, self.to_rate, self.channels, self.chunk)?);
        }
        Ok(())
    }
}
