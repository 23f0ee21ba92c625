//! Opus encoder/decoder at the wire rate.
//!
//! Rate and channel conversion happen in the pipeline's resample stages, so
//! both sides here run at the configured wire format.

use anyhow::Result;

use super::codec::{StreamDecoder, StreamEncoder};

fn opus_channels(channels: u16) -> opus::Channels {
    if channels == 1 {
        opus::Channels::Mono
    } else {
        opus::Channels::Stereo
    }
}

// ======================== Opus Encoder ========================

pub struct OpusEncoder {
    encoder: opus::Encoder,
    /// Scratch output, sized for the largest packet libopus emits.
    packet: Vec<u8>,
}

impl OpusEncoder {
    /// * `sample_rate` - Opus codec sample rate (8/12/16/24/48 kHz)
    /// * `channels`    - 1 or 2
    /// * `bitrate`     - Bitrate in bits/s (e.g. 32000)
    pub fn new(sample_rate: u32, channels: u16, bitrate: i32) -> Result<Self> {
        let mut encoder =
            opus::Encoder::new(sample_rate, opus_channels(channels), opus::Application::Voip)?;
        encoder.set_bitrate(opus::Bitrate::Bits(bitrate))?;
        log::info!(
            "Opus encoder: rate={}, ch={}, bitrate={}",
            sample_rate,
            channels,
            bitrate
        );
        Ok(Self {
            encoder,
            packet: vec![0u8; 4000],
        })
    }
}

impl StreamEncoder for OpusEncoder {
    /// Input must be one whole Opus frame (2.5–60 ms) of interleaved PCM.
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        let len = self.encoder.encode(pcm, &mut self.packet)?;
        Ok(self.packet[..len].to_vec())
    }
}

// ======================== Opus Decoder ========================

pub struct OpusDecoder {
    decoder: opus::Decoder,
    channels: u16,
    pcm_buf: Vec<i16>,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        let decoder = opus::Decoder::new(sample_rate, opus_channels(channels))?;
        // max 120ms @ 48kHz = 5760 samples/channel, use 6000 for safety
        let max_frame_size = 6000;
        Ok(Self {
            decoder,
            channels,
            pcm_buf: vec![0i16; max_frame_size * channels as usize],
        })
    }
}

impl StreamDecoder for OpusDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>> {
        let per_channel = self.decoder.decode(data, &mut self.pcm_buf, false)?;
        Ok(self.pcm_buf[..per_channel * self.channels as usize].to_vec())
    }
}
