//! Wire codecs: traits plus the always-available linear16 codec.

use anyhow::Result;

use crate::config::{CodecKind, WireConfig};

/// Encodes one frame of interleaved i16 PCM at the wire rate.
pub trait StreamEncoder: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>>;
}

/// A trait for audio stream decoders that convert compressed audio data
/// into interleaved i16 PCM samples at the wire rate.
pub trait StreamDecoder: Send {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>>;
}

// ======================== linear16 ========================

/// Little-endian signed 16-bit PCM, no container.
#[derive(Debug, Default)]
pub struct PcmEncoder;

impl StreamEncoder for PcmEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(pcm.len() * 2);
        for s in pcm {
            out.extend_from_slice(&s.to_le_bytes());
        }
        Ok(out)
    }
}

/// Decoder side of linear16. Raw streams may split a sample across two
/// messages, so an odd trailing byte is carried into the next call.
#[derive(Debug, Default)]
pub struct PcmDecoder {
    carry: Option<u8>,
}

impl StreamDecoder for PcmDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 1);
        let mut bytes = data;
        if let Some(lo) = self.carry.take() {
            match bytes.split_first() {
                Some((&hi, rest)) => {
                    out.push(i16::from_le_bytes([lo, hi]));
                    bytes = rest;
                }
                None => {
                    self.carry = Some(lo);
                    return Ok(out);
                }
            }
        }
        let mut chunks = bytes.chunks_exact(2);
        for pair in &mut chunks {
            out.push(i16::from_le_bytes([pair[0], pair[1]]));
        }
        if let [last] = chunks.remainder() {
            self.carry = Some(*last);
        }
        Ok(out)
    }
}

// ======================== factories ========================

pub fn create_encoder(wire: &WireConfig) -> Result<Box<dyn StreamEncoder>> {
    match wire.codec {
        CodecKind::Pcm => Ok(Box::new(PcmEncoder)),
        #[cfg(feature = "opus-codec")]
        CodecKind::Opus => Ok(Box::new(super::opus_codec::OpusEncoder::new(
            wire.uplink_sample_rate,
            wire.channels,
            wire.opus_bitrate,
        )?)),
        #[cfg(not(feature = "opus-codec"))]
        CodecKind::Opus => anyhow::bail!("built without the `opus-codec` feature"),
    }
}

pub fn create_decoder(wire: &WireConfig) -> Result<Box<dyn StreamDecoder>> {
    match wire.codec {
        CodecKind::Pcm => Ok(Box::new(PcmDecoder::default())),
        #[cfg(feature = "opus-codec")]
        CodecKind::Opus => Ok(Box::new(super::opus_codec::OpusDecoder::new(
            wire.downlink_sample_rate,
            wire.channels,
        )?)),
        #[cfg(not(feature = "opus-codec"))]
        CodecKind::Opus => anyhow::bail!("built without the `opus-codec` feature"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_is_little_endian() {
        let bytes = PcmEncoder.encode(&[1, -2]).unwrap();
        assert_eq!(bytes, vec![0x01, 0x00, 0xFE, 0xFF]);
    }

    #[test]
    fn pcm_decoder_carries_odd_byte() {
        let mut dec = PcmDecoder::default();
        let bytes = PcmEncoder.encode(&[1000, -1000, 7]).unwrap();

        let first = dec.decode(&bytes[..3]).unwrap();
        assert_eq!(first, vec![1000]);
        let second = dec.decode(&bytes[3..]).unwrap();
        assert_eq!(second, vec![-1000, 7]);
    }

    #[test]
    fn pcm_decoder_single_byte_messages() {
        let mut dec = PcmDecoder::default();
        assert!(dec.decode(&[0x34]).unwrap().is_empty());
        assert!(dec.decode(&[]).unwrap().is_empty());
        assert_eq!(dec.decode(&[0x12]).unwrap(), vec![0x1234]);
    }

    #[cfg(not(feature = "opus-codec"))]
    #[test]
    fn opus_requires_feature() {
        let mut wire = crate::config::SessionConfig::default().wire;
        wire.codec = CodecKind::Opus;
        assert!(create_encoder(&wire).is_err());
    }
}
