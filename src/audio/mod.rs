//! audio - frames, ring buffers, resampling and wire codecs
//!
//! Everything here is free of device and network concerns so it can run on
//! the hardware threads (frames, rings, pool) or the pipeline thread
//! (resampling, codecs).

pub mod codec;
pub mod frame;
#[cfg(feature = "opus-codec")]
mod opus_codec;
pub mod resample;
pub mod ring_buffer;

pub use codec::{StreamDecoder, StreamEncoder, create_decoder, create_encoder};
pub use frame::{AudioFrame, FramePool};
pub use resample::StreamResampler;
pub use ring_buffer::{Offer, RingConsumer, RingProducer, ring_buffer};
