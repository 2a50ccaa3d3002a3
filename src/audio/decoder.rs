//! Per-speaker Opus decoder
//!
//! Discord delivers 48kHz stereo Opus in 20ms frames. Each speaking turn gets
//! its own decoder so codec state never leaks between speakers.

use audiopus::{coder::Decoder, packet::Packet, Channels, MutSignals, SampleRate};
use thiserror::Error;
use tracing::trace;

use super::mixer::{CHANNELS, INPUT_SAMPLE_RATE};

/// Samples per channel in one 20ms frame at 48kHz
pub const FRAME_SIZE: usize = 960;

/// Largest Opus frame (120ms) per channel
const MAX_FRAME_SIZE: usize = 5760;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Opus error: {0}")]
    Opus(#[from] audiopus::Error),
}

/// Opus to interleaved i16 PCM, fixed to the call's channel count and rate
pub struct OpusDecoder {
    decoder: Decoder,
    decode_buffer: Vec<i16>,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, DecodeError> {
        debug_assert_eq!(INPUT_SAMPLE_RATE, 48000);
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Stereo)?;

        Ok(Self {
            decoder,
            decode_buffer: vec![0i16; MAX_FRAME_SIZE * CHANNELS],
        })
    }

    /// Decode one packet. The returned slice is interleaved stereo and always
    /// holds a whole number of sample frames.
    pub fn decode(&mut self, opus_data: &[u8]) -> Result<&[i16], DecodeError> {
        let packet = Packet::try_from(opus_data)?;
        let output = MutSignals::try_from(&mut self.decode_buffer[..])?;

        let samples_per_channel = self.decoder.decode(Some(packet), output, false)?;
        let len = samples_per_channel * CHANNELS;

        trace!("Decoded {} bytes Opus -> {} samples", opus_data.len(), len);
        Ok(&self.decode_buffer[..len])
    }
}
