//! Audio module for decoding and mixing
//!
//! Handles per-speaker Opus decode and the fixed-rate PCM mix

pub mod decoder;
pub mod mixer;
pub mod session;

pub use mixer::{Mixer, PcmFormat, PcmSink};
pub use session::{SourceEvent, SpeakerHub, SpeakerSource};

use std::fmt;

/// Stable identifier of a speaker within a call (the RTP SSRC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpeakerId(pub u32);

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
