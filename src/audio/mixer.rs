//! Fixed-rate PCM mixer
//!
//! Every frame tick the mixer pulls one frame from each input, pads short
//! inputs with silence, sums them and hands the result downstream. A
//! dedicated keepalive input is fed on the same tick so the output never
//! stalls, even with nobody talking.

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::SpeakerId;

/// Channel count of the internal PCM contract
pub const CHANNELS: usize = 2;

/// Sample rate of decoded speaker audio and of the encoder's input
pub const INPUT_SAMPLE_RATE: u32 = 48000;

const BYTES_PER_SAMPLE: usize = 2;

/// Frames a speaker input may hold before the oldest audio is dropped
const MAX_BUFFERED_FRAMES: usize = 25;

/// Consumer of the mixed PCM stream
pub trait PcmSink: Send + Sync {
    fn submit_audio(&self, pcm: Bytes);
}

/// Frame layout: s16le, stereo, fixed duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub frame_duration: Duration,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, frame_duration: Duration) -> Self {
        Self {
            sample_rate,
            frame_duration,
        }
    }

    /// Interleaved samples in one frame
    pub fn frame_samples(&self) -> usize {
        let per_channel =
            self.sample_rate as u64 * self.frame_duration.as_millis() as u64 / 1000;
        per_channel as usize * CHANNELS
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_samples() * BYTES_PER_SAMPLE
    }

    /// Bytes per second of output
    pub fn byte_rate(&self) -> usize {
        self.sample_rate as usize * CHANNELS * BYTES_PER_SAMPLE
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::new(INPUT_SAMPLE_RATE, Duration::from_millis(20))
    }
}

/// One source feeding the mixer
pub struct MixerInput {
    samples: Mutex<VecDeque<i16>>,
    capacity: usize,
}

impl MixerInput {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append interleaved samples. Anything past the capacity pushes out the
    /// oldest whole sample frames. Returns the number of samples dropped.
    pub fn write(&self, pcm: &[i16]) -> usize {
        // keep L/R pairs together
        let pcm = &pcm[..pcm.len() - pcm.len() % CHANNELS];
        let mut samples = self.samples.lock();
        samples.extend(pcm.iter().copied());

        let overflow = samples.len().saturating_sub(self.capacity);
        let overflow = overflow + overflow % CHANNELS;
        let len = samples.len();
        samples.drain(..overflow.min(len));
        overflow
    }

    /// Add up to `acc.len()` buffered samples into the accumulator
    fn mix_into(&self, acc: &mut [i32]) {
        let mut samples = self.samples.lock();
        let take = acc.len().min(samples.len());
        for (slot, sample) in acc.iter_mut().zip(samples.drain(..take)) {
            *slot += sample as i32;
        }
    }

    pub fn buffered_samples(&self) -> usize {
        self.samples.lock().len()
    }
}

/// Synthetic signal that keeps the mixer busy
pub struct Keepalive {
    frame: Vec<i16>,
}

impl Keepalive {
    /// Digital silence, one frame long
    pub fn silence(format: &PcmFormat) -> Self {
        Self {
            frame: vec![0; format.frame_samples()],
        }
    }

    pub fn frame(&self) -> &[i16] {
        &self.frame
    }
}

/// Combines all speaker inputs plus the keepalive into one PCM stream
pub struct Mixer {
    format: PcmFormat,
    inputs: DashMap<SpeakerId, Arc<MixerInput>>,
    keepalive_input: Arc<MixerInput>,
    keepalive: Keepalive,
    open: AtomicBool,
    clock: Mutex<Option<JoinHandle<()>>>,
}

impl Mixer {
    pub fn new(format: PcmFormat) -> Self {
        let frame_samples = format.frame_samples();
        Self {
            format,
            inputs: DashMap::new(),
            keepalive_input: Arc::new(MixerInput::new(frame_samples)),
            keepalive: Keepalive::silence(&format),
            open: AtomicBool::new(true),
            clock: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Allocate the input for a speaker, replacing any stale one
    pub fn add_input(&self, speaker: SpeakerId) -> Arc<MixerInput> {
        let input = Arc::new(MixerInput::new(
            self.format.frame_samples() * MAX_BUFFERED_FRAMES,
        ));
        self.inputs.insert(speaker, input.clone());
        input
    }

    /// Release a speaker's input. Returns false if it was already gone.
    pub fn remove_input(&self, speaker: SpeakerId, input: &Arc<MixerInput>) -> bool {
        self.inputs
            .remove_if(&speaker, |_, current| Arc::ptr_eq(current, input))
            .is_some()
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Push one keepalive frame into the dedicated input
    pub fn feed_keepalive(&self) {
        self.keepalive_input.write(self.keepalive.frame());
    }

    /// Produce exactly one output frame
    pub fn mix_frame(&self) -> Bytes {
        let mut acc = vec![0i32; self.format.frame_samples()];

        self.keepalive_input.mix_into(&mut acc);
        for input in self.inputs.iter() {
            input.value().mix_into(&mut acc);
        }

        let mut out = BytesMut::with_capacity(self.format.frame_bytes());
        for sample in acc {
            out.put_i16_le(sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16);
        }
        out.freeze()
    }

    /// Start the frame clock. Each tick feeds the keepalive and emits one frame.
    pub fn start(self: &Arc<Self>, output: Arc<dyn PcmSink>) {
        let mut clock = self.clock.lock();
        if clock.is_some() || !self.is_open() {
            return;
        }

        let mixer = Arc::clone(self);
        *clock = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(mixer.format.frame_duration);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                ticker.tick().await;
                if !mixer.is_open() {
                    break;
                }
                mixer.feed_keepalive();
                output.submit_audio(mixer.mix_frame());
            }
        }));

        info!(
            "Mixer started ({} Hz, {} ms frames, {} bytes/s)",
            self.format.sample_rate,
            self.format.frame_duration.as_millis(),
            self.format.byte_rate()
        );
    }

    /// Stop the clock and release every input. Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.clock.lock().take() {
            handle.abort();
        }
        let released = self.inputs.len();
        self.inputs.clear();
        debug!("Mixer closed, released {} inputs", released);
    }
}
