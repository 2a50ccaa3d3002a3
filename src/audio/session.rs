//! Speaker sessions
//!
//! One session per speaking turn: a decoder, a mixer input and the task that
//! drives them from the speaker's packet stream. Whatever ends the stream
//! (end, close or error) tears the session down, exactly once.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::decoder::OpusDecoder;
use super::mixer::{Mixer, MixerInput};
use super::SpeakerId;
use bytes::Bytes;

/// What the voice provider delivers on a speaker stream
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// One compressed Opus frame
    Frame(Bytes),
    /// The speaker stopped talking
    End,
    /// The provider failed the stream
    Error(String),
}

/// Per-speaker stream. The sender being dropped is the close signal.
pub type SpeakerSource = mpsc::UnboundedReceiver<SourceEvent>;

/// Why a session went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownCause {
    End,
    Close,
    Error,
    Shutdown,
}

/// Live decode pipeline for one speaker
pub struct SpeakerSession {
    speaker: SpeakerId,
    input: Arc<MixerInput>,
    cleaned_up: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SpeakerSession {
    fn new(speaker: SpeakerId, input: Arc<MixerInput>) -> Self {
        Self {
            speaker,
            input,
            cleaned_up: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }
}

/// Registry of live speaker sessions feeding one mixer
pub struct SpeakerHub {
    mixer: Arc<Mixer>,
    sessions: DashMap<SpeakerId, Arc<SpeakerSession>>,
    running: AtomicBool,
}

impl SpeakerHub {
    pub fn new(mixer: Arc<Mixer>) -> Self {
        Self {
            mixer,
            sessions: DashMap::new(),
            running: AtomicBool::new(true),
        }
    }

    /// Start decoding a speaker's stream into the mixer.
    ///
    /// Returns false without touching anything if the speaker already has a
    /// live session, or if the hub has been shut down.
    pub fn attach_speaker(self: &Arc<Self>, speaker: SpeakerId, source: SpeakerSource) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }

        let (session, decoder) = match self.sessions.entry(speaker) {
            Entry::Occupied(_) => {
                debug!("Speaker {} already attached, ignoring", speaker);
                return false;
            }
            Entry::Vacant(entry) => {
                let decoder = match OpusDecoder::new() {
                    Ok(decoder) => decoder,
                    Err(e) => {
                        error!("Failed to create decoder for speaker {}: {}", speaker, e);
                        return false;
                    }
                };
                let input = self.mixer.add_input(speaker);
                let session = Arc::new(SpeakerSession::new(speaker, input));
                entry.insert(session.clone());
                (session, decoder)
            }
        };

        let handle = tokio::spawn(drive_session(
            Arc::clone(self),
            session.clone(),
            decoder,
            source,
        ));
        *session.task.lock() = Some(handle);

        // a shutdown that swept the registry before the task was stored
        // could not stop it
        if !self.running.load(Ordering::SeqCst) {
            self.teardown(&session, TeardownCause::Shutdown);
            if let Some(handle) = session.task.lock().take() {
                handle.abort();
            }
            return false;
        }

        debug!(
            "Speaker {} attached ({} mixer inputs)",
            speaker,
            self.mixer.input_count()
        );
        true
    }

    /// Release the session's mixer input and decoder and forget it.
    /// Only the first call for a session does anything.
    pub fn teardown(&self, session: &Arc<SpeakerSession>, cause: TeardownCause) -> bool {
        if session.cleaned_up.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.mixer.remove_input(session.speaker, &session.input);
        self.sessions
            .remove_if(&session.speaker, |_, current| Arc::ptr_eq(current, session));
        if cause == TeardownCause::Shutdown {
            if let Some(handle) = session.task.lock().take() {
                handle.abort();
            }
        }

        debug!("Speaker {} detached ({:?})", session.speaker, cause);
        true
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Tear down every session, then close the mixer. Safe to call twice.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let sessions: Vec<Arc<SpeakerSession>> =
            self.sessions.iter().map(|r| r.value().clone()).collect();
        for session in &sessions {
            self.teardown(session, TeardownCause::Shutdown);
        }
        self.mixer.shutdown();

        info!("Speaker hub shut down ({} sessions closed)", sessions.len());
    }
}

async fn drive_session(
    hub: Arc<SpeakerHub>,
    session: Arc<SpeakerSession>,
    mut decoder: OpusDecoder,
    mut source: SpeakerSource,
) {
    let speaker = session.speaker;
    let cause = loop {
        match source.recv().await {
            Some(SourceEvent::Frame(packet)) => match decoder.decode(&packet) {
                Ok(pcm) => {
                    let dropped = session.input.write(pcm);
                    if dropped > 0 {
                        debug!(
                            "Speaker {} input full, dropped {} samples ({} buffered)",
                            speaker,
                            dropped,
                            session.input.buffered_samples()
                        );
                    }
                }
                // a bad frame is not the end of the stream
                Err(e) => warn!("Opus decode error for speaker {}: {}", speaker, e),
            },
            Some(SourceEvent::End) => break TeardownCause::End,
            Some(SourceEvent::Error(reason)) => {
                warn!("Stream error for speaker {}: {}", speaker, reason);
                break TeardownCause::Error;
            }
            None => break TeardownCause::Close,
        }
    };

    hub.teardown(&session, cause);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decoder::tests::encode_frame;
    use crate::audio::mixer::PcmFormat;
    use std::time::Duration;

    fn hub() -> (Arc<SpeakerHub>, Arc<Mixer>) {
        let mixer = Arc::new(Mixer::new(PcmFormat::default()));
        (Arc::new(SpeakerHub::new(mixer.clone())), mixer)
    }

    fn session_of(hub: &SpeakerHub, id: u32) -> Arc<SpeakerSession> {
        hub.sessions.get(&SpeakerId(id)).unwrap().clone()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_one_session_per_speaker() {
        let (hub, mixer) = hub();
        let (_tx1, rx1) = mpsc::unbounded_channel();
        let (_tx2, rx2) = mpsc::unbounded_channel();
        let (_tx3, rx3) = mpsc::unbounded_channel();

        assert!(hub.attach_speaker(SpeakerId(1), rx1));
        assert!(!hub.attach_speaker(SpeakerId(1), rx2));
        assert!(hub.attach_speaker(SpeakerId(2), rx3));

        assert_eq!(hub.session_count(), 2);
        assert_eq!(mixer.input_count(), 2);
    }

    #[tokio::test]
    async fn test_frames_are_decoded_into_mixer() {
        let (hub, _mixer) = hub();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.attach_speaker(SpeakerId(9), rx);
        let session = session_of(&hub, 9);

        tx.send(SourceEvent::Frame(Bytes::from(encode_frame(0)))).unwrap();
        // garbage is logged and skipped
        tx.send(SourceEvent::Frame(Bytes::from_static(&[0xFF]))).unwrap();
        tx.send(SourceEvent::Frame(Bytes::from(encode_frame(0)))).unwrap();

        wait_for(|| session.input.buffered_samples() == 2 * 1920).await;
        assert!(!session.cleaned_up.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_every_end_signal_tears_down_once() {
        let (hub, mixer) = hub();

        let (end_tx, end_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = mpsc::unbounded_channel::<SourceEvent>();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        hub.attach_speaker(SpeakerId(1), end_rx);
        hub.attach_speaker(SpeakerId(2), close_rx);
        hub.attach_speaker(SpeakerId(3), err_rx);
        let sessions: Vec<_> = (1..=3).map(|id| session_of(&hub, id)).collect();

        // end followed by close, close alone, error followed by end and close
        end_tx.send(SourceEvent::End).unwrap();
        drop(end_tx);
        drop(close_tx);
        err_tx.send(SourceEvent::Error("reset".into())).unwrap();
        let _ = err_tx.send(SourceEvent::End);
        drop(err_tx);

        wait_for(|| hub.session_count() == 0).await;
        assert_eq!(mixer.input_count(), 0);
        for session in &sessions {
            assert!(session.cleaned_up.load(Ordering::SeqCst));
            assert!(!hub.teardown(session, TeardownCause::Close));
        }
    }

    #[tokio::test]
    async fn test_reattach_after_teardown() {
        let (hub, mixer) = hub();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.attach_speaker(SpeakerId(4), rx);
        tx.send(SourceEvent::End).unwrap();
        wait_for(|| hub.session_count() == 0).await;

        let (_tx, rx) = mpsc::unbounded_channel();
        assert!(hub.attach_speaker(SpeakerId(4), rx));
        assert_eq!(mixer.input_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (hub, mixer) = hub();
        let mut senders = Vec::new();
        for id in 0..5 {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            hub.attach_speaker(SpeakerId(id), rx);
        }

        hub.shutdown();
        hub.shutdown();
        assert_eq!(hub.session_count(), 0);
        assert_eq!(mixer.input_count(), 0);
        assert!(!mixer.is_open());

        let (_tx, rx) = mpsc::unbounded_channel();
        assert!(!hub.attach_speaker(SpeakerId(99), rx));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_attach_racing_shutdown_leaves_nothing_behind() {
        let (hub, mixer) = hub();

        let attachers: Vec<_> = (0..4u32)
            .map(|worker| {
                let hub = hub.clone();
                tokio::spawn(async move {
                    let mut senders = Vec::new();
                    for n in 0..200u32 {
                        let (tx, rx) = mpsc::unbounded_channel();
                        senders.push(tx);
                        hub.attach_speaker(SpeakerId(worker * 1000 + n), rx);
                        tokio::task::yield_now().await;
                    }
                    senders
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(2)).await;
        hub.shutdown();

        let mut senders = Vec::new();
        for attacher in attachers {
            senders.extend(attacher.await.unwrap());
        }
        assert_eq!(hub.session_count(), 0);
        assert_eq!(mixer.input_count(), 0);
        drop(senders);
    }
}
