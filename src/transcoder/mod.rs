//! Encoder supervision
//!
//! One ffmpeg child at a time turns mixed PCM into MP3. The child can die at
//! any moment; PCM keeps collecting in a long-lived buffer and is replayed,
//! in order, into the next child once it has been respawned.

pub mod buffer;
pub mod command;
pub mod diagnostics;

use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::PcmSink;
use crate::config::OutputTarget;
use crate::sink::{open_sink, NetworkSinkOptions, OutputSink, SinkError};

use buffer::PcmBuffer;
use command::EncoderCommand;
use diagnostics::forward_diagnostics;

const READ_CHUNK_SIZE: usize = 8192;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum TranscoderError {
    #[error("Failed to start encoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Output error: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    /// Encoder binary
    pub program: String,
    pub sample_rate: u32,
    /// 0 leaves the bitrate to the encoder
    pub compression_kbps: u32,
    pub min_bitrate_kbps: Option<u32>,
    pub volume_multiplier: f32,
    /// Log encoder diagnostics at info instead of debug
    pub diagnostics_visible: bool,
    pub output_target: OutputTarget,
    pub network: NetworkSinkOptions,
    /// Pause between a child exiting and its replacement starting
    pub restart_delay: Duration,
    /// Buffered PCM above which submissions report backpressure
    pub high_water_mark: usize,
}

impl TranscoderConfig {
    pub fn new(output_target: OutputTarget) -> Self {
        Self {
            program: "ffmpeg".to_string(),
            sample_rate: 48000,
            compression_kbps: 0,
            min_bitrate_kbps: None,
            volume_multiplier: 1.0,
            diagnostics_visible: false,
            output_target,
            network: NetworkSinkOptions::default(),
            restart_delay: Duration::from_secs(1),
            high_water_mark: 1024 * 1024,
        }
    }
}

enum ProcessExit {
    /// The child went away on its own or after a pipe failure
    Exited(io::Result<ExitStatus>),
    /// Stopped by shutdown
    Stopped,
}

pub struct Transcoder {
    config: TranscoderConfig,
    command: EncoderCommand,
    buffer: PcmBuffer,
    sink: Arc<dyn OutputSink>,
    running: AtomicBool,
    stop: Notify,
    child_pid: AtomicU32,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    fatal: watch::Sender<Option<Arc<TranscoderError>>>,
}

impl Transcoder {
    /// Open the configured sink and start the first encoder. Failing to
    /// start that first child is fatal.
    pub async fn start(config: TranscoderConfig) -> Result<Arc<Self>, TranscoderError> {
        let sink = open_sink(&config.output_target, &config.network).await?;
        let command = EncoderCommand::from_config(&config);
        Self::start_with(config, command, sink)
    }

    /// Start with an explicit encoder command and sink
    pub fn start_with(
        config: TranscoderConfig,
        command: EncoderCommand,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Arc<Self>, TranscoderError> {
        let transcoder = Arc::new(Self {
            buffer: PcmBuffer::new(config.high_water_mark),
            config,
            command,
            sink,
            running: AtomicBool::new(true),
            stop: Notify::new(),
            child_pid: AtomicU32::new(0),
            supervisor: Mutex::new(None),
            fatal: watch::channel(None).0,
        });

        let child = match transcoder.spawn_child() {
            Ok(child) => child,
            Err(e) => {
                transcoder.running.store(false, Ordering::SeqCst);
                transcoder.buffer.end();
                transcoder.sink.close();
                return Err(e);
            }
        };

        let handle = tokio::spawn(transcoder.clone().supervise(child));
        *transcoder.supervisor.lock() = Some(handle);
        Ok(transcoder)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// PID of the attached encoder, if one is alive
    pub fn current_pid(&self) -> Option<u32> {
        match self.child_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.buffered_bytes()
    }

    /// Resolves once a respawn has failed for good
    pub async fn failed(&self) -> Arc<TranscoderError> {
        let mut fatal = self.fatal.subscribe();
        loop {
            let current = fatal.borrow_and_update().clone();
            if let Some(err) = current {
                return err;
            }
            if fatal.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Stop the encoder, end the buffer and close the sink. Later calls do nothing.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down transcoder");

        self.buffer.end();
        self.stop.notify_one();

        let supervisor = self.supervisor.lock().take();
        if let Some(mut handle) = supervisor {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("Encoder did not stop within {:?}, aborting", SHUTDOWN_GRACE);
                handle.abort();
            }
        }
        self.child_pid.store(0, Ordering::SeqCst);
        self.sink.close();
        if let Some(mut writer) = self.sink.take_writer() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut writer).await.is_err() {
                warn!("Output did not finish within {:?}, aborting", SHUTDOWN_GRACE);
                writer.abort();
            }
        }
    }

    fn spawn_child(&self) -> Result<Child, TranscoderError> {
        let child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscoderError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or(0);
        self.child_pid.store(pid, Ordering::SeqCst);
        info!("Encoder started (pid {})", pid);
        Ok(child)
    }

    async fn supervise(self: Arc<Self>, mut child: Child) {
        loop {
            let exit = self.attach(&mut child).await;
            self.child_pid.store(0, Ordering::SeqCst);

            let status = match exit {
                ProcessExit::Stopped => break,
                ProcessExit::Exited(status) => status,
            };
            if !self.is_running() {
                break;
            }
            match status {
                Ok(status) => warn!(
                    "Encoder exited ({}), restarting in {:?}",
                    status, self.config.restart_delay
                ),
                Err(e) => warn!(
                    "Lost track of encoder ({}), restarting in {:?}",
                    e, self.config.restart_delay
                ),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.restart_delay) => {}
                _ = self.stop.notified() => break,
            }
            if !self.is_running() {
                break;
            }

            child = match self.spawn_child() {
                Ok(child) => child,
                Err(e) => {
                    error!("{}", e);
                    self.fatal.send_replace(Some(Arc::new(e)));
                    break;
                }
            };
        }
        debug!("Encoder supervisor stopped");
    }

    /// Feed one child until it exits or shutdown stops it
    async fn attach(&self, child: &mut Child) -> ProcessExit {
        let output = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(forward_output(stdout, self.sink.clone())));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_diagnostics(stderr, self.config.diagnostics_visible));
        }
        let mut stdin = child.stdin.take();

        let exit = loop {
            let Some(input) = stdin.as_mut() else {
                // Nothing to feed; let the child run until it exits
                break tokio::select! {
                    _ = self.stop.notified() => stop_child(child).await,
                    status = child.wait() => ProcessExit::Exited(status),
                };
            };

            tokio::select! {
                biased;
                _ = self.stop.notified() => break stop_child(child).await,
                status = child.wait() => break ProcessExit::Exited(status),
                chunk = self.buffer.next() => match chunk {
                    Some(chunk) => {
                        if let Err(e) = input.write_all(&chunk).await {
                            self.buffer.push_front(chunk);
                            if e.kind() == io::ErrorKind::BrokenPipe {
                                warn!("Encoder stdin closed (broken pipe), waiting for exit");
                            } else {
                                error!("Encoder stdin write failed: {}", e);
                            }
                            stdin = None;
                        }
                    }
                    None => break stop_child(child).await,
                },
            }
        };

        if let Some(output) = output {
            let _ = output.await;
        }
        exit
    }
}

async fn stop_child(child: &mut Child) -> ProcessExit {
    if let Err(e) = child.kill().await {
        debug!("Encoder kill failed: {}", e);
    }
    ProcessExit::Stopped
}

/// Copy encoder stdout to the sink until the pipe closes
async fn forward_output<R>(mut stdout: R, sink: Arc<dyn OutputSink>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.write(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => {
                debug!("Encoder stdout read failed: {}", e);
                break;
            }
        }
    }
}

impl PcmSink for Transcoder {
    fn submit_audio(&self, pcm: Bytes) {
        if !self.is_running() {
            return;
        }
        if !self.buffer.push(pcm) {
            debug!(
                "Encoder input above high-water mark ({} bytes buffered)",
                self.buffered_bytes()
            );
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct Collected {
        bytes: Mutex<Vec<u8>>,
        closed: AtomicBool,
    }

    impl OutputSink for Collected {
        fn write(&self, chunk: Bytes) {
            self.bytes.lock().extend_from_slice(&chunk);
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn passthrough() -> EncoderCommand {
        EncoderCommand {
            program: "cat".to_string(),
            args: Vec::new(),
        }
    }

    fn config() -> TranscoderConfig {
        TranscoderConfig {
            restart_delay: Duration::from_millis(200),
            ..TranscoderConfig::new(OutputTarget::File("unused.mp3".into()))
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn chunk(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 100])
    }

    #[tokio::test]
    async fn test_missing_binary_is_fatal() {
        let sink = Arc::new(Collected::default());
        let command = EncoderCommand {
            program: "/nonexistent/voice-relay-encoder".to_string(),
            args: Vec::new(),
        };
        let result = Transcoder::start_with(config(), command, sink.clone());
        assert!(matches!(result, Err(TranscoderError::Spawn { .. })));
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_output_keeps_submission_order() {
        let sink = Arc::new(Collected::default());
        let transcoder = Transcoder::start_with(config(), passthrough(), sink.clone()).unwrap();

        let mut expected = Vec::new();
        for tag in 0..10u8 {
            transcoder.submit_audio(chunk(tag));
            expected.extend_from_slice(&chunk(tag));
        }

        wait_until(|| sink.bytes.lock().len() == expected.len()).await;
        assert_eq!(*sink.bytes.lock(), expected);
        transcoder.shutdown().await;
    }

    #[tokio::test]
    async fn test_respawn_keeps_audio_continuous() {
        let sink = Arc::new(Collected::default());
        let transcoder = Transcoder::start_with(config(), passthrough(), sink.clone()).unwrap();

        let mut expected = Vec::new();
        for tag in 0..5u8 {
            transcoder.submit_audio(chunk(tag));
            expected.extend_from_slice(&chunk(tag));
        }
        wait_until(|| sink.bytes.lock().len() == expected.len()).await;

        let first_pid = transcoder.current_pid().unwrap();
        let killed = std::process::Command::new("kill")
            .args(["-9", &first_pid.to_string()])
            .status()
            .unwrap();
        assert!(killed.success());
        wait_until(|| transcoder.current_pid().is_none()).await;

        // Submitted while no encoder is attached
        for tag in 5..10u8 {
            transcoder.submit_audio(chunk(tag));
            expected.extend_from_slice(&chunk(tag));
        }

        wait_until(|| sink.bytes.lock().len() == expected.len()).await;
        assert_eq!(*sink.bytes.lock(), expected);
        let second_pid = transcoder.current_pid().unwrap();
        assert_ne!(first_pid, second_pid);

        transcoder.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_respawn_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("encoder");
        std::os::unix::fs::symlink("/bin/cat", &program).unwrap();
        let command = EncoderCommand {
            program: program.to_string_lossy().into_owned(),
            args: Vec::new(),
        };

        let sink = Arc::new(Collected::default());
        let transcoder = Transcoder::start_with(config(), command, sink.clone()).unwrap();
        let pid = transcoder.current_pid().unwrap();

        // the encoder disappears while the first child is still running
        std::fs::remove_file(&program).unwrap();
        let killed = std::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status()
            .unwrap();
        assert!(killed.success());

        let error = tokio::time::timeout(Duration::from_secs(10), transcoder.failed())
            .await
            .expect("respawn failure was not reported");
        assert!(matches!(*error, TranscoderError::Spawn { .. }));
        assert!(transcoder.current_pid().is_none());

        transcoder.shutdown().await;
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let sink = Arc::new(Collected::default());
        let transcoder = Transcoder::start_with(config(), passthrough(), sink.clone()).unwrap();
        assert!(transcoder.current_pid().is_some());

        transcoder.shutdown().await;
        transcoder.shutdown().await;

        assert!(!transcoder.is_running());
        assert!(transcoder.current_pid().is_none());
        assert!(sink.closed.load(Ordering::SeqCst));

        transcoder.submit_audio(chunk(1));
        assert_eq!(transcoder.buffered_bytes(), 0);
    }
}
