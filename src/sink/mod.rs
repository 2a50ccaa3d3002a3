//! Output sinks for encoded audio
//!
//! Icecast SOURCE upload or a local file

pub mod backoff;
pub mod endpoint;
pub mod file;
pub mod icecast;
pub mod queue;

pub use file::FileSink;
pub use icecast::NetworkSink;

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::OutputTarget;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Invalid Icecast URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Server rejected the stream (status {0})")]
    Rejected(u16),
    #[error("Timed out")]
    Timeout,
    #[error("Connection closed")]
    Closed,
    #[error("Sink input closed")]
    InputClosed,
}

/// Destination for encoder output. Writes never block and never fail;
/// each sink owns its own buffering.
pub trait OutputSink: Send + Sync {
    fn write(&self, chunk: Bytes);

    /// Stop accepting writes. Safe to call more than once.
    fn close(&self);

    /// Background writer to await after `close` so queued output lands
    fn take_writer(&self) -> Option<JoinHandle<()>> {
        None
    }
}

/// Icecast queueing and reconnect settings
#[derive(Debug, Clone)]
pub struct NetworkSinkOptions {
    pub max_buffer_bytes: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub stream_name: String,
    pub stream_description: String,
}

impl Default for NetworkSinkOptions {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 1024 * 1024,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            stream_name: "Voice Relay".to_string(),
            stream_description: "Live voice channel relay".to_string(),
        }
    }
}

/// Open the sink for a target
pub async fn open_sink(
    target: &OutputTarget,
    options: &NetworkSinkOptions,
) -> Result<Arc<dyn OutputSink>, SinkError> {
    match target {
        OutputTarget::Network(url) => Ok(Arc::new(NetworkSink::connect(url, options.clone())?)),
        OutputTarget::File(path) => Ok(Arc::new(FileSink::open(path).await?)),
    }
}
