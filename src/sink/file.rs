//! Local file output
//!
//! Appends so a respawned encoder continues the same file.

use bytes::Bytes;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{OutputSink, SinkError};

pub struct FileSink {
    commands: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileSink {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!("Writing encoded audio to {:?}", path);

        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(file, path, rx));

        Ok(Self {
            commands: Mutex::new(Some(commands)),
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        })
    }
}

impl OutputSink for FileSink {
    fn write(&self, chunk: Bytes) {
        if self.closed.load(Ordering::SeqCst) || chunk.is_empty() {
            return;
        }
        if let Some(commands) = self.commands.lock().as_ref() {
            let _ = commands.send(chunk);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // the writer drains what is queued, then stops
        self.commands.lock().take();
    }

    fn take_writer(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }
}

async fn write_loop(
    mut file: tokio::fs::File,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = file.write_all(&chunk).await {
            error!("Failed to write to {:?}: {}", path, e);
        }
    }
    if let Err(e) = file.flush().await {
        error!("Failed to flush {:?}: {}", path, e);
    }
    info!("Closed output file {:?}", path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn finish(sink: &FileSink) {
        sink.close();
        if let Some(writer) = sink.take_writer() {
            writer.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_appends_across_sinks() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("relay.mp3");

        let sink = FileSink::open(&path).await.unwrap();
        sink.write(Bytes::from_static(b"first "));
        finish(&sink).await;
        // writes after close are ignored
        sink.write(Bytes::from_static(b"lost"));

        let sink = FileSink::open(&path).await.unwrap();
        sink.write(Bytes::from_static(b"second"));
        sink.close();
        sink.close();
        finish(&sink).await;

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"first second");
    }
}
