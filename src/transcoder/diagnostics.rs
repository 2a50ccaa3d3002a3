//! Encoder stderr classification
//!
//! While the sink or the encoder's stdin is being re-established ffmpeg
//! prints a handful of errors that are expected and recover on their own.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, warn};

const TRANSIENT_PATTERNS: &[&str] = &[
    "Broken pipe",
    "av_interleaved_write_frame",
    "Error writing trailer",
    "Error muxing a packet",
    "Conversion failed",
    "Connection reset by peer",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// Known recovery noise
    Transient,
    /// Anything else the encoder says
    Other,
}

pub fn classify(line: &str) -> Diagnostic {
    if TRANSIENT_PATTERNS.iter().any(|p| line.contains(p)) {
        Diagnostic::Transient
    } else {
        Diagnostic::Other
    }
}

/// Log every stderr line until the pipe closes
pub async fn forward_diagnostics<R>(stderr: R, visible: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                match classify(line) {
                    Diagnostic::Transient => warn!("encoder (transient): {}", line),
                    Diagnostic::Other if visible => info!("encoder: {}", line),
                    Diagnostic::Other => debug!("encoder: {}", line),
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Encoder stderr read failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_lines() {
        assert_eq!(
            classify("av_interleaved_write_frame(): Broken pipe"),
            Diagnostic::Transient
        );
        assert_eq!(
            classify("[out#0/mp3 @ 0x55] Error writing trailer: Broken pipe"),
            Diagnostic::Transient
        );
        assert_eq!(classify("Conversion failed!"), Diagnostic::Transient);
    }

    #[test]
    fn test_other_lines() {
        assert_eq!(
            classify("size=     256kB time=00:00:16.32 bitrate= 128.5kbits/s"),
            Diagnostic::Other
        );
        assert_eq!(classify("Unknown encoder 'libmp3lame'"), Diagnostic::Other);
    }

    #[tokio::test]
    async fn test_forward_reads_to_eof() {
        let stderr: &[u8] = b"line one\n\nConversion failed!\n";
        forward_diagnostics(stderr, true).await;
    }
}
