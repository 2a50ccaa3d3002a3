//! Configuration management for the voice relay
//!
//! Loads settings from environment variables (.env file)

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::sink::NetworkSinkOptions;
use crate::transcoder::TranscoderConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
    #[error("No output specified: set ICECAST_URL or OUTPUT_FILE")]
    MissingOutput,
    #[error("Both ICECAST_URL and OUTPUT_FILE are set; choose one output")]
    ConflictingOutputs,
}

/// Where encoded audio ends up
#[derive(Debug, Clone, PartialEq)]
pub enum OutputTarget {
    /// Icecast mount URL, credentials in the user-info part
    Network(String),
    /// Local file, appended to
    File(PathBuf),
}

impl OutputTarget {
    /// Build a target from the two optional settings. Exactly one must be present.
    pub fn from_parts(
        network_url: Option<String>,
        file_path: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        match (network_url, file_path) {
            (Some(url), None) => Ok(Self::Network(url)),
            (None, Some(path)) => Ok(Self::File(path)),
            (None, None) => Err(ConfigError::MissingOutput),
            (Some(_), Some(_)) => Err(ConfigError::ConflictingOutputs),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Discord bot token
    pub discord_token: String,
    /// Voice channel to relay
    pub voice_channel_id: u64,
    /// "Listening to" presence text
    pub listening_to: String,
    /// Encoder output sample rate
    pub sample_rate: u32,
    /// Encoder bitrate in kbps, 0 leaves it to the encoder
    pub compression_kbps: u32,
    /// Encoder minimum bitrate in kbps
    pub min_bitrate_kbps: Option<u32>,
    /// Gain applied by the encoder
    pub volume_multiplier: f32,
    /// Log encoder diagnostics verbatim
    pub diagnostics_visible: bool,
    /// Encoder binary
    pub encoder_path: String,
    /// Icecast URL or file path
    pub output_target: OutputTarget,
    /// Icecast queueing and reconnect settings
    pub network: NetworkSinkOptions,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let discord_token = env::var("DISCORD_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("DISCORD_TOKEN".to_string()))?;

        let voice_channel_id = parse_var::<u64>("VOICE_CHANNEL_ID")?
            .ok_or_else(|| ConfigError::MissingEnvVar("VOICE_CHANNEL_ID".to_string()))?;

        let output_target = OutputTarget::from_parts(
            non_empty_var("ICECAST_URL"),
            non_empty_var("OUTPUT_FILE").map(PathBuf::from),
        )?;

        let defaults = NetworkSinkOptions::default();
        let network = NetworkSinkOptions {
            max_buffer_bytes: parse_var("ICECAST_MAX_BUFFER_BYTES")?
                .unwrap_or(defaults.max_buffer_bytes),
            base_delay: parse_var("ICECAST_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: parse_var("ICECAST_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            stream_name: non_empty_var("ICECAST_STREAM_NAME").unwrap_or(defaults.stream_name),
            stream_description: non_empty_var("ICECAST_STREAM_DESCRIPTION")
                .unwrap_or(defaults.stream_description),
        };

        Ok(Self {
            discord_token,
            voice_channel_id,
            listening_to: non_empty_var("LISTENING_TO").unwrap_or_else(|| "you.".to_string()),
            sample_rate: parse_var("SAMPLE_RATE")?.unwrap_or(48000),
            compression_kbps: parse_var("COMPRESSION_KBPS")?.unwrap_or(0),
            min_bitrate_kbps: parse_var("MIN_BITRATE_KBPS")?,
            volume_multiplier: parse_var("VOLUME")?.unwrap_or(1.0),
            diagnostics_visible: parse_flag("SHOW_ENCODER_OUTPUT")?,
            encoder_path: non_empty_var("ENCODER_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            output_target,
            network,
        })
    }

    /// Settings handed to the transcoder supervisor
    pub fn transcoder(&self) -> TranscoderConfig {
        TranscoderConfig {
            program: self.encoder_path.clone(),
            sample_rate: self.sample_rate,
            compression_kbps: self.compression_kbps,
            min_bitrate_kbps: self.min_bitrate_kbps,
            volume_multiplier: self.volume_multiplier,
            diagnostics_visible: self.diagnostics_visible,
            network: self.network.clone(),
            ..TranscoderConfig::new(self.output_target.clone())
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    non_empty_var(name)
        .map(|s| {
            s.trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidValue(name.to_string(), s))
        })
        .transpose()
}

fn parse_flag(name: &str) -> Result<bool, ConfigError> {
    match non_empty_var(name) {
        None => Ok(false),
        Some(s) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(name.to_string(), s)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_target_requires_exactly_one() {
        assert_eq!(
            OutputTarget::from_parts(Some("http://host/live".into()), None).unwrap(),
            OutputTarget::Network("http://host/live".into())
        );
        assert_eq!(
            OutputTarget::from_parts(None, Some("out.mp3".into())).unwrap(),
            OutputTarget::File("out.mp3".into())
        );
        assert!(matches!(
            OutputTarget::from_parts(None, None),
            Err(ConfigError::MissingOutput)
        ));
        assert!(matches!(
            OutputTarget::from_parts(Some("http://host/live".into()), Some("out.mp3".into())),
            Err(ConfigError::ConflictingOutputs)
        ));
    }
}
