//! Encoder invocation
//!
//! Input is always s16le stereo 48kHz on stdin; MP3 comes out on stdout.

use crate::audio::mixer::{CHANNELS, INPUT_SAMPLE_RATE};

use super::TranscoderConfig;

/// Program and arguments of the encoder child
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EncoderCommand {
    pub fn from_config(config: &TranscoderConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: encoder_args(config),
        }
    }
}

/// Arguments for ffmpeg built from the config
pub fn encoder_args(config: &TranscoderConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-f".into(),
        "s16le".into(),
        "-ac".into(),
        CHANNELS.to_string(),
        "-ar".into(),
        INPUT_SAMPLE_RATE.to_string(),
        "-i".into(),
        "pipe:0".into(),
    ];

    if (config.volume_multiplier - 1.0).abs() > f32::EPSILON {
        args.push("-af".into());
        args.push(format!("volume={}", config.volume_multiplier));
    }

    args.push("-ar".into());
    args.push(config.sample_rate.to_string());
    args.push("-c:a".into());
    args.push("libmp3lame".into());
    if config.compression_kbps > 0 {
        args.push("-b:a".into());
        args.push(format!("{}k", config.compression_kbps));
    }
    if let Some(min) = config.min_bitrate_kbps {
        args.push("-minrate".into());
        args.push(format!("{}k", min));
    }

    for arg in ["-flush_packets", "1", "-f", "mp3", "pipe:1"] {
        args.push(arg.into());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputTarget;

    fn config() -> TranscoderConfig {
        TranscoderConfig::new(OutputTarget::File("relay.mp3".into()))
    }

    fn joined(config: &TranscoderConfig) -> String {
        encoder_args(config).join(" ")
    }

    #[test]
    fn test_fixed_input_contract() {
        let args = joined(&config());
        assert!(args.starts_with("-hide_banner -f s16le -ac 2 -ar 48000 -i pipe:0"));
        assert!(args.ends_with("-f mp3 pipe:1"));
        assert!(!args.contains("-b:a"));
        assert!(!args.contains("volume="));
        assert!(!args.contains("-minrate"));
    }

    #[test]
    fn test_output_options_from_config() {
        let config = TranscoderConfig {
            sample_rate: 44100,
            compression_kbps: 128,
            min_bitrate_kbps: Some(64),
            volume_multiplier: 1.5,
            ..config()
        };
        let args = joined(&config);
        assert!(args.contains("-af volume=1.5 -ar 44100 -c:a libmp3lame -b:a 128k -minrate 64k"));
    }

    #[test]
    fn test_program_from_config() {
        let config = TranscoderConfig {
            program: "/opt/ffmpeg/bin/ffmpeg".into(),
            ..config()
        };
        let command = EncoderCommand::from_config(&config);
        assert_eq!(command.program, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(command.args, encoder_args(&config));
    }
}
