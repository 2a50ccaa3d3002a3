//! Voice Relay
//!
//! A Discord bot that mixes everyone speaking in one voice channel and
//! streams the result as MP3 to an Icecast mount or a local file.

mod audio;
mod bot;
mod config;
mod sink;
mod transcoder;

use audio::{Mixer, PcmFormat, SpeakerHub};
use config::Config;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcoder::Transcoder;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,voice_relay=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Voice relay starting...");

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Please ensure DISCORD_TOKEN, VOICE_CHANNEL_ID and ICECAST_URL or OUTPUT_FILE are set");
            std::process::exit(1);
        }
    };
    let config = Arc::new(config);
    info!("Configuration loaded, relaying channel {}", config.voice_channel_id);

    let transcoder = match Transcoder::start(config.transcoder()).await {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to start transcoder: {}", e);
            std::process::exit(1);
        }
    };

    let mixer = Arc::new(Mixer::new(PcmFormat::default()));
    mixer.start(transcoder.clone());
    let hub = Arc::new(SpeakerHub::new(mixer));

    let mut exit_code = 0;
    tokio::select! {
        result = bot::run(config.clone(), hub.clone()) => {
            if let Err(e) = result {
                error!("Bot error: {}", e);
                exit_code = 1;
            }
        }
        e = transcoder.failed() => {
            error!("Transcoder failed: {}", e);
            exit_code = 1;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    hub.shutdown();
    transcoder.shutdown().await;

    std::process::exit(exit_code);
}
