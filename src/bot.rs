//! Discord Bot event handler and voice receive handler

use crate::audio::{SourceEvent, SpeakerHub, SpeakerId};
use crate::config::Config;
use bytes::Bytes;
use dashmap::DashMap;
use serenity::all::{
    ActivityData, ChannelId, Client, Context, EventHandler, GatewayIntents, Ready, VoiceState,
};
use serenity::async_trait;
use songbird::driver::DecodeMode;
use songbird::events::context_data::VoiceTick;
use songbird::events::{Event, EventContext, EventHandler as VoiceEventHandler};
use songbird::{CoreEvent, SerenityInit};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Silent ticks (20ms each) before a speaking turn is ended
const SILENCE_END_TICKS: u32 = 25;

/// Bot state shared across handlers
pub struct RelayState {
    pub config: Arc<Config>,
    pub receiver: VoiceReceiver,
}

/// Main event handler for the bot
pub struct Handler {
    pub state: Arc<RelayState>,
}

impl Handler {
    /// Join the configured voice channel and hook up voice receive
    async fn join_target(
        &self,
        ctx: &Context,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let channel_id = ChannelId::new(self.state.config.voice_channel_id);
        let guild_id = channel_id
            .to_channel(ctx)
            .await?
            .guild()
            .map(|channel| channel.guild_id)
            .ok_or("Configured channel is not a guild voice channel")?;

        let manager = songbird::get(ctx).await.ok_or("Songbird not registered")?;
        let call = manager.join(guild_id, channel_id).await?;

        {
            let mut handler = call.lock().await;
            handler.remove_all_global_events();
            for event in [
                CoreEvent::SpeakingStateUpdate,
                CoreEvent::VoiceTick,
                CoreEvent::ClientDisconnect,
            ] {
                handler.add_global_event(event.into(), self.state.receiver.clone());
            }
        }

        info!("Joined voice channel {} in guild {}", channel_id, guild_id);
        Ok(())
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("Logged in as {}", ready.user.name);

        ctx.set_activity(Some(ActivityData::listening(&self.state.config.listening_to)));

        if let Err(e) = self.join_target(&ctx).await {
            error!("Failed to join voice channel: {}", e);
        }
    }

    async fn voice_state_update(&self, ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        if new.user_id != ctx.cache.current_user().id {
            return;
        }
        let target = ChannelId::new(self.state.config.voice_channel_id);
        if new.channel_id == Some(target) {
            return;
        }

        warn!(
            "Moved out of the relayed channel (now {:?}), rejoining {}",
            new.channel_id, target
        );
        if let Err(e) = self.join_target(&ctx).await {
            error!("Failed to rejoin voice channel: {}", e);
        }
    }
}

struct SpeakerStream {
    sender: mpsc::UnboundedSender<SourceEvent>,
    silent_ticks: u32,
}

struct ReceiverInner {
    hub: Arc<SpeakerHub>,
    streams: DashMap<u32, SpeakerStream>,
    users: DashMap<u64, u32>,
}

/// Voice receive event handler
///
/// Turns songbird's per-tick packets into one `SpeakerSource` per SSRC
/// speaking turn.
#[derive(Clone)]
pub struct VoiceReceiver {
    inner: Arc<ReceiverInner>,
}

impl VoiceReceiver {
    pub fn new(hub: Arc<SpeakerHub>) -> Self {
        Self {
            inner: Arc::new(ReceiverInner {
                hub,
                streams: DashMap::new(),
                users: DashMap::new(),
            }),
        }
    }

    /// Forward one Opus payload, opening a speaking turn if needed
    pub fn handle_packet(&self, ssrc: u32, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let frame = SourceEvent::Frame(Bytes::copy_from_slice(payload));

        if let Some(mut stream) = self.inner.streams.get_mut(&ssrc) {
            stream.silent_ticks = 0;
            if stream.sender.send(frame.clone()).is_ok() {
                return;
            }
        }
        // No turn yet, or its session already went away
        self.inner.streams.remove(&ssrc);
        self.open_turn(ssrc, frame);
    }

    fn open_turn(&self, ssrc: u32, first: SourceEvent) {
        let (sender, source) = mpsc::unbounded_channel();
        let _ = sender.send(first);
        if !self.inner.hub.attach_speaker(SpeakerId(ssrc), source) {
            debug!("Speaker {} not attached, dropping packet", ssrc);
            return;
        }
        self.inner.streams.insert(
            ssrc,
            SpeakerStream {
                sender,
                silent_ticks: 0,
            },
        );
    }

    /// Count a tick without audio; a long enough run ends the turn
    pub fn handle_silence(&self, ssrc: u32) {
        let ended = match self.inner.streams.get_mut(&ssrc) {
            Some(mut stream) => {
                stream.silent_ticks += 1;
                stream.silent_ticks >= SILENCE_END_TICKS
            }
            None => false,
        };
        if ended {
            if let Some((_, stream)) = self.inner.streams.remove(&ssrc) {
                let _ = stream.sender.send(SourceEvent::End);
            }
        }
    }

    pub fn handle_speaking_update(&self, ssrc: u32, user_id: Option<u64>) {
        if let Some(user_id) = user_id {
            debug!("User {} speaks as SSRC {}", user_id, ssrc);
            self.inner.users.insert(user_id, ssrc);
        }
    }

    /// A user left the call: close their stream
    pub fn handle_disconnect(&self, user_id: u64) {
        if let Some((_, ssrc)) = self.inner.users.remove(&user_id) {
            if self.inner.streams.remove(&ssrc).is_some() {
                debug!(
                    "User {} disconnected, closed SSRC {} ({} streams open)",
                    user_id,
                    ssrc,
                    self.stream_count()
                );
            }
        }
    }

    fn handle_tick(&self, tick: &VoiceTick) {
        for (ssrc, data) in &tick.speaking {
            if let Some(rtp) = &data.packet {
                let end = rtp.packet.len().saturating_sub(rtp.payload_end_pad);
                if let Some(payload) = rtp.packet.get(rtp.payload_offset..end) {
                    self.handle_packet(*ssrc, payload);
                }
            }
        }
        for ssrc in &tick.silent {
            self.handle_silence(*ssrc);
        }
    }

    pub fn stream_count(&self) -> usize {
        self.inner.streams.len()
    }
}

#[async_trait]
impl VoiceEventHandler for VoiceReceiver {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::VoiceTick(tick) => self.handle_tick(tick),
            EventContext::SpeakingStateUpdate(speaking) => {
                self.handle_speaking_update(speaking.ssrc, speaking.user_id.map(|id| id.0))
            }
            EventContext::ClientDisconnect(disconnect) => {
                self.handle_disconnect(disconnect.user_id.0)
            }
            _ => {}
        }

        None
    }
}

/// Create and run the Discord bot
pub async fn run(
    config: Arc<Config>,
    hub: Arc<SpeakerHub>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = Arc::new(RelayState {
        config: config.clone(),
        receiver: VoiceReceiver::new(hub),
    });

    // Create handler
    let handler = Handler { state };

    // Opus decode happens in our own sessions
    let voice_config = songbird::Config::default().decode_mode(DecodeMode::Decrypt);

    // Create client with voice support
    let intents = GatewayIntents::non_privileged() | GatewayIntents::GUILD_VOICE_STATES;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_from_config(voice_config)
        .await?;

    // Start the client
    info!("Starting bot...");
    client.start().await?;

    Ok(())
}
