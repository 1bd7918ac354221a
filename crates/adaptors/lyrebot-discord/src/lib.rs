//! Discord adaptor for lyrebot
//!
//! Serenity event handler and command dispatch. Connectivity, message routing
//! and the voice transport are all delegated to serenity/songbird; this crate
//! wires inbound commands to the core authorization flow and the voice
//! playback coordinator in [`voice`].

use lyrebot_core::tokens::parse_always_speak;
use lyrebot_core::{AlwaysSpeakRegistry, AuthFlow, LyrebirdClient, LyrebotError, Result, TokenStore};
use serenity::async_trait as serenity_async_trait;
use serenity::http::Http;
use serenity::model::channel::{Message, ReactionType};
use serenity::model::gateway::{GatewayIntents, Ready};
use serenity::model::guild::Guild;
use serenity::model::voice::VoiceState;
use serenity::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

pub mod voice;
pub use voice::{HttpReplies, Player, Replies, SongbirdPlayer, Utterance, VoiceManager};

use songbird::serenity::SerenityInit;
use songbird::Songbird;

const THUMBS_UP: char = '\u{1F44D}';
const CLOCK: char = '\u{1F550}';

/// Help text shown for the `help` command
pub const HELP_TEXT: &str = "\
This bot echoes what you type into your current voice channel.

Usage: \"speak <what you want to say>

First time:
    Set yourself up with a lyrebird account, then run \"generate_token_uri \
(in a PM!) and follow the instructions. The tokens time out after a year.

Returning users:
    If this bot restarts/dies, it forgets your tokens.
    If you still have your token run \"set_token <your token>";

/// Discord connection configuration
#[derive(Clone)]
pub struct DiscordConfig {
    /// Bot gateway token
    pub token: String,
    /// Command prefix
    pub prefix: String,
    /// Gateway intents
    pub intents: GatewayIntents,
}

impl DiscordConfig {
    /// Config with the default `"` prefix and the intents the bot needs
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            prefix: "\"".to_string(),
            intents: GatewayIntents::GUILDS
                | GatewayIntents::GUILD_MESSAGES
                | GatewayIntents::DIRECT_MESSAGES
                | GatewayIntents::MESSAGE_CONTENT
                | GatewayIntents::GUILD_VOICE_STATES,
        }
    }
}

/// Split a message into `(command, args)` if it starts with the prefix
fn parse_command<'a>(content: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let rest = content.strip_prefix(prefix)?;
    let rest = rest.trim_start();
    if rest.is_empty() {
        return None;
    }
    match rest.split_once(char::is_whitespace) {
        Some((command, args)) => Some((command, args.trim())),
        None => Some((rest, "")),
    }
}

/// Voice state tracker - maps (guild_id, user_id) -> channel_id.
/// More reliable than serenity's cache for voice state lookups.
type VoiceStateMap = RwLock<HashMap<(u64, u64), u64>>;

struct Handler {
    prefix: String,
    tokens: Arc<TokenStore>,
    always_speak: Arc<AlwaysSpeakRegistry>,
    auth: Arc<AuthFlow>,
    voice: Arc<VoiceManager>,
    voice_states: VoiceStateMap,
}

impl Handler {
    async fn reply(&self, ctx: &Context, msg: &Message, text: &str) {
        if let Err(e) = msg.channel_id.say(&ctx.http, text).await {
            warn!(channel_id = %msg.channel_id.get(), error = %format!("{:?}", e), "Failed to send reply");
        }
    }

    async fn react(&self, ctx: &Context, msg: &Message, emoji: char) {
        if let Err(e) = msg.react(&ctx.http, emoji).await {
            debug!(error = %format!("{:?}", e), "Failed to add reaction");
        }
    }

    /// Remove only the bot's own reaction, leaving any user reactions alone
    /// (and avoiding the Manage Messages permission)
    async fn clear_reaction(&self, ctx: &Context, msg: &Message, emoji: char) {
        let _ = msg
            .delete_reaction(&ctx.http, None, ReactionType::from(emoji))
            .await;
    }

    async fn dispatch(&self, ctx: &Context, msg: &Message, command: &str, args: &str) {
        let user_id = msg.author.id.get();
        debug!(user_id = %user_id, command = %command, "Dispatching command");
        match command {
            "speak" => {
                if args.is_empty() {
                    self.reply(ctx, msg, "Usage: speak <what you want to say>").await;
                } else {
                    self.handle_speak(ctx, msg, args).await;
                }
            }
            "set_token" => match args.split_whitespace().next() {
                Some(token) => {
                    self.tokens.insert(user_id, token.to_string()).await;
                    self.react(ctx, msg, THUMBS_UP).await;
                }
                None => self.reply(ctx, msg, "Usage: set_token <your token>").await,
            },
            "generate_token_uri" => match self.auth.begin_authorization(user_id).await {
                Ok(auth_url) => {
                    self.reply(
                        ctx,
                        msg,
                        "Please go to this url, authenticate the app, then paste the URL you \
                         are redirected to into the 'generate_token' command",
                    )
                    .await;
                    self.reply(ctx, msg, &auth_url).await;
                }
                Err(e) => self.reply(ctx, msg, &e.user_message()).await,
            },
            "generate_token" => {
                if args.is_empty() {
                    self.reply(ctx, msg, "Usage: generate_token <callback URL>").await;
                    return;
                }
                match self.auth.complete_authorization(user_id, args).await {
                    Ok(token) => {
                        self.reply(
                            ctx,
                            msg,
                            &format!(
                                "Your token is '{}'. Please retain it in case I forget myself!",
                                token
                            ),
                        )
                        .await;
                        self.reply(ctx, msg, "You can set it again using the 'set_token' command.")
                            .await;
                    }
                    Err(e) => self.reply(ctx, msg, &e.user_message()).await,
                }
            }
            "always_speak" => {
                let enabled = parse_always_speak(args);
                self.always_speak
                    .set(msg.channel_id.get(), user_id, enabled)
                    .await;
                self.react(ctx, msg, THUMBS_UP).await;
            }
            "volume" => match args.parse::<u32>() {
                Ok(percent) => {
                    let fraction = self.voice.set_volume(percent).await;
                    self.reply(
                        ctx,
                        msg,
                        &format!("Set the volume to {:.0}%", fraction * 100.0),
                    )
                    .await;
                }
                Err(_) => self.reply(ctx, msg, "Usage: volume <percent>").await,
            },
            "restart" => {
                info!(user_id = %user_id, "Restart requested, exiting");
                std::process::exit(0);
            }
            "help" => self.reply(ctx, msg, HELP_TEXT).await,
            _ => debug!(command = %command, "Unknown command ignored"),
        }
    }

    /// The speak pipeline: token check, clock reaction, connect to the
    /// requester's voice channel, synthesize and enqueue
    async fn handle_speak(&self, ctx: &Context, msg: &Message, text: &str) {
        let user_id = msg.author.id.get();
        let Some(guild_id) = msg.guild_id.map(|g| g.get()) else {
            self.reply(ctx, msg, "speak only works in a server channel.").await;
            return;
        };

        if !self.tokens.contains(user_id).await {
            self.reply(ctx, msg, &LyrebotError::NoToken(user_id).user_message())
                .await;
            return;
        }

        debug!(user_id = %user_id, text_len = %text.len(), "Echoing text as speech");
        self.react(ctx, msg, CLOCK).await;

        let requester_channel = {
            let states = self.voice_states.read().await;
            states.get(&(guild_id, user_id)).copied()
        };
        let Some(voice_channel) = requester_channel else {
            self.reply(ctx, msg, &LyrebotError::NotInVoiceChannel.user_message())
                .await;
            self.clear_reaction(ctx, msg, CLOCK).await;
            return;
        };

        if let Err(e) = self.voice.ensure_connected(guild_id, voice_channel).await {
            self.reply(ctx, msg, &e.user_message()).await;
            self.clear_reaction(ctx, msg, CLOCK).await;
            return;
        }

        match self
            .voice
            .synthesize_and_enqueue(guild_id, user_id, msg.channel_id.get(), text)
            .await
        {
            Ok(()) => {
                self.react(ctx, msg, THUMBS_UP).await;
                self.clear_reaction(ctx, msg, CLOCK).await;
                debug!(user_id = %user_id, "Queued audio");
            }
            Err(e) => {
                self.reply(ctx, msg, &e.user_message()).await;
                self.clear_reaction(ctx, msg, CLOCK).await;
            }
        }
    }
}

#[serenity_async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        if let Some((command, args)) = parse_command(&msg.content, &self.prefix) {
            self.dispatch(&ctx, &msg, command, args).await;
            return;
        }

        // Auto-speak: ordinary messages from opted-in users are spoken
        let user_id = msg.author.id.get();
        let channel_id = msg.channel_id.get();
        if msg.guild_id.is_some()
            && !msg.content.is_empty()
            && self.always_speak.enabled(channel_id, user_id).await
        {
            let content = msg.content.clone();
            self.handle_speak(&ctx, &msg, &content).await;
        }
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(
            user = %ready.user.name,
            guilds = %ready.guilds.len(),
            "Logged in"
        );
    }

    /// Seed the voice state tracker when guild data arrives
    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        let guild_id = guild.id.get();
        let mut states = self.voice_states.write().await;
        for (user_id, voice_state) in guild.voice_states.iter() {
            if let Some(channel_id) = voice_state.channel_id {
                states.insert((guild_id, user_id.get()), channel_id.get());
            }
        }
        debug!(
            guild_id = %guild_id,
            tracked = %guild.voice_states.len(),
            "Seeded voice states from guild_create"
        );
    }

    async fn voice_state_update(&self, _ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        let user_id = new.user_id.get();
        let Some(guild_id) = new.guild_id.map(|g| g.get()) else {
            return;
        };
        let mut states = self.voice_states.write().await;
        match new.channel_id {
            Some(channel_id) => {
                states.insert((guild_id, user_id), channel_id.get());
            }
            None => {
                states.remove(&(guild_id, user_id));
            }
        }
    }
}

/// Build the serenity client with songbird registered and run it until
/// shutdown.
///
/// A ctrl-c signal cancels every playback driver, disconnects all voice
/// connections and stops the gateway shards.
pub async fn start_bot(
    config: DiscordConfig,
    tokens: Arc<TokenStore>,
    always_speak: Arc<AlwaysSpeakRegistry>,
    auth: Arc<AuthFlow>,
) -> Result<()> {
    let songbird = Songbird::serenity();
    let http = Arc::new(Http::new(&config.token));
    let voice = Arc::new(VoiceManager::new(
        songbird.clone(),
        Arc::new(SongbirdPlayer::new(songbird.clone())),
        Arc::new(HttpReplies::new(http)),
        tokens.clone(),
        Arc::new(LyrebirdClient::new()),
    ));

    let handler = Handler {
        prefix: config.prefix.clone(),
        tokens,
        always_speak,
        auth,
        voice: voice.clone(),
        voice_states: RwLock::new(HashMap::new()),
    };

    let mut client = Client::builder(&config.token, config.intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await
        .map_err(|e| LyrebotError::Discord(format!("{:?}", e)))?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("Failed to listen for shutdown signal");
            return;
        }
        info!("Shutting down");
        voice.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    client
        .start()
        .await
        .map_err(|e| LyrebotError::Discord(format!("{:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_with_quote_prefix() {
        assert_eq!(
            parse_command("\"speak hello world", "\""),
            Some(("speak", "hello world"))
        );
        assert_eq!(parse_command("\"volume 60", "\""), Some(("volume", "60")));
        assert_eq!(
            parse_command("\"generate_token_uri", "\""),
            Some(("generate_token_uri", ""))
        );
    }

    #[test]
    fn test_parse_command_ignores_plain_messages() {
        assert_eq!(parse_command("hello there", "\""), None);
        assert_eq!(parse_command("", "\""), None);
        assert_eq!(parse_command("\"", "\""), None);
        assert_eq!(parse_command("\"   ", "\""), None);
    }

    #[test]
    fn test_parse_command_trims_args() {
        assert_eq!(
            parse_command("\"speak   spaced   out  ", "\""),
            Some(("speak", "spaced   out"))
        );
    }
}
