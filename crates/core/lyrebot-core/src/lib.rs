//! Lyrebot Core
//!
//! Platform-independent logic for a text-to-speech Discord bot backed by the
//! Lyrebird voice API:
//!
//! - OAuth2 authorization-code flow for acquiring per-user API tokens
//! - Lyrebird TTS client (text in, WAV bytes out)
//! - Token store and per-channel always-speak registry
//! - Token preload file and environment configuration
//!
//! The chat-platform adaptor (serenity/songbird) lives in `lyrebot-discord`;
//! everything here keys users and channels by their numeric Discord ids so it
//! can be tested without a gateway connection.

pub mod auth;
pub mod config;
pub mod error;
pub mod lyrebird;
pub mod tokens;

pub use auth::AuthFlow;
pub use config::{load_env, BotConfig};
pub use error::{LyrebotError, Result};
pub use lyrebird::LyrebirdClient;
pub use tokens::{AlwaysSpeakRegistry, TokenStore};
