//! Configuration management and environment variable loading

use crate::{LyrebotError, Result};
use std::env;
use std::path::PathBuf;

/// Default token preload file, relative to the working directory
pub const DEFAULT_TOKEN_FILE: &str = ".tokens.yaml";

/// Load environment variables from a .env file
///
/// Safe to call multiple times; a missing file is not an error.
pub fn load_env() -> Result<()> {
    match dotenvy::dotenv() {
        Ok(path) => {
            tracing::info!("Loaded environment from: {}", path.display());
            Ok(())
        }
        Err(dotenvy::Error::Io(_)) => {
            tracing::debug!("No .env file found - using system environment only");
            Ok(())
        }
        Err(e) => Err(LyrebotError::config(format!(
            "Failed to load .env file: {}",
            e
        ))),
    }
}

/// Get required environment variable
///
/// Returns an error if the variable is not set
pub fn get_required_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| {
        LyrebotError::config(format!(
            "Required environment variable '{}' is not set. \
             Check your .env file or system environment.",
            key
        ))
    })
}

/// Process configuration, read once at startup
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Discord gateway token
    pub discord_token: String,
    /// Lyrebird OAuth2 client id
    pub client_id: String,
    /// Lyrebird OAuth2 client secret
    pub client_secret: String,
    /// Redirect URI registered with the Lyrebird application
    pub redirect_uri: String,
    /// Optional token preload file (`TOKEN_FILE`, default `./.tokens.yaml`)
    pub token_file: PathBuf,
}

impl BotConfig {
    /// Read the four required variables plus the optional `TOKEN_FILE` override
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            discord_token: get_required_env("DISCORD_BOT_TOKEN")?,
            client_id: get_required_env("LYRE_CLIENT_ID")?,
            client_secret: get_required_env("LYRE_CLIENT_SECRET")?,
            redirect_uri: get_required_env("LYRE_REDIRECT_URI")?,
            token_file: env::var("TOKEN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_TOKEN_FILE)),
        })
    }
}
