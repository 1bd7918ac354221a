//! Per-user token storage and the always-speak registry
//!
//! Both maps are keyed by the immutable numeric Discord user id. Tokens are
//! opaque strings with no expiry tracking; the Lyrebird API rejects them when
//! they go stale and the user re-runs the authorization flow.

use crate::Result;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Mapping from user id to Lyrebird access token
#[derive(Debug, Default)]
pub struct TokenStore {
    inner: RwLock<HashMap<u64, String>>,
}

impl TokenStore {
    /// Store a token for a user, replacing any previous one
    pub async fn insert(&self, user_id: u64, token: String) {
        debug!(user_id = %user_id, "Storing lyrebird token");
        self.inner.write().await.insert(user_id, token);
    }

    /// Fetch the stored token for a user
    pub async fn get(&self, user_id: u64) -> Option<String> {
        self.inner.read().await.get(&user_id).cloned()
    }

    /// Whether a token is stored for this user
    pub async fn contains(&self, user_id: u64) -> bool {
        self.inner.read().await.contains_key(&user_id)
    }
}

/// Opt-in registry: `(channel_id, user_id)` pairs whose ordinary messages in
/// that channel are spoken automatically
#[derive(Debug, Default)]
pub struct AlwaysSpeakRegistry {
    inner: RwLock<HashSet<(u64, u64)>>,
}

impl AlwaysSpeakRegistry {
    /// Enable or disable auto-speak for a user in a channel.
    ///
    /// Disabling a pair that was never enabled is a no-op.
    pub async fn set(&self, channel_id: u64, user_id: u64, enabled: bool) {
        let mut inner = self.inner.write().await;
        if enabled {
            inner.insert((channel_id, user_id));
        } else {
            inner.remove(&(channel_id, user_id));
        }
    }

    /// Whether auto-speak is enabled for a user in a channel
    pub async fn enabled(&self, channel_id: u64, user_id: u64) -> bool {
        self.inner.read().await.contains(&(channel_id, user_id))
    }
}

/// Parse the `always_speak` toggle argument.
///
/// `y`, `ye`, `yes` and `on` (case-insensitive) enable; anything else disables.
pub fn parse_always_speak(input: &str) -> bool {
    matches!(
        input.trim().to_lowercase().as_str(),
        "y" | "ye" | "yes" | "on"
    )
}

/// One entry of the token preload file
#[derive(Debug, Clone, Deserialize)]
pub struct TokenFileEntry {
    /// Lyrebird access token
    pub token: String,
    /// Channels in which this user starts with always-speak enabled
    #[serde(default)]
    pub default_channels: Vec<u64>,
}

/// Parse a token preload file (YAML map from user id to entry)
pub fn load_token_file(path: &Path) -> Result<HashMap<u64, TokenFileEntry>> {
    let raw = std::fs::read_to_string(path)?;
    let entries = parse_token_file(&raw)?;
    info!(path = %path.display(), users = %entries.len(), "Loaded token file");
    Ok(entries)
}

fn parse_token_file(raw: &str) -> Result<HashMap<u64, TokenFileEntry>> {
    Ok(serde_yaml::from_str(raw)?)
}

/// Apply preloaded entries to the token store and always-speak registry
pub async fn apply_token_file(
    entries: HashMap<u64, TokenFileEntry>,
    tokens: &TokenStore,
    always_speak: &AlwaysSpeakRegistry,
) {
    for (user_id, entry) in entries {
        tokens.insert(user_id, entry.token).await;
        for channel_id in entry.default_channels {
            always_speak.set(channel_id, user_id, true).await;
        }
    }
}
