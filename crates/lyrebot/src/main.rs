//! Lyrebot entry point: logging, configuration, token preload, gateway start

use lyrebot_core::{load_env, tokens, AlwaysSpeakRegistry, AuthFlow, BotConfig, TokenStore};
use lyrebot_discord::{start_bot, DiscordConfig};
use std::sync::Arc;
use tracing::{info, warn};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,lyrebot=debug")),
        )
        .init();
}

#[tokio::main]
async fn main() -> lyrebot_core::Result<()> {
    init_tracing();
    load_env()?;
    let config = BotConfig::from_env()?;

    let token_store = Arc::new(TokenStore::default());
    let always_speak = Arc::new(AlwaysSpeakRegistry::default());

    if config.token_file.exists() {
        match tokens::load_token_file(&config.token_file) {
            Ok(entries) => {
                tokens::apply_token_file(entries, &token_store, &always_speak).await;
            }
            Err(e) => {
                warn!(
                    path = %config.token_file.display(),
                    error = %e,
                    "Ignoring unreadable token file"
                );
            }
        }
    }

    let auth = Arc::new(AuthFlow::new(
        config.client_id,
        config.client_secret,
        config.redirect_uri,
        token_store.clone(),
    ));

    info!("Starting lyrebot");
    start_bot(
        DiscordConfig::new(config.discord_token),
        token_store,
        always_speak,
        auth,
    )
    .await
}
