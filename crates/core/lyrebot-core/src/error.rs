//! Error types for lyrebot

use thiserror::Error;

/// Main error type for lyrebot operations
#[derive(Debug, Error)]
pub enum LyrebotError {
    /// The requester is not connected to any voice channel
    #[error("user is not in a voice channel")]
    NotInVoiceChannel,

    /// No Lyrebird token is stored for the user
    #[error("no lyrebird token stored for user {0}")]
    NoToken(u64),

    /// The CSRF state returned on the OAuth callback does not match the one issued
    #[error("OAuth state mismatch")]
    StateMismatch,

    /// The OAuth callback URL could not be parsed into a (code, state) pair
    #[error("malformed OAuth callback: {0}")]
    CallbackParse(String),

    /// The authorization-code exchange against the token endpoint failed
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// The TTS generate endpoint rejected the request or was unreachable
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    /// Playback could not be set up for a synthesized audio file
    #[error("playback setup failed: {0}")]
    PlaybackSetup(String),

    /// Voice connection error
    #[error("voice error: {0}")]
    Voice(String),

    /// Discord client error
    #[error("discord error: {0}")]
    Discord(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network/HTTP error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Token preload file could not be parsed
    #[error("token file error: {0}")]
    TokenFile(#[from] serde_yaml::Error),
}

impl LyrebotError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a voice error
    pub fn voice(msg: impl Into<String>) -> Self {
        Self::Voice(msg.into())
    }

    /// Create a playback setup error
    pub fn playback(msg: impl Into<String>) -> Self {
        Self::PlaybackSetup(msg.into())
    }

    /// The chat-facing wording for this error.
    ///
    /// Every command-boundary error becomes a reply in the originating text
    /// channel rather than a crash; these strings are what users see.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotInVoiceChannel => "You are not in a voice channel.".to_string(),
            Self::NoToken(_) => {
                "I do not have a lyrebird token for you. Call set_token or generate_token_uri (in a PM)"
                    .to_string()
            }
            Self::StateMismatch => "MITM attack! (or you failed to copy-paste...)".to_string(),
            Self::CallbackParse(_) => {
                "That does not look like the URL you were redirected to. Paste the full callback URL."
                    .to_string()
            }
            other => format!(
                "An error occurred while processing this request: ```\n{}\n```",
                other
            ),
        }
    }
}

/// Result type alias for lyrebot operations
pub type Result<T> = std::result::Result<T, LyrebotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_token_user_message() {
        let err = LyrebotError::NoToken(42);
        assert!(err.user_message().starts_with("I do not have a lyrebird token"));
    }

    #[test]
    fn test_unclassified_errors_carry_kind_and_message() {
        let err = LyrebotError::Synthesis("generate returned 500".to_string());
        let msg = err.user_message();
        assert!(msg.contains("An error occurred"));
        assert!(msg.contains("generate returned 500"));
    }
}
