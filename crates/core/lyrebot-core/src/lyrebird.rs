//! Lyrebird TTS client
//!
//! Thin wrapper over the Lyrebird `generate` endpoint: JSON `{"text": ...}`
//! with a bearer token in, raw WAV bytes out.

use crate::{LyrebotError, Result};
use std::time::Duration;
use tracing::{debug, info};

/// Speech generation endpoint
pub const GENERATE_API: &str = "https://avatar.lyrebird.ai/api/v0/generate";
/// OAuth2 token exchange endpoint
pub const TOKEN_API: &str = "https://avatar.lyrebird.ai/api/v0/token";
/// OAuth2 authorization endpoint (browser redirect)
pub const AUTH_API: &str = "https://myvoice.lyrebird.ai/authorize";

/// Timeout applied to all calls against the Lyrebird API
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the Lyrebird speech generation API
pub struct LyrebirdClient {
    http: reqwest::Client,
    generate_endpoint: String,
}

impl Default for LyrebirdClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LyrebirdClient {
    /// Create a client against the production endpoint
    pub fn new() -> Self {
        Self::with_endpoint(GENERATE_API)
    }

    /// Create a client against a custom generate endpoint
    pub fn with_endpoint(generate_endpoint: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            generate_endpoint: generate_endpoint.into(),
        }
    }

    /// Synthesize `text` into WAV bytes using the given per-user access token
    pub async fn synthesize(&self, text: &str, access_token: &str) -> Result<Vec<u8>> {
        debug!(text_len = %text.len(), "Requesting speech from lyrebird");
        let response = self
            .http
            .post(&self.generate_endpoint)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| LyrebotError::Synthesis(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LyrebotError::Synthesis(format!(
                "generate endpoint returned {}",
                status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| LyrebotError::Synthesis(e.to_string()))?;
        info!(text_len = %text.len(), audio_bytes = %bytes.len(), "Generated audio");
        Ok(bytes.to_vec())
    }
}
