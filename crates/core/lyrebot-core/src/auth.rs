//! OAuth2 authorization-code flow for the Lyrebird API
//!
//! Two-step protocol per user: [`AuthFlow::begin_authorization`] issues an
//! authorization URL carrying a random CSRF state token, and
//! [`AuthFlow::complete_authorization`] exchanges the pasted callback URL for
//! an access token, verifying the state round-trip first.
//!
//! State tokens are held in memory only. Starting a second authorization for
//! the same user overwrites the pending state and invalidates the first
//! attempt.

use crate::lyrebird::{AUTH_API, HTTP_TIMEOUT, TOKEN_API};
use crate::{LyrebotError, Result, TokenStore};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Fixed OAuth2 scope requested from the authorization endpoint
const SCOPE: &str = "voice";
/// Length of the random CSRF state token
const STATE_LEN: usize = 32;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Per-user OAuth2 authorization-code flow manager
pub struct AuthFlow {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    authorize_endpoint: String,
    token_endpoint: String,
    http: reqwest::Client,
    tokens: Arc<TokenStore>,
    /// Pending CSRF state per user, consumed on a matching completion
    pending: RwLock<HashMap<u64, String>>,
}

impl AuthFlow {
    /// Create a flow manager against the production Lyrebird endpoints
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        tokens: Arc<TokenStore>,
    ) -> Self {
        Self::with_endpoints(
            client_id,
            client_secret,
            redirect_uri,
            tokens,
            AUTH_API,
            TOKEN_API,
        )
    }

    /// Create a flow manager against custom endpoints
    pub fn with_endpoints(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        tokens: Arc<TokenStore>,
        authorize_endpoint: impl Into<String>,
        token_endpoint: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            authorize_endpoint: authorize_endpoint.into(),
            token_endpoint: token_endpoint.into(),
            http,
            tokens,
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Build an authorization URL for the user and remember its CSRF state.
    ///
    /// The user visits the URL out-of-band and pastes the redirect back into
    /// `complete_authorization`.
    pub async fn begin_authorization(&self, user_id: u64) -> Result<String> {
        let state: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(STATE_LEN)
            .map(char::from)
            .collect();

        let url = url::Url::parse_with_params(
            &self.authorize_endpoint,
            &[
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("scope", SCOPE),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| LyrebotError::config(format!("bad authorize endpoint: {}", e)))?;

        debug!(user_id = %user_id, "Issued authorization URL");
        self.pending.write().await.insert(user_id, state);
        Ok(url.into())
    }

    /// Exchange the pasted callback URL for an access token.
    ///
    /// The state check happens before any network call; a mismatch means a
    /// forged or stale callback. On success the token is stored for the user
    /// and returned for display.
    pub async fn complete_authorization(&self, user_id: u64, callback_url: &str) -> Result<String> {
        let (code, state) = parse_callback(callback_url)?;

        {
            let mut pending = self.pending.write().await;
            match pending.get(&user_id) {
                Some(expected) if *expected == state => {
                    pending.remove(&user_id);
                }
                _ => {
                    warn!(user_id = %user_id, "OAuth state mismatch on callback");
                    return Err(LyrebotError::StateMismatch);
                }
            }
        }

        let response = self
            .http
            .post(&self.token_endpoint)
            .json(&serde_json::json!({
                "grant_type": "authorization_code",
                "client_id": self.client_id,
                "client_secret": self.client_secret,
                "code": code,
            }))
            .send()
            .await
            .map_err(|e| LyrebotError::TokenExchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LyrebotError::TokenExchange(format!(
                "token endpoint returned {}",
                status
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| LyrebotError::TokenExchange(e.to_string()))?;

        info!(user_id = %user_id, "Authorization complete, token stored");
        self.tokens
            .insert(user_id, token.access_token.clone())
            .await;
        Ok(token.access_token)
    }
}

/// Extract `(code, state)` from an OAuth callback URL.
///
/// The callback must carry exactly two query parameters, `code` then `state`
/// in that order; anything extra, missing, or reordered fails the parse. A
/// reordered query string did not come from the authorization server.
/// Trailing whitespace from a sloppy paste is tolerated.
fn parse_callback(callback_url: &str) -> Result<(String, String)> {
    let parsed = url::Url::parse(callback_url.trim())
        .map_err(|e| LyrebotError::CallbackParse(e.to_string()))?;

    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    match pairs.as_slice() {
        [(code_key, code), (state_key, state)] if code_key == "code" && state_key == "state" => {
            Ok((code.clone(), state.clone()))
        }
        _ => Err(LyrebotError::CallbackParse(
            "expected exactly '?code=...&state=...'".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn flow(token_endpoint: &str) -> AuthFlow {
        AuthFlow::with_endpoints(
            "client-id",
            "client-secret",
            "https://example.test/callback",
            Arc::new(TokenStore::default()),
            "https://auth.example.test/authorize",
            token_endpoint,
        )
    }

    fn state_from_url(auth_url: &str) -> String {
        let parsed = url::Url::parse(auth_url).unwrap();
        parsed
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[test]
    fn test_parse_callback_accepts_canonical_order() {
        let (code, state) =
            parse_callback("https://example.test/cb?code=abc&state=xyz").unwrap();
        assert_eq!((code.as_str(), state.as_str()), ("abc", "xyz"));
        let (code, state) =
            parse_callback("https://example.test/cb?code=abc&state=xyz \n").unwrap();
        assert_eq!((code.as_str(), state.as_str()), ("abc", "xyz"));
    }

    #[test]
    fn test_parse_callback_rejects_malformed() {
        for bad in [
            "https://example.test/cb",
            "https://example.test/cb?code=abc",
            "https://example.test/cb?state=xyz",
            "https://example.test/cb?state=xyz&code=abc",
            "https://example.test/cb?code=abc&state=xyz&session=1",
            "not a url at all",
        ] {
            assert!(
                matches!(parse_callback(bad), Err(LyrebotError::CallbackParse(_))),
                "{bad:?} should fail the parse"
            );
        }
    }

    #[tokio::test]
    async fn test_authorization_url_carries_scope_and_state() {
        let flow = flow("https://token.example.test/token");
        let auth_url = flow.begin_authorization(7).await.unwrap();
        let parsed = url::Url::parse(&auth_url).unwrap();
        let pairs: HashMap<String, String> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs["scope"], "voice");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "client-id");
        assert_eq!(pairs["state"].len(), STATE_LEN);
    }

    #[tokio::test]
    async fn test_state_mismatch_short_circuits_before_network() {
        // Unroutable token endpoint: a mismatch must fail without touching it.
        let flow = flow("http://127.0.0.1:1/token");
        flow.begin_authorization(7).await.unwrap();
        let err = flow
            .complete_authorization(7, "https://example.test/cb?code=abc&state=forged")
            .await
            .unwrap_err();
        assert!(matches!(err, LyrebotError::StateMismatch));
    }

    #[tokio::test]
    async fn test_complete_without_begin_is_state_mismatch() {
        let flow = flow("http://127.0.0.1:1/token");
        let err = flow
            .complete_authorization(9, "https://example.test/cb?code=abc&state=xyz")
            .await
            .unwrap_err();
        assert!(matches!(err, LyrebotError::StateMismatch));
    }

    #[tokio::test]
    async fn test_second_begin_invalidates_first_state() {
        let flow = flow("http://127.0.0.1:1/token");
        let first = flow.begin_authorization(7).await.unwrap();
        let _second = flow.begin_authorization(7).await.unwrap();
        let stale = state_from_url(&first);
        let err = flow
            .complete_authorization(
                7,
                &format!("https://example.test/cb?code=abc&state={stale}"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LyrebotError::StateMismatch));
    }

    #[tokio::test]
    async fn test_matching_state_exchanges_and_stores_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_partial_json(serde_json::json!({
                "grant_type": "authorization_code",
                "client_id": "client-id",
                "code": "abc",
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "access_token": "fresh-token" })),
            )
            .mount(&server)
            .await;

        let tokens = Arc::new(TokenStore::default());
        let flow = AuthFlow::with_endpoints(
            "client-id",
            "client-secret",
            "https://example.test/callback",
            tokens.clone(),
            "https://auth.example.test/authorize",
            format!("{}/token", server.uri()),
        );

        let auth_url = flow.begin_authorization(7).await.unwrap();
        let state = state_from_url(&auth_url);
        let token = flow
            .complete_authorization(
                7,
                &format!("https://example.test/cb?code=abc&state={state}"),
            )
            .await
            .unwrap();
        assert_eq!(token, "fresh-token");
        assert_eq!(tokens.get(7).await.as_deref(), Some("fresh-token"));

        // the pending state was consumed: replaying the callback fails
        let err = flow
            .complete_authorization(
                7,
                &format!("https://example.test/cb?code=abc&state={state}"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LyrebotError::StateMismatch));
    }

    #[tokio::test]
    async fn test_token_endpoint_error_is_token_exchange_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let flow = flow(&format!("{}/token", server.uri()));
        let auth_url = flow.begin_authorization(7).await.unwrap();
        let state = state_from_url(&auth_url);
        let err = flow
            .complete_authorization(
                7,
                &format!("https://example.test/cb?code=abc&state={state}"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LyrebotError::TokenExchange(_)));
    }
}
