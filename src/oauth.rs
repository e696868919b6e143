//! OAuth session for the CRM.
//!
//! Tokens live server-side in a [`TokenStore`]. The callback route exchanges
//! the authorization code, and an expired or rejected access token is
//! rotated with the refresh token.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::CrmConfig;
use crate::error::CrmError;

/// Refresh this long before the access token actually expires.
const EXPIRY_SKEW_SECS: i64 = 60;
const STATE_LEN: usize = 32;
/// Login round trips older than this are forgotten.
const STATE_TTL_SECS: i64 = 600;
/// Upper bound on outstanding login states; the oldest is dropped first.
const MAX_PENDING_STATES: usize = 64;

#[derive(Clone)]
pub struct TokenSet {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub expires_at: DateTime<Utc>,
}

impl TokenSet {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_SKEW_SECS) >= self.expires_at
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct TokenStore {
    tokens: RwLock<Option<TokenSet>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: TokenSet) -> Self {
        Self {
            tokens: RwLock::new(Some(tokens)),
        }
    }

    pub async fn get(&self) -> Option<TokenSet> {
        self.tokens.read().await.clone()
    }

    pub async fn set(&self, tokens: TokenSet) {
        *self.tokens.write().await = Some(tokens);
    }

    pub async fn clear(&self) {
        *self.tokens.write().await = None;
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

impl From<TokenResponse> for TokenSet {
    fn from(resp: TokenResponse) -> Self {
        Self {
            access_token: SecretString::from(resp.access_token),
            refresh_token: SecretString::from(resp.refresh_token),
            expires_at: Utc::now() + Duration::seconds(resp.expires_in),
        }
    }
}

pub struct CrmOAuth {
    http: reqwest::Client,
    auth_url: String,
    client_id: String,
    client_secret: SecretString,
    redirect_uri: String,
    tokens: Arc<TokenStore>,
    /// Outstanding anti-forgery states and when they were issued.
    pending_states: Mutex<HashMap<String, DateTime<Utc>>>,
    refresh_lock: Mutex<()>,
}

impl CrmOAuth {
    pub fn new(config: &CrmConfig, tokens: Arc<TokenStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth_url: config.auth_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            tokens,
            pending_states: Mutex::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Authorization URL with a fresh anti-forgery state.
    pub async fn begin_login(&self) -> String {
        let state: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(STATE_LEN)
            .map(char::from)
            .collect();
        self.remember_state(state.clone(), Utc::now()).await;
        format!(
            "{}/oauth2/authorize?client_id={}&response_type=code&redirect_uri={}&state={}",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            state
        )
    }

    async fn remember_state(&self, state: String, now: DateTime<Utc>) {
        let mut pending = self.pending_states.lock().await;
        pending.retain(|_, issued| !state_expired(*issued, now));
        while pending.len() >= MAX_PENDING_STATES {
            let Some(oldest) = pending
                .iter()
                .min_by_key(|(_, issued)| **issued)
                .map(|(s, _)| s.clone())
            else {
                break;
            };
            pending.remove(&oldest);
        }
        pending.insert(state, now);
    }

    /// Handle the OAuth callback: check the state and exchange the code.
    pub async fn complete_login(&self, code: &str, state: &str) -> Result<(), CrmError> {
        let issued = self.pending_states.lock().await.remove(state);
        if !issued.is_some_and(|issued| !state_expired(issued, Utc::now())) {
            return Err(CrmError::Unauthorized(
                "unknown, reused or expired OAuth state".to_string(),
            ));
        }
        let tokens = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .await?;
        self.tokens.set(tokens).await;
        tracing::info!("CRM session established");
        Ok(())
    }

    /// Current access token, refreshing it first when it is about to expire.
    pub async fn access_token(&self) -> Result<SecretString, CrmError> {
        let tokens = self.tokens.get().await.ok_or_else(|| {
            CrmError::Unauthorized("no CRM session, sign in first".to_string())
        })?;
        if !tokens.is_expired(Utc::now()) {
            return Ok(tokens.access_token);
        }
        self.refresh().await?;
        self.tokens
            .get()
            .await
            .map(|t| t.access_token)
            .ok_or_else(|| CrmError::Unauthorized("CRM session was cleared".to_string()))
    }

    /// Rotate the token pair. A caller that queued behind a rotation of the
    /// refresh token it saw reuses that result instead of rotating again.
    pub async fn refresh(&self) -> Result<(), CrmError> {
        let seen = self
            .tokens
            .get()
            .await
            .map(|t| t.refresh_token.expose_secret().to_string());
        let _guard = self.refresh_lock.lock().await;
        let Some(current) = self.tokens.get().await else {
            return Err(CrmError::Unauthorized(
                "no refresh token available".to_string(),
            ));
        };
        let refresh_token = current.refresh_token.expose_secret().to_string();
        if seen.is_some_and(|seen| seen != refresh_token) {
            tracing::debug!("CRM token already rotated while waiting");
            return Ok(());
        }
        match self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .await
        {
            Ok(tokens) => {
                self.tokens.set(tokens).await;
                tracing::debug!("CRM access token refreshed");
                Ok(())
            }
            Err(e) => {
                tracing::warn!("CRM token refresh failed, clearing session: {}", e);
                self.tokens.clear().await;
                Err(CrmError::Unauthorized(e.to_string()))
            }
        }
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenSet, CrmError> {
        let endpoint = format!("{}/oauth2/access_token", self.auth_url);
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
        ];
        form.extend_from_slice(params);

        let response = self
            .http
            .post(&endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| CrmError::Network {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::Api {
                endpoint,
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = response.json().await.map_err(|e| CrmError::Parse {
            endpoint,
            reason: e.to_string(),
        })?;
        Ok(parsed.into())
    }
}

fn state_expired(issued: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - issued > Duration::seconds(STATE_TTL_SECS)
}
