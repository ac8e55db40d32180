use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use google_drive3::oauth2::{read_application_secret, ApplicationSecret};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{FsError, FsResult};
use crate::prelude::*;
use crate::store::{AuthSession, MetadataStore};

const SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";
const DEFAULT_REDIRECT_URI: &str = "http://localhost";

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// lifetime in seconds
    pub expires_in: u64,
    /// only sent on the first exchange, refreshes keep the old one
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn default_token_type() -> String {
    String::from("Bearer")
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange_code(&self, code: &str) -> FsResult<TokenGrant>;
    async fn refresh(&self, refresh_token: &str) -> FsResult<TokenGrant>;
}

/// Installed-app OAuth client talking to the token endpoint of the client secret.
pub struct OAuthClient {
    http: reqwest::Client,
    secret: ApplicationSecret,
}

impl OAuthClient {
    pub fn new(secret: ApplicationSecret) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret,
        }
    }

    pub async fn from_secret_file(path: &Path) -> Result<Self> {
        let secret = read_application_secret(path)
            .await
            .with_context(|| format!("could not read client secret {}", path.display()))?;
        Ok(Self::new(secret))
    }

    fn redirect_uri(&self) -> &str {
        self.secret
            .redirect_uris
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_REDIRECT_URI)
    }

    /// Page where the user grants access and receives the authorization code.
    pub fn consent_url(&self) -> Result<String> {
        let url = reqwest::Url::parse_with_params(
            &self.secret.auth_uri,
            &[
                ("client_id", self.secret.client_id.as_str()),
                ("redirect_uri", self.redirect_uri()),
                ("response_type", "code"),
                ("scope", SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )?;
        Ok(url.to_string())
    }

    async fn request_grant(&self, form: &[(&str, &str)]) -> FsResult<TokenGrant> {
        let response = self
            .http
            .post(&self.secret.token_uri)
            .form(form)
            .send()
            .await
            .map_err(|e| FsError::RemoteUnavailable(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| FsError::RemoteUnavailable(e.to_string()))?;
        if status.is_success() {
            return serde_json::from_slice(&body)
                .map_err(|e| FsError::AuthInvalid(format!("undecodable token response: {e}")));
        }
        let body = String::from_utf8_lossy(&body);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(FsError::RemoteUnavailable(format!("{status}: {body}")))
        } else {
            Err(FsError::AuthInvalid(format!("{status}: {body}")))
        }
    }
}

#[async_trait]
impl TokenEndpoint for OAuthClient {
    #[instrument(skip_all)]
    async fn exchange_code(&self, code: &str) -> FsResult<TokenGrant> {
        self.request_grant(&[
            ("code", code),
            ("client_id", self.secret.client_id.as_str()),
            ("client_secret", self.secret.client_secret.as_str()),
            ("redirect_uri", self.redirect_uri()),
            ("grant_type", "authorization_code"),
        ])
        .await
    }

    #[instrument(skip_all)]
    async fn refresh(&self, refresh_token: &str) -> FsResult<TokenGrant> {
        self.request_grant(&[
            ("refresh_token", refresh_token),
            ("client_id", self.secret.client_id.as_str()),
            ("client_secret", self.secret.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .await
    }
}

/// The OAuth credential of the account.
///
/// Refreshing and reading the token for a request happen under the same lock, so a
/// request never sees a half-updated session.
pub struct Credentials {
    session: Mutex<Option<AuthSession>>,
    endpoint: Arc<dyn TokenEndpoint>,
    store: Arc<MetadataStore>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials")
    }
}

impl Credentials {
    /// Loads the persisted session, if there is one.
    pub fn load(store: Arc<MetadataStore>, endpoint: Arc<dyn TokenEndpoint>) -> FsResult<Self> {
        let session = store.load_auth_session()?;
        debug!("stored credential present: {}", session.is_some());
        Ok(Self {
            session: Mutex::new(session),
            endpoint,
            store,
        })
    }

    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn expiry(&self) -> Option<SystemTime> {
        self.session.lock().await.as_ref().map(|s| s.expiry)
    }

    /// First login: trades a one-time authorization code for a session.
    #[instrument(skip_all)]
    pub async fn login(&self, code: &str) -> FsResult<()> {
        let mut session = self.session.lock().await;
        let grant = self.endpoint.exchange_code(code.trim()).await?;
        let refresh_token = grant
            .refresh_token
            .clone()
            .ok_or_else(|| FsError::AuthInvalid("no refresh token granted".into()))?;
        let fresh = session_from_grant(grant, refresh_token, SystemTime::now());
        self.store.save_auth_session(&fresh)?;
        *session = Some(fresh);
        info!("logged in");
        Ok(())
    }

    /// Refreshes the session if it has reached its expiry.
    pub async fn ensure_fresh(&self) -> FsResult<()> {
        let mut session = self.session.lock().await;
        self.refresh_locked(&mut session).await
    }

    /// `Authorization` header value for the next request.
    pub async fn authorization(&self) -> FsResult<String> {
        let mut session = self.session.lock().await;
        self.refresh_locked(&mut session).await?;
        let session = session
            .as_ref()
            .ok_or_else(|| FsError::AuthInvalid("not logged in".into()))?;
        Ok(format!("{} {}", session.token_type, session.access_token))
    }

    /// Marks the session expired, so the next call refreshes it.
    pub async fn invalidate(&self) {
        if let Some(session) = self.session.lock().await.as_mut() {
            warn!("access token rejected, refreshing before the next call");
            session.expiry = UNIX_EPOCH;
        }
    }

    async fn refresh_locked(&self, session: &mut Option<AuthSession>) -> FsResult<()> {
        let current = session
            .as_ref()
            .ok_or_else(|| FsError::AuthInvalid("not logged in".into()))?;
        let now = SystemTime::now();
        if !current.is_expired(now) {
            return Ok(());
        }
        debug!("refreshing access token");
        let grant = self.endpoint.refresh(&current.refresh_token).await?;
        let refresh_token = grant
            .refresh_token
            .clone()
            .unwrap_or_else(|| current.refresh_token.clone());
        let fresh = session_from_grant(grant, refresh_token, now);
        self.store.save_auth_session(&fresh)?;
        *session = Some(fresh);
        Ok(())
    }
}

/// Keeps 1/6 of the granted lifetime as a safety margin.
fn session_from_grant(grant: TokenGrant, refresh_token: String, now: SystemTime) -> AuthSession {
    let lifetime = Duration::from_secs(grant.expires_in);
    AuthSession {
        token_type: grant.token_type,
        access_token: grant.access_token,
        refresh_token,
        expiry: now + lifetime * 5 / 6,
    }
}
