//! Google and GitHub sign-in. The browser is sent to the provider with a
//! single-use `state`; the callback trades the code for an access token,
//! fetches the profile, links or creates the local user and hands a session
//! token back to the frontend in the URL fragment.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, State},
    response::Redirect,
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::Url;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use slowchat_db::OAuthProfile;

use crate::auth::start_session;
use crate::error::ApiError;
use crate::state::AppState;

/// How long an issued `state` value stays redeemable.
pub const STATE_TTL: Duration = Duration::from_secs(600);

const CLIENT_USER_AGENT: &str = concat!("slowchat/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OAuthProvider {
    Google,
    GitHub,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::GitHub => "github",
        }
    }

    fn authorize_endpoint(&self) -> &'static str {
        match self {
            Self::Google => "https://accounts.google.com/o/oauth2/v2/auth",
            Self::GitHub => "https://github.com/login/oauth/authorize",
        }
    }

    fn token_endpoint(&self) -> &'static str {
        match self {
            Self::Google => "https://oauth2.googleapis.com/token",
            Self::GitHub => "https://github.com/login/oauth/access_token",
        }
    }

    fn scope(&self) -> &'static str {
        match self {
            Self::Google => "openid email profile",
            Self::GitHub => "read:user user:email",
        }
    }
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OAuthProvider {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(Self::Google),
            "github" => Ok(Self::GitHub),
            _ => Err(ApiError::NotFound("provider")),
        }
    }
}

/// App registration with one provider.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub callback_url: String,
}

/// Configured providers. A provider without credentials is disabled and its
/// routes answer 404.
#[derive(Debug, Clone, Default)]
pub struct OAuthProviders {
    pub google: Option<OAuthClient>,
    pub github: Option<OAuthClient>,
}

impl OAuthProviders {
    pub fn get(&self, provider: OAuthProvider) -> Option<&OAuthClient> {
        match provider {
            OAuthProvider::Google => self.google.as_ref(),
            OAuthProvider::GitHub => self.github.as_ref(),
        }
    }
}

/// Outstanding `state` values, each redeemable once for its provider.
#[derive(Default)]
pub struct OAuthStates {
    pending: Mutex<HashMap<String, (OAuthProvider, Instant)>>,
}

impl OAuthStates {
    pub fn issue(&self, provider: OAuthProvider, now: Instant) -> String {
        let state = URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>());
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|_, (_, issued)| now.duration_since(*issued) < STATE_TTL);
        pending.insert(state.clone(), (provider, now));
        state
    }

    /// Consumes `state`. True only if it was issued for `provider` and has
    /// not expired.
    pub fn redeem(&self, state: &str, provider: OAuthProvider, now: Instant) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.remove(state) {
            Some((issued_for, issued)) => issued_for == provider && now.duration_since(issued) < STATE_TTL,
            None => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider answered without {0}")]
    Missing(&'static str),
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

pub fn authorize_url(provider: OAuthProvider, client: &OAuthClient, state: &str) -> Result<Url, ApiError> {
    let mut params = vec![
        ("client_id", client.client_id.as_str()),
        ("redirect_uri", client.callback_url.as_str()),
        ("scope", provider.scope()),
        ("state", state),
    ];
    if provider == OAuthProvider::Google {
        params.push(("response_type", "code"));
    }
    Url::parse_with_params(provider.authorize_endpoint(), &params)
        .map_err(|e| ApiError::from(anyhow::anyhow!("bad authorize url: {}", e)))
}

/// `GET /auth/{provider}`
pub async fn begin(State(state): State<AppState>, Path(provider): Path<String>) -> Result<Redirect, ApiError> {
    let provider: OAuthProvider = provider.parse()?;
    let client = state.oauth.get(provider).ok_or(ApiError::NotFound("provider"))?;
    let nonce = state.oauth_states.issue(provider, Instant::now());
    let url = authorize_url(provider, client, &nonce)?;
    Ok(Redirect::to(url.as_str()))
}

/// `GET /auth/{provider}/callback`
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Redirect, ApiError> {
    let provider: OAuthProvider = provider.parse()?;
    let client = state.oauth.get(provider).ok_or(ApiError::NotFound("provider"))?;

    if let Some(error) = &query.error {
        warn!("{} sign-in declined: {}", provider, error);
        return Ok(frontend_redirect(&state, "error=access_denied"));
    }
    let (Some(code), Some(nonce)) = (query.code.as_deref(), query.state.as_deref()) else {
        return Err(ApiError::Validation("code and state are required".into()));
    };
    if !state.oauth_states.redeem(nonce, provider, Instant::now()) {
        return Err(ApiError::Validation("unknown or expired oauth state".into()));
    }

    let profile = match fetch_profile(&state.http, provider, client, code).await {
        Ok(profile) => profile,
        Err(e) => {
            warn!("{} sign-in failed: {}", provider, e);
            return Ok(frontend_redirect(&state, "error=oauth_failed"));
        }
    };

    let new_id = Uuid::new_v4().to_string();
    let user = state
        .blocking(move |db| db.upsert_oauth_user(&new_id, &profile))
        .await?;
    info!("{} ({}) signed in with {}", user.handle(), user.id, provider);

    let auth = start_session(&state, user, false).await?;
    Ok(frontend_redirect(&state, &format!("token={}", auth.token)))
}

fn frontend_redirect(state: &AppState, fragment: &str) -> Redirect {
    let base = state.settings.frontend_url.trim_end_matches('/');
    Redirect::to(&format!("{}/auth/callback#{}", base, fragment))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleProfile {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
    name: Option<String>,
    picture: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubProfile {
    id: i64,
    login: String,
    name: Option<String>,
    email: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

async fn fetch_profile(
    http: &reqwest::Client,
    provider: OAuthProvider,
    client: &OAuthClient,
    code: &str,
) -> Result<OAuthProfile, OAuthError> {
    let token: TokenResponse = http
        .post(provider.token_endpoint())
        .header(ACCEPT, "application/json")
        .form(&[
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", client.callback_url.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let access_token = token.access_token.ok_or(OAuthError::Missing("access_token"))?;

    match provider {
        OAuthProvider::Google => {
            let profile: GoogleProfile = http
                .get("https://www.googleapis.com/oauth2/v3/userinfo")
                .bearer_auth(&access_token)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok(google_profile(profile))
        }
        OAuthProvider::GitHub => {
            let profile: GitHubProfile = github_get(http, "https://api.github.com/user", &access_token).await?;
            let email = match profile.email.clone() {
                Some(email) => Some(email),
                None => {
                    let emails: Vec<GitHubEmail> =
                        github_get(http, "https://api.github.com/user/emails", &access_token).await?;
                    primary_email(emails)
                }
            };
            Ok(github_profile(profile, email))
        }
    }
}

async fn github_get<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    access_token: &str,
) -> Result<T, OAuthError> {
    Ok(http
        .get(url)
        .bearer_auth(access_token)
        .header(USER_AGENT, CLIENT_USER_AGENT)
        .header(ACCEPT, "application/vnd.github+json")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?)
}

fn google_profile(p: GoogleProfile) -> OAuthProfile {
    OAuthProfile {
        provider: OAuthProvider::Google.as_str().to_string(),
        provider_id: p.sub,
        // Unverified addresses must not link to an existing account.
        email: p.email.filter(|_| p.email_verified),
        username: None,
        name: p.name,
        avatar_url: p.picture,
    }
}

fn github_profile(p: GitHubProfile, email: Option<String>) -> OAuthProfile {
    OAuthProfile {
        provider: OAuthProvider::GitHub.as_str().to_string(),
        provider_id: p.id.to_string(),
        email,
        username: Some(p.login),
        name: p.name,
        avatar_url: p.avatar_url,
    }
}

fn primary_email(emails: Vec<GitHubEmail>) -> Option<String> {
    emails.into_iter().find(|e| e.primary && e.verified).map(|e| e.email)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OAuthClient {
        OAuthClient {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            callback_url: "http://localhost:3000/api/auth/github/callback".into(),
        }
    }

    #[test]
    fn state_is_single_use_and_provider_bound() {
        let states = OAuthStates::default();
        let now = Instant::now();

        let s = states.issue(OAuthProvider::GitHub, now);
        assert!(states.redeem(&s, OAuthProvider::GitHub, now));
        assert!(!states.redeem(&s, OAuthProvider::GitHub, now));

        let s = states.issue(OAuthProvider::GitHub, now);
        assert!(!states.redeem(&s, OAuthProvider::Google, now));

        let s = states.issue(OAuthProvider::Google, now);
        assert!(!states.redeem(&s, OAuthProvider::Google, now + STATE_TTL));

        assert!(!states.redeem("forged", OAuthProvider::Google, now));
    }

    #[test]
    fn states_are_distinct() {
        let states = OAuthStates::default();
        let now = Instant::now();
        assert_ne!(states.issue(OAuthProvider::Google, now), states.issue(OAuthProvider::Google, now));
    }

    #[test]
    fn authorize_url_carries_client_and_state() {
        let url = authorize_url(OAuthProvider::GitHub, &client(), "xyz").unwrap();
        assert_eq!(url.host_str(), Some("github.com"));
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "cid");
        assert_eq!(params["state"], "xyz");
        assert_eq!(params["redirect_uri"], "http://localhost:3000/api/auth/github/callback");
        assert!(!params.contains_key("response_type"));

        let url = authorize_url(OAuthProvider::Google, &client(), "xyz").unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
    }

    #[test]
    fn unknown_provider_is_not_found() {
        assert!(matches!("gitlab".parse::<OAuthProvider>(), Err(ApiError::NotFound(_))));
        assert_eq!("github".parse::<OAuthProvider>().unwrap(), OAuthProvider::GitHub);
    }

    #[test]
    fn github_falls_back_to_primary_verified_email() {
        let emails = vec![
            GitHubEmail { email: "old@x.io".into(), primary: false, verified: true },
            GitHubEmail { email: "main@x.io".into(), primary: true, verified: true },
        ];
        assert_eq!(primary_email(emails).as_deref(), Some("main@x.io"));

        let unverified = vec![GitHubEmail { email: "main@x.io".into(), primary: true, verified: false }];
        assert_eq!(primary_email(unverified), None);
    }

    #[test]
    fn google_drops_unverified_email() {
        let profile = google_profile(GoogleProfile {
            sub: "123".into(),
            email: Some("a@b.co".into()),
            email_verified: false,
            name: Some("A".into()),
            picture: None,
        });
        assert_eq!(profile.email, None);
        assert_eq!(profile.provider, "google");
        assert_eq!(profile.provider_id, "123");
    }
}
