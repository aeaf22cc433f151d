use std::sync::Arc;

use chrono::Duration;

use slowchat_db::Database;
use slowchat_gateway::delivery::Delivery;
use slowchat_gateway::dispatcher::Dispatcher;

use crate::error::ApiError;
use crate::oauth::{OAuthProviders, OAuthStates};

pub type AppState = Arc<AppStateInner>;

/// Token and session parameters shared by password and OAuth logins.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub session_ttl: Duration,
    /// Session lifetime when the user ticks "remember me".
    pub remember_ttl: Duration,
    /// Browser origin allowed by CORS and the target of OAuth redirects.
    pub frontend_url: String,
}

impl AuthSettings {
    pub fn new(jwt_secret: impl Into<String>, frontend_url: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            session_ttl: Duration::hours(24),
            remember_ttl: Duration::days(30),
            frontend_url: frontend_url.into(),
        }
    }
}

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub delivery: Delivery,
    pub settings: AuthSettings,
    pub oauth: OAuthProviders,
    pub oauth_states: OAuthStates,
    pub http: reqwest::Client,
}

impl AppStateInner {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher, settings: AuthSettings, oauth: OAuthProviders) -> AppState {
        Arc::new(Self {
            delivery: Delivery::new(db.clone(), dispatcher),
            db,
            settings,
            oauth,
            oauth_states: OAuthStates::default(),
            http: reqwest::Client::new(),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.delivery.dispatcher()
    }

    /// Runs blocking DB work off the async runtime.
    pub async fn blocking<F, T>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.delivery.blocking(f).await.map_err(ApiError::from)
    }
}
