use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, bail};
use chrono::Duration;
use tracing::warn;

use slowchat_api::AuthSettings;
use slowchat_api::oauth::{OAuthClient, OAuthProviders};

pub const DEV_JWT_SECRET: &str = "dev-secret-change-me";

/// Server settings read from the environment (a `.env` file is loaded first).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub frontend_url: String,
    pub session_ttl_hours: i64,
    pub remember_ttl_days: i64,
    pub session_cleanup_secs: u64,
    pub google: Option<OAuthClient>,
    pub github: Option<OAuthClient>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests need not touch the
    /// process environment.
    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            host: get("SLOWCHAT_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_var(&get, "SLOWCHAT_PORT", 3000)?,
            db_path: PathBuf::from(get("SLOWCHAT_DB_PATH").unwrap_or_else(|| "slowchat.db".into())),
            jwt_secret: get("SLOWCHAT_JWT_SECRET").unwrap_or_else(|| DEV_JWT_SECRET.into()),
            frontend_url: get("SLOWCHAT_FRONTEND_URL").unwrap_or_else(|| "http://localhost:3001".into()),
            session_ttl_hours: parse_var(&get, "SLOWCHAT_SESSION_TTL_HOURS", 24)?,
            remember_ttl_days: parse_var(&get, "SLOWCHAT_REMEMBER_TTL_DAYS", 30)?,
            session_cleanup_secs: parse_var(&get, "SLOWCHAT_SESSION_CLEANUP_SECS", 3600)?,
            google: oauth_client(&get, "GOOGLE"),
            github: oauth_client(&get, "GITHUB"),
        };

        if config.session_ttl_hours <= 0 || config.remember_ttl_days <= 0 {
            bail!("Session lifetimes must be positive");
        }
        if config.session_cleanup_secs == 0 {
            bail!("SLOWCHAT_SESSION_CLEANUP_SECS must be positive");
        }
        if config.jwt_secret.is_empty() {
            bail!("SLOWCHAT_JWT_SECRET must not be empty");
        }
        Ok(config)
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            jwt_secret: self.jwt_secret.clone(),
            session_ttl: Duration::hours(self.session_ttl_hours),
            remember_ttl: Duration::days(self.remember_ttl_days),
            frontend_url: self.frontend_url.clone(),
        }
    }

    pub fn oauth_providers(&self) -> OAuthProviders {
        OAuthProviders {
            google: self.google.clone(),
            github: self.github.clone(),
        }
    }
}

fn parse_var<F, T>(get: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid {}: '{}'", key, raw)),
        None => Ok(default),
    }
}

/// A provider is enabled only when id, secret and callback URL are all set.
fn oauth_client<F>(get: &F, prefix: &str) -> Option<OAuthClient>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| get(&format!("{}_{}", prefix, name)).filter(|v| !v.trim().is_empty());
    match (var("CLIENT_ID"), var("CLIENT_SECRET"), var("CALLBACK_URL")) {
        (Some(client_id), Some(client_secret), Some(callback_url)) => Some(OAuthClient {
            client_id,
            client_secret,
            callback_url,
        }),
        (None, None, None) => None,
        _ => {
            warn!("{} OAuth is partially configured; it stays disabled", prefix);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("slowchat.db"));
        assert_eq!(config.frontend_url, "http://localhost:3001");
        assert_eq!(config.session_ttl_hours, 24);
        assert_eq!(config.remember_ttl_days, 30);
        assert!(config.uses_dev_secret());
        assert!(config.google.is_none() && config.github.is_none());

        let settings = config.auth_settings();
        assert_eq!(settings.session_ttl, Duration::hours(24));
        assert_eq!(settings.remember_ttl, Duration::days(30));
    }

    #[test]
    fn overrides_and_bad_numbers() {
        let config = Config::from_lookup(lookup(&[
            ("SLOWCHAT_PORT", "8080"),
            ("SLOWCHAT_JWT_SECRET", "s3cret"),
            ("SLOWCHAT_SESSION_TTL_HOURS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.session_ttl_hours, 2);
        assert!(!config.uses_dev_secret());

        let err = Config::from_lookup(lookup(&[("SLOWCHAT_PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("SLOWCHAT_PORT"));

        assert!(Config::from_lookup(lookup(&[("SLOWCHAT_REMEMBER_TTL_DAYS", "0")])).is_err());
    }

    #[test]
    fn oauth_needs_all_three_values() {
        let config = Config::from_lookup(lookup(&[
            ("GITHUB_CLIENT_ID", "id"),
            ("GITHUB_CLIENT_SECRET", "secret"),
            ("GITHUB_CALLBACK_URL", "http://localhost:3000/api/auth/github/callback"),
            ("GOOGLE_CLIENT_ID", "id-only"),
        ]))
        .unwrap();
        assert_eq!(config.github.as_ref().map(|c| c.client_id.as_str()), Some("id"));
        assert!(config.google.is_none());
        assert!(config.oauth_providers().github.is_some());
    }
}
