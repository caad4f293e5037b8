//! Configuration management.
//!
//! Connection settings live in `~/.backlog-sync/config.json`:
//!
//! ```json
//! {
//!   "instance_url": "https://example.service-now.com",
//!   "auth": "oauth",
//!   "client_id": "...",
//!   "schema_path": "schema.yaml",
//!   "concurrency": 4
//! }
//! ```
//!
//! Each value resolves as: environment variable > config file > default.
//! Secrets are best kept in the environment.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::MatchPolicy;
use crate::remote::{AuthProvider, ClientConfig, Credential, OAuthGrant, OAuthProvider, RetryPolicy};

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "BACKLOG_CONFIG";

pub const INSTANCE_URL_ENV: &str = "BACKLOG_INSTANCE_URL";
pub const AUTH_ENV: &str = "BACKLOG_AUTH";
pub const USERNAME_ENV: &str = "BACKLOG_USERNAME";
pub const PASSWORD_ENV: &str = "BACKLOG_PASSWORD";
pub const TOKEN_ENV: &str = "BACKLOG_TOKEN";
pub const CLIENT_ID_ENV: &str = "BACKLOG_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "BACKLOG_CLIENT_SECRET";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How to authenticate against the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Username and password on every request.
    Basic,
    /// Pre-issued bearer token.
    Token,
    /// OAuth password grant.
    Oauth,
    /// OAuth client-credentials grant.
    OauthClient,
}

impl AuthMethod {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Token => "token",
            Self::Oauth => "oauth",
            Self::OauthClient => "oauth_client",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "token" | "bearer" => Ok(Self::Token),
            "oauth" | "oauth_password" => Ok(Self::Oauth),
            "oauth_client" | "client_credentials" => Ok(Self::OauthClient),
            _ => Err(format!(
                "unknown auth method '{s}' (basic, token, oauth, oauth_client)"
            )),
        }
    }
}

/// Contents of the config file. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklogConfig {
    pub instance_url: Option<String>,
    pub auth: Option<AuthMethod>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub schema_path: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub match_policy: Option<MatchPolicy>,
    pub timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub page_size: Option<usize>,
}

/// Default config file location.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".backlog-sync").join("config.json"))
}

/// Load the config file.
///
/// `explicit` (from `--config` or `BACKLOG_CONFIG`) must exist; the default
/// location is optional.
///
/// # Errors
///
/// Returns `Error::Config` if an explicit file is missing or any file cannot
/// be read or parsed.
pub fn load_config(explicit: Option<&Path>) -> Result<BacklogConfig> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            path.to_path_buf()
        }
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => {
                tracing::debug!("No config file, using defaults");
                return Ok(BacklogConfig::default());
            }
        },
    };

    let content = fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

    let config = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config file: {e}")))?;
    tracing::debug!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// Fully resolved settings for one command.
///
/// Deliberately not `Debug`: it carries secrets.
#[derive(Clone)]
pub struct Settings {
    pub instance_url: Option<String>,
    pub auth: AuthMethod,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub schema_path: Option<PathBuf>,
    pub concurrency: usize,
    pub match_policy: MatchPolicy,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub page_size: Option<usize>,
}

impl Settings {
    /// Resolve from the process environment and a loaded config.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unparseable `BACKLOG_AUTH`.
    pub fn from_environment(config: &BacklogConfig) -> Result<Self> {
        Self::resolve(config, |key| {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        })
    }

    /// Resolve with an explicit environment lookup.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unparseable auth method.
    pub fn resolve(config: &BacklogConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let pick = |key: &str, file: &Option<String>| env(key).or_else(|| file.clone());

        let username = pick(USERNAME_ENV, &config.username);
        let password = pick(PASSWORD_ENV, &config.password);
        let token = pick(TOKEN_ENV, &config.token);
        let client_id = pick(CLIENT_ID_ENV, &config.client_id);
        let client_secret = pick(CLIENT_SECRET_ENV, &config.client_secret);

        let auth = match env(AUTH_ENV) {
            Some(value) => value.parse().map_err(Error::Config)?,
            None => config.auth.unwrap_or_else(|| {
                infer_auth(token.is_some(), client_id.is_some(), username.is_some())
            }),
        };

        Ok(Self {
            instance_url: pick(INSTANCE_URL_ENV, &config.instance_url),
            auth,
            username,
            password,
            token,
            client_id,
            client_secret,
            schema_path: config.schema_path.clone(),
            concurrency: config.concurrency.unwrap_or(1).max(1),
            match_policy: config.match_policy.unwrap_or_default(),
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            max_attempts: config
                .max_attempts
                .unwrap_or_else(|| RetryPolicy::default().max_attempts)
                .max(1),
            page_size: config.page_size,
        })
    }

    /// Connection settings for the Table API client.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no instance URL is configured.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut client = ClientConfig::new(self.require_instance()?);
        client.timeout = self.timeout;
        client.retry.max_attempts = self.max_attempts;
        if let Some(page_size) = self.page_size {
            client.page_size = page_size.max(1);
        }
        Ok(client)
    }

    /// Build the credential provider for the selected auth method.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the missing credential.
    pub fn auth_provider(&self) -> Result<AuthProvider> {
        let provider = match self.auth {
            AuthMethod::Basic => AuthProvider::Static(Credential::Basic {
                username: required(&self.username, USERNAME_ENV, self.auth)?,
                password: required(&self.password, PASSWORD_ENV, self.auth)?,
            }),
            AuthMethod::Token => {
                AuthProvider::Static(Credential::Bearer(required(&self.token, TOKEN_ENV, self.auth)?))
            }
            AuthMethod::Oauth | AuthMethod::OauthClient => {
                let grant = if self.auth == AuthMethod::Oauth {
                    OAuthGrant::Password {
                        username: required(&self.username, USERNAME_ENV, self.auth)?,
                        password: required(&self.password, PASSWORD_ENV, self.auth)?,
                    }
                } else {
                    OAuthGrant::ClientCredentials
                };
                AuthProvider::OAuth(OAuthProvider::new(
                    &self.require_instance()?,
                    required(&self.client_id, CLIENT_ID_ENV, self.auth)?,
                    required(&self.client_secret, CLIENT_SECRET_ENV, self.auth)?,
                    grant,
                )
                .with_timeout(self.timeout))
            }
        };
        tracing::debug!(auth = %self.auth, "Resolved credential provider");
        Ok(provider)
    }

    fn require_instance(&self) -> Result<String> {
        self.instance_url.clone().ok_or_else(|| {
            Error::Config(format!(
                "No instance URL configured (set {INSTANCE_URL_ENV} or instance_url)"
            ))
        })
    }
}

fn infer_auth(has_token: bool, has_client: bool, has_user: bool) -> AuthMethod {
    match (has_token, has_client, has_user) {
        (true, _, _) => AuthMethod::Token,
        (false, true, true) => AuthMethod::Oauth,
        (false, true, false) => AuthMethod::OauthClient,
        (false, false, _) => AuthMethod::Basic,
    }
}

fn required(value: &Option<String>, env: &str, auth: AuthMethod) -> Result<String> {
    value
        .clone()
        .ok_or_else(|| Error::Config(format!("{env} is required for {auth} auth")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides_config_file() {
        let config = BacklogConfig {
            instance_url: Some("https://file.example.com".to_string()),
            username: Some("file-user".to_string()),
            ..BacklogConfig::default()
        };
        let settings = Settings::resolve(
            &config,
            env(&[(INSTANCE_URL_ENV, "https://env.example.com")]),
        )
        .unwrap();

        assert_eq!(settings.instance_url.as_deref(), Some("https://env.example.com"));
        assert_eq!(settings.username.as_deref(), Some("file-user"));
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::resolve(&BacklogConfig::default(), env(&[])).unwrap();

        assert_eq!(settings.auth, AuthMethod::Basic);
        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.match_policy, MatchPolicy::Exact);
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_auth_inferred_from_credentials() {
        let token = Settings::resolve(&BacklogConfig::default(), env(&[(TOKEN_ENV, "t")])).unwrap();
        assert_eq!(token.auth, AuthMethod::Token);

        let client = Settings::resolve(
            &BacklogConfig::default(),
            env(&[(CLIENT_ID_ENV, "id"), (CLIENT_SECRET_ENV, "secret")]),
        )
        .unwrap();
        assert_eq!(client.auth, AuthMethod::OauthClient);

        let password = Settings::resolve(
            &BacklogConfig::default(),
            env(&[(CLIENT_ID_ENV, "id"), (USERNAME_ENV, "svc")]),
        )
        .unwrap();
        assert_eq!(password.auth, AuthMethod::Oauth);
    }

    #[test]
    fn test_explicit_auth_method() {
        let settings = Settings::resolve(
            &BacklogConfig::default(),
            env(&[(AUTH_ENV, "client_credentials"), (TOKEN_ENV, "t")]),
        )
        .unwrap();
        assert_eq!(settings.auth, AuthMethod::OauthClient);

        let err = Settings::resolve(&BacklogConfig::default(), env(&[(AUTH_ENV, "kerberos")]));
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_credentials_are_named() {
        let settings = Settings::resolve(
            &BacklogConfig::default(),
            env(&[(USERNAME_ENV, "admin")]),
        )
        .unwrap();

        let err = settings.auth_provider().unwrap_err();
        assert!(err.to_string().contains(PASSWORD_ENV));
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn test_client_config_requires_instance() {
        let settings = Settings::resolve(&BacklogConfig::default(), env(&[])).unwrap();
        assert!(settings.client_config().is_err());

        let settings = Settings::resolve(
            &BacklogConfig {
                max_attempts: Some(5),
                page_size: Some(50),
                ..BacklogConfig::default()
            },
            env(&[(INSTANCE_URL_ENV, "https://x.example.com")]),
        )
        .unwrap();
        let client = settings.client_config().unwrap();
        assert_eq!(client.retry.max_attempts, 5);
        assert_eq!(client.page_size, 50);
    }

    #[test]
    fn test_load_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"instance_url": "https://dev.example.com", "auth": "oauth_client",
                "match_policy": "case-insensitive", "concurrency": 4}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.auth, Some(AuthMethod::OauthClient));
        assert_eq!(config.match_policy, Some(MatchPolicy::CaseInsensitive));
        assert_eq!(config.concurrency, Some(4));
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let err = load_config(Some(Path::new("/nonexistent/config.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_config_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(load_config(Some(&path)), Err(Error::Config(_))));
    }
}
