//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Secrets never live in the TOML: the long-lived refresh cookie comes from
//! GEOMARK_REFRESH_COOKIE or `refresh_cookie_file`, and an initial access
//! token from a login surface may be passed in GEOMARK_ACCESS_TOKEN.

use common::Secret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Backend connection settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
}

/// Session credential sources
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Path to a file holding the refresh cookie value (alternative to
    /// GEOMARK_REFRESH_COOKIE)
    #[serde(default)]
    pub refresh_cookie_file: Option<PathBuf>,
    #[serde(skip)]
    pub refresh_cookie: Option<Secret<String>>,
    #[serde(skip)]
    pub access_token: Option<Secret<String>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            refresh_cookie_file: None,
            refresh_cookie: None,
            access_token: None,
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_refresh_timeout() -> u64 {
    10
}

fn default_cookie_name() -> String {
    session::DEFAULT_REFRESH_COOKIE.to_string()
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Refresh cookie resolution order:
    /// 1. GEOMARK_REFRESH_COOKIE env var
    /// 2. refresh_cookie_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.api.base_url.starts_with("http://") && !config.api.base_url.starts_with("https://")
        {
            return Err(common::Error::invalid(
                "api.base_url",
                format!(
                    "must start with http:// or https://, got: {}",
                    config.api.base_url
                ),
            ));
        }

        if config.api.timeout_secs == 0 {
            return Err(common::Error::invalid(
                "api.timeout_secs",
                "must be greater than 0",
            ));
        }

        if config.api.refresh_timeout_secs == 0 {
            return Err(common::Error::invalid(
                "api.refresh_timeout_secs",
                "must be greater than 0",
            ));
        }

        if config.session.cookie_name.trim().is_empty() {
            return Err(common::Error::invalid(
                "session.cookie_name",
                "must not be empty",
            ));
        }

        if let Some(cookie) = non_empty_env("GEOMARK_REFRESH_COOKIE") {
            config.session.refresh_cookie = Some(Secret::new(cookie));
        } else if let Some(ref cookie_file) = config.session.refresh_cookie_file {
            let cookie = std::fs::read_to_string(cookie_file).map_err(|source| {
                common::Error::SecretFile {
                    path: cookie_file.clone(),
                    source,
                }
            })?;
            let cookie = cookie.trim().to_owned();
            if !cookie.is_empty() {
                config.session.refresh_cookie = Some(Secret::new(cookie));
            }
        }

        config.session.access_token = non_empty_env("GEOMARK_ACCESS_TOKEN").map(Secret::new);

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("geomark.toml")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
