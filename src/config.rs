//! Configuration loading and platform paths.
//!
//! The configuration is a TOML file, by default at
//! `~/.config/encore/config.toml`, listing the scrobble services in the
//! order they should be attempted. API credentials may be set once at the
//! top level and overridden per service; the session key is filled in by
//! `encore auth`. The scrobble store defaults to
//! `~/.local/share/encore/scrobbles.db`.
//!
//! ```toml
//! api_key = "…"
//! shared_secret = "…"
//!
//! [[services]]
//! name = "lastfm"
//! api_url = "https://ws.audioscrobbler.com/2.0/"
//! auth_url = "https://www.last.fm/api/auth/"
//!
//! [[services]]
//! name = "librefm"
//! api_url = "https://libre.fm/2.0/"
//! auth_url = "https://libre.fm/api/auth/"
//! now_playing = false
//! ```

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Scrobble store location; platform default when unset.
    pub db_path: Option<PathBuf>,
    /// Credentials shared by every service that does not override them.
    pub api_key: Option<String>,
    pub shared_secret: Option<String>,
    /// Whether to send "now playing" notifications; per-service overridable.
    #[serde(default = "default_true")]
    pub now_playing: bool,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub api_url: String,
    /// Where the user grants access during `encore auth`.
    pub auth_url: Option<String>,
    pub api_key: Option<String>,
    pub shared_secret: Option<String>,
    /// Written back by `encore auth`.
    pub session_key: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub now_playing: Option<bool>,
}

/// One enabled service with every fallback applied, ready to build a client.
#[derive(Debug, Clone)]
pub struct ResolvedService {
    pub name: String,
    pub api_url: String,
    pub auth_url: Option<String>,
    pub api_key: String,
    pub shared_secret: String,
    pub session_key: Option<String>,
    pub now_playing: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration at {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid configuration at {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).context("configuration is not valid TOML")?;
        Ok(config)
    }

    /// Enabled services with global credential fallbacks applied, in file
    /// order. A service left without credentials is a configuration error.
    pub fn resolve_services(&self) -> Result<Vec<ResolvedService>> {
        let mut resolved = Vec::new();
        for service in self.services.iter().filter(|s| s.enabled) {
            let api_key = service
                .api_key
                .as_deref()
                .or(self.api_key.as_deref())
                .ok_or_else(|| anyhow!("service {} has no api_key (set it on the service or at the top level)", service.name))?;
            let shared_secret = service
                .shared_secret
                .as_deref()
                .or(self.shared_secret.as_deref())
                .ok_or_else(|| anyhow!("service {} has no shared_secret (set it on the service or at the top level)", service.name))?;
            resolved.push(ResolvedService {
                name: service.name.clone(),
                api_url: service.api_url.clone(),
                auth_url: service.auth_url.clone(),
                api_key: api_key.to_string(),
                shared_secret: shared_secret.to_string(),
                session_key: service.session_key.clone(),
                now_playing: service.now_playing.unwrap_or(self.now_playing),
            });
        }
        Ok(resolved)
    }

    /// Effective store path: CLI override, then config, then platform default.
    pub fn store_path(&self, cli_override: Option<PathBuf>) -> Result<PathBuf> {
        match cli_override.or_else(|| self.db_path.clone()) {
            Some(path) => Ok(path),
            None => default_db_path(),
        }
    }
}

/// `~/.config/encore/config.toml` (or the platform equivalent).
pub fn default_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("cannot determine the system configuration directory"))?;
    Ok(config_dir.join("encore").join("config.toml"))
}

/// `~/.local/share/encore/scrobbles.db` (or the platform equivalent),
/// creating the directory if needed.
pub fn default_db_path() -> Result<PathBuf> {
    let data_dir =
        dirs::data_dir().ok_or_else(|| anyhow!("cannot determine the system data directory"))?;
    let encore_dir = data_dir.join("encore");
    fs::create_dir_all(&encore_dir)
        .with_context(|| format!("cannot create data directory at {}", encore_dir.display()))?;
    Ok(encore_dir.join("scrobbles.db"))
}
