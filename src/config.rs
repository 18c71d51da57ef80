//! TOML configuration bundle for the daemon.
//!
//! Every field has a default, so an absent file (or an empty one) yields a
//! working development configuration. External collaborators (web app,
//! admin tooling) read the same file; only the `[auth]` and `[database]`
//! sections are consumed here.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

fn default_port() -> u16 {
    16666
}

fn default_workers() -> usize {
    1
}

fn default_session_ttl() -> u64 {
    30
}

fn default_database_uri() -> String {
    "warden.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// UDP listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Runtime worker threads serving datagrams.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Seconds an SRP session may sit idle before it expires.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Credential store DSN; a filesystem path for the SQLite backend.
    #[serde(default = "default_database_uri")]
    pub uri: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth: AuthConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            workers: default_workers(),
            session_ttl_seconds: default_session_ttl(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            uri: default_database_uri(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file is not an error;
    /// it yields the defaults so `warden` can run out of the box.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        if !path.is_file() {
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config at {}", path.display()))
    }

    /// Session TTL as a [`Duration`].
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.session_ttl_seconds)
    }
}
