//! Server configuration.
//!
//! Precedence, lowest to highest: built-in defaults, the optional TOML
//! config file, recognised environment variables, CLI flags. The env layer
//! is the deployment surface (`CONCORD_*`, `POSTGRES_*`, `REDIS_*`,
//! `LOG_LEVEL`, `TRANSLATION_API_*`); the file is for everything else.
//! Environment lookup happens in [`Config::apply_env`] rather than through
//! clap `env` attributes — clap resolves env before defaults, which would
//! put file-sourced values above the environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

fn default_env() -> String {
    "development".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_server_host() -> String {
    "127.0.0.1:8080".into()
}
fn default_jwt_secret() -> String {
    // Development only; deployments set CONCORD_JWT_SECRET.
    "concord-dev-secret-0123456789abcdef".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_presence_ttl() -> u64 {
    120
}
fn default_cache_capacity() -> usize {
    1024
}
fn default_shutdown_timeout() -> u64 {
    10
}
fn default_msg_rate() -> u32 {
    10
}
fn default_file_rate() -> u32 {
    5
}
fn default_api_rate() -> u32 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub env: String,
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/concord.db` when unset.
    pub db_path: Option<PathBuf>,
    pub server_host: String,
    pub jwt_secret: String,
    pub log_level: String,

    /// Presence entries expire after this many seconds.
    pub presence_ttl_secs: u64,
    pub cache_capacity: usize,
    /// How long graceful shutdown waits for in-flight requests.
    pub shutdown_timeout_secs: u64,

    /// If restore-session should rotate the stored refresh token. Kept off
    /// until an audit asks for rotation.
    pub rotate_refresh_on_restore: bool,

    pub rate_limits: RateLimits,
    pub oauth: OAuthConfig,
    pub translation: TranslationConfig,
    pub p2p: P2pConfig,
    pub postgres: PostgresConfig,
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub messages_per_sec: u32,
    pub files_per_min: u32,
    pub api_per_min: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OAuthConfig {
    pub device_auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TranslationConfig {
    pub api_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct P2pConfig {
    pub enabled: bool,
    pub mdns: bool,
    pub dht: bool,
    pub bootstrap: Vec<String>,
}

/// Connection settings for a PostgreSQL deployment fronting this server.
/// Parsed from the environment for the external collaborator; the embedded
/// store is SQLite.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub password: String,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            messages_per_sec: default_msg_rate(),
            files_per_min: default_file_rate(),
            api_per_min: default_api_rate(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: default_env(),
            data_dir: default_data_dir(),
            db_path: None,
            server_host: default_server_host(),
            jwt_secret: default_jwt_secret(),
            log_level: default_log_level(),
            presence_ttl_secs: default_presence_ttl(),
            cache_capacity: default_cache_capacity(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            rotate_refresh_on_restore: false,
            rate_limits: RateLimits::default(),
            oauth: OAuthConfig::default(),
            translation: TranslationConfig::default(),
            p2p: P2pConfig::default(),
            postgres: PostgresConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

/// Command-line surface. Flags override both the file and the environment.
#[derive(Debug, Parser)]
#[command(name = "concord-server", about = "Concord coordination server")]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Listen address, host:port.
    #[arg(long)]
    pub listen: Option<String>,
    /// SQLite database path.
    #[arg(long)]
    pub db_path: Option<PathBuf>,
    /// Run the P2P overlay host alongside the HTTP listener.
    #[arg(long)]
    pub p2p: bool,
    /// Enable mDNS discovery (implies --p2p).
    #[arg(long)]
    pub mdns: bool,
    /// Enable DHT rendezvous (implies --p2p).
    #[arg(long)]
    pub dht: bool,
}

impl Config {
    /// Load the file (if any), then fold in environment and CLI overrides.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());

        if let Some(listen) = &cli.listen {
            config.server_host = listen.clone();
        }
        if let Some(db_path) = &cli.db_path {
            config.db_path = Some(db_path.clone());
        }
        if cli.p2p || cli.mdns || cli.dht {
            config.p2p.enabled = true;
        }
        if cli.mdns {
            config.p2p.mdns = true;
        }
        if cli.dht {
            config.p2p.dht = true;
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Apply recognised environment variables. Takes the lookup as a
    /// closure so tests don't have to mutate the process environment.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("CONCORD_ENV") {
            self.env = v;
        }
        if let Some(v) = get("CONCORD_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("CONCORD_DB_PATH") {
            self.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CONCORD_SERVER_HOST") {
            self.server_host = v;
        }
        if let Some(v) = get("CONCORD_JWT_SECRET") {
            self.jwt_secret = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("TRANSLATION_API_URL") {
            self.translation.api_url = v;
        }
        if let Some(v) = get("TRANSLATION_API_KEY") {
            self.translation.api_key = v;
        }
        if let Some(v) = get("POSTGRES_HOST") {
            self.postgres.host = v;
        }
        if let Some(v) = get("POSTGRES_PASSWORD") {
            self.postgres.password = v;
        }
        if let Some(v) = get("REDIS_HOST") {
            self.redis.host = v;
        }
        if let Some(v) = get("REDIS_PASSWORD") {
            self.redis.password = v;
        }
    }

    /// Resolved database path.
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("concord.db"))
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.server_host.parse()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.presence_ttl_secs, 120);
        assert_eq!(c.rate_limits.messages_per_sec, 10);
        assert_eq!(c.rate_limits.files_per_min, 5);
        assert_eq!(c.rate_limits.api_per_min, 60);
        assert!(c.jwt_secret.len() >= 32);
        assert_eq!(c.db_path(), PathBuf::from("./data/concord.db"));
    }

    #[test]
    fn file_parses_partial_toml() {
        let c: Config = toml::from_str(
            r#"
            server_host = "0.0.0.0:9000"
            [p2p]
            enabled = true
            mdns = true
            [rate_limits]
            api_per_min = 30
            "#,
        )
        .unwrap();
        assert_eq!(c.server_host, "0.0.0.0:9000");
        assert!(c.p2p.enabled && c.p2p.mdns && !c.p2p.dht);
        assert_eq!(c.rate_limits.api_per_min, 30);
        // Untouched sections keep their defaults.
        assert_eq!(c.rate_limits.messages_per_sec, 10);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut c: Config = toml::from_str(r#"server_host = "0.0.0.0:9000""#).unwrap();
        c.apply_env(|name| match name {
            "CONCORD_SERVER_HOST" => Some("127.0.0.1:7777".into()),
            "CONCORD_JWT_SECRET" => Some("s".repeat(48)),
            "REDIS_HOST" => Some("redis.internal".into()),
            _ => None,
        });
        assert_eq!(c.server_host, "127.0.0.1:7777");
        assert_eq!(c.jwt_secret, "s".repeat(48));
        assert_eq!(c.redis.host, "redis.internal");
    }

    #[test]
    fn listen_addr_parses() {
        let c = Config::default();
        assert!(c.listen_addr().is_ok());
    }
}
