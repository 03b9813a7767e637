//! Server configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working local server. Command line flags are applied on top after loading.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

fn default_name() -> String {
    "Gatehouse".to_string()
}

fn default_location() -> String {
    "Local".to_string()
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_login_port() -> u16 {
    7171
}

fn default_game_port() -> u16 {
    7172
}

fn default_max_players() -> u32 {
    500
}

fn default_max_packets_per_second() -> u32 {
    25
}

fn default_io_timeout() -> u64 {
    30
}

fn default_flush_interval() -> u64 {
    10
}

fn default_port_retry() -> u64 {
    5
}

fn default_login_tries() -> u32 {
    5
}

fn default_retry_timeout() -> u64 {
    5
}

fn default_login_timeout() -> u64 {
    60
}

fn default_status_timeout() -> u64 {
    5
}

fn default_token_lifetime() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    /// Accounts created at startup.
    #[serde(default)]
    pub accounts: Vec<AccountSeed>,
}

/// Identity and listening ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_location")]
    pub location: String,
    /// Instance id reported to operators.
    #[serde(default)]
    pub id: Option<String>,
    /// Address every service binds to.
    #[serde(default = "default_ip")]
    pub ip: String,
    /// Host name handed to clients after login. Falls back to `ip`.
    #[serde(default)]
    pub game_host: Option<String>,
    #[serde(default = "default_login_port")]
    pub login_port: u16,
    #[serde(default = "default_game_port")]
    pub game_port: u16,
    /// Defaults to the login port.
    #[serde(default)]
    pub admin_port: Option<u16>,
    /// Defaults to the login port.
    #[serde(default)]
    pub status_port: Option<u16>,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
}

/// Connection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Per-connection ceiling; `0` disables the check.
    #[serde(default = "default_max_packets_per_second")]
    pub max_packets_per_second: u32,
    #[serde(default = "default_io_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_io_timeout")]
    pub write_timeout_secs: u64,
    /// Delay between batched output flushes.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    /// Delay before retrying a port that failed to bind.
    #[serde(default = "default_port_retry")]
    pub port_retry_secs: u64,
}

/// Bans, throttling and the admin interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Failed logins tolerated within `login_timeout_secs`.
    #[serde(default = "default_login_tries")]
    pub login_tries: u32,
    /// A failed attempt older than this starts a fresh count.
    #[serde(default = "default_retry_timeout")]
    pub retry_timeout_secs: u64,
    /// How long an IP stays disabled after too many failed logins.
    #[serde(default = "default_login_timeout")]
    pub login_timeout_secs: u64,
    /// Minimum delay between two status queries from one IP.
    #[serde(default = "default_status_timeout")]
    pub status_query_timeout_secs: u64,
    /// Block addresses that open connections in fast bursts.
    #[serde(default = "default_true")]
    pub throttle_connections: bool,
    /// Lifetime of the session token issued at login.
    #[serde(default = "default_token_lifetime")]
    pub session_token_secs: u64,
    /// The admin protocol is disabled without a password.
    #[serde(default)]
    pub admin_password: Option<String>,
    #[serde(default = "default_true")]
    pub admin_local_only: bool,
}

/// An account and its characters, created at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSeed {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub characters: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            location: default_location(),
            id: None,
            ip: default_ip(),
            game_host: None,
            login_port: default_login_port(),
            game_port: default_game_port(),
            admin_port: None,
            status_port: None,
            max_players: default_max_players(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            max_packets_per_second: default_max_packets_per_second(),
            read_timeout_secs: default_io_timeout(),
            write_timeout_secs: default_io_timeout(),
            flush_interval_ms: default_flush_interval(),
            port_retry_secs: default_port_retry(),
        }
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            login_tries: default_login_tries(),
            retry_timeout_secs: default_retry_timeout(),
            login_timeout_secs: default_login_timeout(),
            status_query_timeout_secs: default_status_timeout(),
            throttle_connections: true,
            session_token_secs: default_token_lifetime(),
            admin_password: None,
            admin_local_only: true,
        }
    }
}

impl ServerConfig {
    /// Reads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_ip().is_none() {
            return Err(ConfigError::Invalid(format!(
                "invalid bind ip: {}",
                self.server.ip
            )));
        }
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::Invalid("server name cannot be empty".to_string()));
        }
        if self.network.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.network.read_timeout_secs == 0 || self.network.write_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "read and write timeouts must be greater than zero".to_string(),
            ));
        }
        if self.security.login_tries == 0 {
            return Err(ConfigError::Invalid(
                "login_tries must be greater than zero".to_string(),
            ));
        }
        for account in &self.accounts {
            if account.name.is_empty() || account.password.is_empty() {
                return Err(ConfigError::Invalid(
                    "seeded accounts need a name and a password".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn bind_ip(&self) -> Option<IpAddr> {
        self.server.ip.parse().ok()
    }

    pub fn admin_port(&self) -> u16 {
        self.server.admin_port.unwrap_or(self.server.login_port)
    }

    pub fn status_port(&self) -> u16 {
        self.server.status_port.unwrap_or(self.server.login_port)
    }

    /// Host name clients are told to connect to for the game service.
    pub fn game_host(&self) -> &str {
        self.server.game_host.as_deref().unwrap_or(&self.server.ip)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.network.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.network.write_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.network.flush_interval_ms)
    }

    pub fn port_retry_delay(&self) -> Duration {
        Duration::from_secs(self.network.port_retry_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.network.max_packets_per_second, 25);
        assert_eq!(config.read_timeout(), Duration::from_secs(30));
        assert_eq!(config.flush_interval(), Duration::from_millis(10));
        assert_eq!(config.port_retry_delay(), Duration::from_secs(5));
        assert_eq!(config.security.login_tries, 5);
        assert_eq!(config.admin_port(), config.server.login_port);
        assert_eq!(config.status_port(), config.server.login_port);
        assert_ne!(config.server.game_port, config.server.login_port);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
name = "Test"
game_port = 9000

[network]
max_packets_per_second = 0

[[accounts]]
name = "alice"
password = "secret"
characters = ["Alice"]
"#
        )
        .unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.server.name, "Test");
        assert_eq!(config.server.game_port, 9000);
        assert_eq!(config.server.login_port, 7171);
        assert_eq!(config.network.max_packets_per_second, 0);
        assert_eq!(config.network.flush_interval_ms, 10);
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.accounts[0].characters, vec!["Alice".to_string()]);
    }

    #[test]
    fn test_load_missing_file() {
        let result = ServerConfig::load(Path::new("/nonexistent/gatehouse.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[server\nname = ").unwrap();
        assert!(matches!(
            ServerConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.server.ip = "not an ip".to_string();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.network.flush_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.security.login_tries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_game_host_falls_back_to_ip() {
        let mut config = ServerConfig::default();
        assert_eq!(config.game_host(), "127.0.0.1");
        config.server.game_host = Some("play.example.org".to_string());
        assert_eq!(config.game_host(), "play.example.org");
    }
}
