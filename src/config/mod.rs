//! Configuration management

use crate::codec::normalize_key;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Tunnel listen address
    pub listen: String,
    /// Shared secret key (1-32 bytes)
    pub secret_key: String,
    /// Default downstream pool address for LOGINs that name none
    pub pool_address: String,
    /// Randomize traffic (interleave payloads, emit filler frames)
    #[serde(default = "default_obfuscate")]
    pub obfuscate: bool,
    /// Seconds between reconciliation pings
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Seconds a closed circuit may reconnect before being reported offline
    #[serde(default = "default_offline_grace")]
    pub offline_grace_secs: u64,
    /// Seconds an accepted tunnel may sit without sending INIT
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9999".to_string(),
            secret_key: String::new(),
            pool_address: String::new(),
            obfuscate: true,
            ping_interval_secs: default_ping_interval(),
            offline_grace_secs: default_offline_grace(),
            init_timeout_secs: default_init_timeout(),
        }
    }
}

impl ServerConfig {
    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<(), crate::Error> {
        normalize_key(&self.secret_key)
            .map_err(|e| crate::Error::Config(format!("Invalid secret_key: {}", e)))?;
        if self.listen.is_empty() {
            return Err(crate::Error::Config("listen address is required".into()));
        }
        if self.pool_address.is_empty() {
            return Err(crate::Error::Config(
                "pool_address (default downstream pool) is required".into(),
            ));
        }
        Ok(())
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local listen address for miner connections
    pub listen: String,
    /// Server tunnel endpoint
    pub remote: String,
    /// Shared secret key (must match the server)
    pub secret_key: String,
    /// Randomize traffic (must match the server)
    #[serde(default = "default_obfuscate")]
    pub obfuscate: bool,
    /// Target tunnel pool size
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
    /// Per-client pool override; empty uses the server default
    #[serde(default)]
    pub pool_address: String,
    /// Stable client instance id; generated when empty
    #[serde(default)]
    pub client_id: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:18888".to_string(),
            remote: "127.0.0.1:9999".to_string(),
            secret_key: String::new(),
            obfuscate: true,
            max_conn: default_max_conn(),
            pool_address: String::new(),
            client_id: String::new(),
        }
    }
}

impl ClientConfig {
    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<(), crate::Error> {
        normalize_key(&self.secret_key)
            .map_err(|e| crate::Error::Config(format!("Invalid secret_key: {}", e)))?;
        if self.listen.is_empty() {
            return Err(crate::Error::Config("listen address is required".into()));
        }
        if self.remote.is_empty() {
            return Err(crate::Error::Config("remote address is required".into()));
        }
        if self.max_conn == 0 {
            return Err(crate::Error::Config("max_conn must be at least 1".into()));
        }
        Ok(())
    }

    /// Configured client id, or a fresh random one
    pub fn effective_client_id(&self) -> String {
        if self.client_id.is_empty() {
            format!("{:016x}", rand::random::<u64>())
        } else {
            self.client_id.clone()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

fn default_obfuscate() -> bool {
    true
}

fn default_max_conn() -> usize {
    5
}

fn default_ping_interval() -> u64 {
    30
}

fn default_offline_grace() -> u64 {
    60
}

fn default_init_timeout() -> u64 {
    10
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_toml() {
        let config = generate_example_config();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert!(parsed.server.is_some());
        assert!(parsed.client.is_some());
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn test_client_defaults_fill_in() {
        let parsed: Config = toml::from_str(
            r#"
            [client]
            listen = "0.0.0.0:18888"
            remote = "1.2.3.4:9999"
            secret_key = "hunter2"
            "#,
        )
        .unwrap();
        let client = parsed.client.unwrap();
        assert!(client.obfuscate);
        assert_eq!(client.max_conn, 5);
        assert!(client.validate().is_ok());
    }

    #[test]
    fn test_empty_secret_key_rejected() {
        let client = ClientConfig {
            secret_key: String::new(),
            ..ClientConfig::default()
        };
        assert!(client.validate().is_err());

        let server = ServerConfig {
            secret_key: String::new(),
            pool_address: "pool:3333".to_string(),
            ..ServerConfig::default()
        };
        assert!(server.validate().is_err());
    }

    #[test]
    fn test_server_requires_pool_address() {
        let server = ServerConfig {
            secret_key: "hunter2".to_string(),
            pool_address: String::new(),
            ..ServerConfig::default()
        };
        assert!(server.validate().is_err());
    }

    #[test]
    fn test_effective_client_id() {
        let mut client = ClientConfig::default();
        assert_eq!(client.effective_client_id().len(), 16);
        client.client_id = "rig-7".to_string();
        assert_eq!(client.effective_client_id(), "rig-7");
    }
}
