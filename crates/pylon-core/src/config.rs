use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Wire protocol limits — shared by server and client.
pub const MAX_CHANNEL_LEN: usize = 100;
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024; // 128 KB hard cap per frame
pub const DEFAULT_PORT: u16 = 15100;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const LIVENESS_CHECK_SECS: u64 = 30; // reap-check cadence per connection

/// Top-level config (pylon.toml + PYLON_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PylonConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Pre-shared token for the sender role. When unset, the sender
    /// endpoint rejects every handshake.
    pub backend_auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Replay buffer capacity — oldest messages are evicted past this.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    /// Global cap across both transports. Connections past the cap get a
    /// `server-capacity` error and are never counted.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,
    /// How long a long-poll request is held open before a 504.
    #[serde(default = "default_comet_timeout")]
    pub comet_timeout_secs: u64,
    /// Idle connections past this are reaped.
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            backend_auth_token: None,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_queue: default_max_queue(),
            max_connections: default_max_connections(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            comet_timeout_secs: default_comet_timeout(),
            liveness_timeout_secs: default_liveness_timeout(),
        }
    }
}

impl Default for PylonConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_max_queue() -> usize {
    50
}
fn default_max_connections() -> usize {
    1000
}
fn default_max_subscriptions() -> usize {
    10
}
fn default_comet_timeout() -> u64 {
    60
}
fn default_liveness_timeout() -> u64 {
    300
}

impl PylonConfig {
    /// Load config from a TOML file with PYLON_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. PYLON_CONFIG env var
    ///   3. ./pylon.toml
    ///
    /// Env keys nest on a double underscore, so snake_case field names stay
    /// addressable: `PYLON_BROKER__MAX_QUEUE=100` sets `broker.max_queue`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("PYLON_CONFIG").ok())
            .unwrap_or_else(|| "pylon.toml".to_string());

        let config: PylonConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("PYLON_").split("__"))
            .extract()
            .map_err(|e| crate::error::PylonError::Config(e.to_string()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PylonConfig::default();
        assert_eq!(config.broker.max_queue, 50);
        assert_eq!(config.broker.max_subscriptions_per_connection, 10);
        assert_eq!(config.broker.comet_timeout_secs, 60);
        assert_eq!(config.gateway.port, DEFAULT_PORT);
        assert!(config.gateway.backend_auth_token.is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: PylonConfig = Figment::new()
            .merge(figment::providers::Toml::string(
                r#"
                [gateway]
                port = 9000
                backend_auth_token = "s3cret"

                [broker]
                max_queue = 3
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.backend_auth_token.as_deref(), Some("s3cret"));
        assert_eq!(config.broker.max_queue, 3);
        assert_eq!(config.broker.max_connections, 1000);
    }

    #[test]
    fn env_overrides_reach_snake_case_keys() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("PYLON_BROKER__MAX_QUEUE", "7");
            jail.set_env("PYLON_GATEWAY__BACKEND_AUTH_TOKEN", "tok");
            let config = PylonConfig::load(None).expect("load");
            assert_eq!(config.broker.max_queue, 7);
            assert_eq!(config.gateway.backend_auth_token.as_deref(), Some("tok"));
            Ok(())
        });
    }
}
