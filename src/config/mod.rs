/// Configuration management for the fieldflow engine
///
/// Handles server binding, database location, ingest authentication, and
/// the execution budgets of the node executors.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Ingest authentication
    pub auth: AuthConfig,
    /// Execution budgets
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// SQLite database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database URL (default: "sqlite://fieldflow.db?mode=rwc")
    pub url: String,
}

/// Ingest authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared key expected in the X-API-Key header of ingest requests
    pub api_key: String,
}

/// Execution budgets for node executors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Wall-clock budget per script execution, in milliseconds
    pub script_timeout_ms: u64,
    /// Bounded wait for an HTTP integration round trip, in seconds
    pub http_timeout_secs: u64,
    /// Bounded wait per MQTT stage (connect, publish ack), in seconds
    pub mqtt_timeout_secs: u64,
}

impl EngineConfig {
    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn mqtt_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt_timeout_secs)
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("FIELDFLOW_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("FIELDFLOW_PORT")
                    .unwrap_or_else(|_| "8199".to_string())
                    .parse()
                    .unwrap_or(8199),
            },
            database: DatabaseConfig {
                url: std::env::var("FIELDFLOW_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://fieldflow.db?mode=rwc".to_string()),
            },
            auth: AuthConfig {
                api_key: std::env::var("FIELDFLOW_API_KEY").unwrap_or_default(),
            },
            engine: EngineConfig {
                script_timeout_ms: std::env::var("FIELDFLOW_SCRIPT_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5000),
                http_timeout_secs: std::env::var("FIELDFLOW_HTTP_TIMEOUT_S")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
                mqtt_timeout_secs: std::env::var("FIELDFLOW_MQTT_TIMEOUT_S")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            },
        }
    }
}
