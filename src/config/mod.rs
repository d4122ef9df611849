/// Configuration management for the Pulseboard engine
///
/// Handles server configuration, database location, and execution limits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Script execution limits
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

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding pulseboard.db (default: "data")
    pub data_dir: String,
}

/// Execution engine limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrent script interpreters
    pub worker_pool_size: usize,
    /// Floor applied to every widget timeout
    pub min_timeout_secs: u64,
    /// Outcome processing attempts before an immediate reschedule
    pub max_process_attempts: u32,
    /// Interpreter memory cap in bytes, unlimited when absent
    pub script_memory_limit: Option<usize>,
    /// Timeout of a single script HTTP call
    pub http_timeout_secs: u64,
}

impl EngineConfig {
    pub fn min_timeout(&self) -> Duration {
        Duration::from_secs(self.min_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: env_or("PULSEBOARD_WORKER_POOL_SIZE", 10),
            min_timeout_secs: env_or("PULSEBOARD_MIN_TIMEOUT_SECS", 60),
            max_process_attempts: env_or("PULSEBOARD_MAX_PROCESS_ATTEMPTS", 10),
            script_memory_limit: std::env::var("PULSEBOARD_SCRIPT_MEMORY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok()),
            http_timeout_secs: env_or("PULSEBOARD_HTTP_TIMEOUT_SECS", 30),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("PULSEBOARD_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("PULSEBOARD_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("PULSEBOARD_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            engine: EngineConfig::default(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}
