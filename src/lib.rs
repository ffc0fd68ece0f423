//! Rounds core library
//!
//! This module exports the clinical queue and real-time synchronization
//! core of the Rounds platform: atomic consultation-state transitions,
//! per-client entity mirrors fed by a change-event stream, and the
//! critical lab-result alert engine.

pub mod alerts;
pub mod api;
pub mod consult;
pub mod error;
pub mod models;
pub mod store;
pub mod sync;
pub mod websocket;

/// Application configuration
pub mod config {
    use serde::Deserialize;

    #[derive(Debug, Clone, Deserialize)]
    pub struct Config {
        pub server: ServerConfig,
        pub database: DatabaseConfig,
        #[serde(default)]
        pub websocket: WebSocketConfig,
        #[serde(default)]
        pub sync: SyncSettings,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ServerConfig {
        pub host: String,
        pub port: u16,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct DatabaseConfig {
        /// "memory" or "sqlite"
        pub backend: String,
        pub url: String,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct WebSocketConfig {
        pub ping_interval_secs: u64,
        pub client_timeout_secs: u64,
    }

    impl Default for WebSocketConfig {
        fn default() -> Self {
            Self {
                ping_interval_secs: 5,
                client_timeout_secs: 20,
            }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct SyncSettings {
        pub feed_capacity: usize,
        pub reconcile_retries: u32,
        pub backoff_base_ms: u64,
        pub backoff_max_ms: u64,
        /// Heartbeat watchdog for remote feeds; unset for the in-process feed.
        pub idle_timeout_secs: Option<u64>,
    }

    impl Default for SyncSettings {
        fn default() -> Self {
            Self {
                feed_capacity: 256,
                reconcile_retries: 5,
                backoff_base_ms: 200,
                backoff_max_ms: 10_000,
                idle_timeout_secs: None,
            }
        }
    }

    /// Load configuration from file
    pub fn load_config() -> Result<Config, config::ConfigError> {
        // Layering: defaults file, then environment-specific file,
        // then ROUNDS_* environment variables.
        let env = std::env::var("ROUNDS_ENV").unwrap_or_else(|_| "development".into());

        config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("ROUNDS").separator("__"))
            .build()?
            .try_deserialize()
    }
}
