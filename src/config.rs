use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level for this crate and the HTTP layers, used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Name this instance announces itself with
    #[serde(default = "default_service_name")]
    pub cloud_service_name: String,

    /// JWT secret key shared with the identity provider
    pub cloud_auth_jwt_secret: Option<String>,

    /// Clock skew tolerated when checking `exp`
    #[serde(default = "default_jwt_leeway_secs")]
    pub jwt_leeway_secs: u64,

    /// Sqlite URL for the record store. Without it rooms live in memory only.
    pub db_url: Option<String>,

    /// How long a room without connections stays loaded
    #[serde(default = "default_room_idle_secs")]
    pub room_idle_secs: u64,

    /// Attempts per failed persistence write before it is given up
    #[serde(default = "default_persist_retry_limit")]
    pub persist_retry_limit: u32,

    /// First retry delay for a failed persistence write
    #[serde(default = "default_persist_retry_base_ms")]
    pub persist_retry_base_ms: u64,

    /// How long a room access decision is cached
    #[serde(default = "default_access_cache_secs")]
    pub access_cache_secs: u64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Tracing is not up yet, the caller reports the outcome.
        Ok(envy::from_env::<Config>()?)
    }

    /// Tracing filter used when RUST_LOG is not set.
    pub fn log_filter(&self) -> String {
        format!(
            "colabri_board={level},tower_http={level},axum::rejection=trace,info",
            level = self.log_level
        )
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    pub fn room_idle(&self) -> Duration {
        Duration::from_secs(self.room_idle_secs)
    }

    pub fn persist_retry_base(&self) -> Duration {
        Duration::from_millis(self.persist_retry_base_ms)
    }

    pub fn access_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.access_cache_secs)
    }

    /// Parsed CORS origins. Empty allows any origin in development only.
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            cloud_service_name: default_service_name(),
            cloud_auth_jwt_secret: None,
            jwt_leeway_secs: default_jwt_leeway_secs(),
            db_url: None,
            room_idle_secs: default_room_idle_secs(),
            persist_retry_limit: default_persist_retry_limit(),
            persist_retry_base_ms: default_persist_retry_base_ms(),
            access_cache_secs: default_access_cache_secs(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    EnvError(#[from] envy::Error),
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "debug".to_string()
}

fn default_service_name() -> String {
    "colabri-board".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_jwt_leeway_secs() -> u64 {
    30
}

fn default_room_idle_secs() -> u64 {
    60
}

fn default_persist_retry_limit() -> u32 {
    3
}

fn default_persist_retry_base_ms() -> u64 {
    100
}

fn default_access_cache_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_origins_are_split_and_trimmed() {
        let config = Config {
            cors_origins: Some("https://a.example, https://b.example,".to_string()),
            ..Config::default()
        };
        assert_eq!(config.cors_origin_list(), vec!["https://a.example", "https://b.example"]);
        assert!(Config::default().cors_origin_list().is_empty());
    }

    #[test]
    fn envy_fills_defaults() {
        let vars = vec![
            ("PORT".to_string(), "4100".to_string()),
            ("ROOM_IDLE_SECS".to_string(), "5".to_string()),
        ];
        let config: Config = envy::from_iter(vars).unwrap();
        assert_eq!(config.port, 4100);
        assert_eq!(config.room_idle(), Duration::from_secs(5));
        assert_eq!(config.persist_retry_limit, 3);
        assert!(config.db_url.is_none());
    }

    #[test]
    fn log_level_feeds_the_default_filter() {
        let config = Config {
            log_level: "warn".to_string(),
            ..Config::default()
        };
        assert_eq!(config.log_filter(), "colabri_board=warn,tower_http=warn,axum::rejection=trace,info");
        assert!(Config::default().log_filter().starts_with("colabri_board=debug,"));
    }

    #[test]
    fn environment_names_for_development() {
        assert!(Config::default().is_development());
        let prod = Config {
            environment: "prod".to_string(),
            ..Config::default()
        };
        assert!(!prod.is_development());
    }
}
