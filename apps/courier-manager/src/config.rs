use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Window a lease stays valid after its last heartbeat.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    /// Cadence advertised to agents; must stay under half of `lease_ttl_ms`.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_expiry_sweep_interval_ms")]
    pub expiry_sweep_interval_ms: u64,
    #[serde(default = "default_pairing_code_ttl_ms")]
    pub pairing_code_ttl_ms: u64,
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_max_message_attempts")]
    pub max_message_attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("heartbeat interval {heartbeat_ms}ms must be below half the lease ttl {ttl_ms}ms")]
    HeartbeatTooSlow { heartbeat_ms: u64, ttl_ms: u64 },
    #[error("max_message_attempts must be at least 1")]
    NoAttempts,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: None,
            log_filter: default_log_filter(),
            lease_ttl_ms: default_lease_ttl_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            expiry_sweep_interval_ms: default_expiry_sweep_interval_ms(),
            pairing_code_ttl_ms: default_pairing_code_ttl_ms(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            max_message_attempts: default_max_message_attempts(),
        }
    }
}

impl AppConfig {
    /// Reads `COURIER_*` environment variables (after loading `.env` if present).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<AppConfig>())
            .map(AppConfig::normalize)
            .unwrap_or_else(|_| AppConfig::default().normalize())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms.saturating_mul(2) >= self.lease_ttl_ms {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat_ms: self.heartbeat_interval_ms,
                ttl_ms: self.lease_ttl_ms,
            });
        }
        if self.max_message_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        Ok(())
    }

    fn normalize(mut self) -> Self {
        self.database_url = Self::normalize_opt(self.database_url.take());
        if self.log_filter.trim().is_empty() {
            self.log_filter = default_log_filter();
        }
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_filter() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info,courier_manager=debug".into())
}

fn default_lease_ttl_ms() -> u64 {
    90_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_expiry_sweep_interval_ms() -> u64 {
    5_000
}

fn default_pairing_code_ttl_ms() -> u64 {
    10 * 60 * 1000
}

fn default_dispatch_interval_ms() -> u64 {
    2_000
}

fn default_max_message_attempts() -> u32 {
    3
}
