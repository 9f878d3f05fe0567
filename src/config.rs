//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub federation: FederationConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub http: HttpClientConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Federation and signature verification policy
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Maximum distance between the signed `Date` and now (default: 12h)
    pub signature_window_seconds: u64,
    /// Domains whose keys are never resolved
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    /// Limited federation mode: when set, only these domains may federate
    #[serde(default)]
    pub allowed_domains: Option<Vec<String>>,
    /// Permit key fetches to loopback/private addresses (tests, closed networks)
    #[serde(default)]
    pub allow_private_networks: bool,
    /// Cached actors older than this are flagged possibly stale (default: 24h)
    pub actor_stale_after_seconds: u64,
    /// Cached actors older than this are pruned (default: 7 days)
    pub actor_cache_ttl_seconds: u64,
    /// Key id used to sign outbound key fetches (authorized fetch)
    pub instance_key_id: Option<String>,
    /// PKCS#8 PEM private key matching `instance_key_id`
    pub instance_private_key_path: Option<PathBuf>,
}

impl FederationConfig {
    pub fn signature_window(&self) -> Duration {
        Duration::from_secs(self.signature_window_seconds)
    }

    pub fn actor_stale_after(&self) -> Duration {
        Duration::from_secs(self.actor_stale_after_seconds)
    }

    pub fn actor_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.actor_cache_ttl_seconds)
    }
}

/// Circuit breaker guarding outbound calls made during verification
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within the window before the circuit opens (default: 1)
    pub failure_threshold: u32,
    /// Time an open circuit waits before letting a probe through (default: 300)
    pub cool_off_seconds: u64,
    /// Window in which failures are counted (default: 300)
    pub failure_window_seconds: u64,
    /// Upper bound for a single wrapped call (default: 10)
    pub call_timeout_seconds: u64,
    /// Maximum number of breaker names tracked in memory
    pub max_tracked_keys: usize,
}

/// Outbound HTTP client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpClientConfig {
    pub user_agent: String,
    /// Request timeout in seconds (default: 10)
    pub timeout_seconds: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl LoggingConfig {
    /// Whether log lines are emitted as JSON
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }

    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub fn filter_directive(&self) -> String {
        let level = self.level.to_ascii_lowercase();
        format!("keygate={level},tower_http={level}")
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (KEYGATE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("federation.signature_window_seconds", 43_200)?
            .set_default("federation.allow_private_networks", false)?
            .set_default("federation.actor_stale_after_seconds", 86_400)?
            .set_default("federation.actor_cache_ttl_seconds", 604_800)?
            .set_default("circuit_breaker.failure_threshold", 1)?
            .set_default("circuit_breaker.cool_off_seconds", 300)?
            .set_default("circuit_breaker.failure_window_seconds", 300)?
            .set_default("circuit_breaker.call_timeout_seconds", 10)?
            .set_default("circuit_breaker.max_tracked_keys", 10_000)?
            .set_default("http.user_agent", concat!("Keygate/", env!("CARGO_PKG_VERSION")))?
            .set_default("http.timeout_seconds", 10)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("KEYGATE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("federation.blocked_domains")
                    .with_list_parse_key("federation.allowed_domains")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(AppError::Config(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.circuit_breaker.call_timeout_seconds == 0 || self.http.timeout_seconds == 0 {
            return Err(AppError::Config(
                "outbound call timeouts must be greater than 0".to_string(),
            ));
        }

        if self.federation.signature_window_seconds == 0 {
            return Err(AppError::Config(
                "federation.signature_window_seconds must be greater than 0".to_string(),
            ));
        }

        if self.federation.instance_key_id.is_some()
            != self.federation.instance_private_key_path.is_some()
        {
            return Err(AppError::Config(
                "federation.instance_key_id and federation.instance_private_key_path must be set together"
                    .to_string(),
            ));
        }

        if !is_local_server_domain(&self.server.domain)
            && !self.server.protocol.eq_ignore_ascii_case("https")
        {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if !matches!(
            self.logging.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(AppError::Config(format!(
                "logging.level must be one of trace, debug, info, warn, error (got {})",
                self.logging.level
            )));
        }

        if !matches!(
            self.logging.format.to_ascii_lowercase().as_str(),
            "pretty" | "json"
        ) {
            return Err(AppError::Config(format!(
                "logging.format must be pretty or json (got {})",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Log the loaded configuration and any risky settings.
    ///
    /// Called once tracing is initialized.
    pub fn log_summary(&self) {
        tracing::info!(
            domain = %self.server.domain,
            protocol = %self.server.protocol,
            blocked_domains = self.federation.blocked_domains.len(),
            "Configuration loaded"
        );

        if is_local_server_domain(&self.server.domain) {
            tracing::warn!(
                host = %normalized_server_host(&self.server.domain),
                protocol = %self.server.protocol,
                "Running with a local server domain"
            );
        }

        if self.federation.allow_private_networks {
            tracing::warn!("Key fetches to private network addresses are allowed");
        }
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
