//! Configuration module for the log shipper.
//!
//! A [`Config`] names one collector destination and the delivery settings
//! for it. It can be built in code with [`Config::new`] and the `with_*`
//! builders, or loaded from `LOGSTASH_SHIPPER_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

/// Default collector host
const DEFAULT_HOST: &str = "localhost";

/// Default collector port for the streaming transport
const DEFAULT_PORT: u16 = 5000;

/// Default connect, handshake and write timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Default timeout of one batch POST in seconds
const DEFAULT_POST_TIMEOUT_SECS: u64 = 5;

/// Default batch size (number of records appended before the binary flushes)
const DEFAULT_BATCH_SIZE: usize = 100;

/// Default flush interval in seconds
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;

/// Maximum allowed batch size
const MAX_BATCH_SIZE: usize = 10_000;

/// Bounds for every interval or timeout setting, in seconds
const MIN_SECS: u64 = 1;
const MAX_SECS: u64 = 300;

/// Where a coordinator delivers records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Newline-delimited JSON over a TLS-upgraded TCP connection.
    Stream { host: String, port: u16 },

    /// Batches posted to an HTTP(S) endpoint.
    Http(Url),
}

impl Destination {
    /// Select the strategy from the configured address.
    ///
    /// An absolute URL whose scheme starts with `http` selects HTTP; anything
    /// else is a bare host for the streaming transport.
    pub fn parse(host: &str, port: u16) -> Result<Self, ConfigError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(ConfigError::Destination("host must not be empty".to_string()));
        }

        match Url::parse(host) {
            Ok(url) if url.scheme().starts_with("http") => Ok(Destination::Http(url)),
            _ => {
                if port == 0 {
                    return Err(ConfigError::Destination(format!(
                        "port must be non-zero for stream host {}",
                        host
                    )));
                }
                Ok(Destination::Stream {
                    host: host.to_string(),
                    port,
                })
            }
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Destination::Http(_))
    }

    /// Stream destinations are always TLS; HTTP ones only with `https`.
    pub fn is_secure(&self) -> bool {
        match self {
            Destination::Stream { .. } => true,
            Destination::Http(url) => url.scheme() == "https",
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Stream { host, port } => write!(f, "{}:{}", host, port),
            Destination::Http(url) => write!(f, "{}", url),
        }
    }
}

/// Configuration for one collector destination.
///
/// All settings can be configured via environment variables:
/// - `LOGSTASH_SHIPPER_HOST`: collector host or `http(s)://` URL (default: localhost)
/// - `LOGSTASH_SHIPPER_PORT`: collector port for stream hosts (default: 5000)
/// - `LOGSTASH_SHIPPER_TIMEOUT_SECS`: connect/handshake/write timeout (default: 20)
/// - `LOGSTASH_SHIPPER_POST_TIMEOUT_SECS`: batch POST timeout (default: 5)
/// - `LOGSTASH_SHIPPER_ALLOW_UNTRUSTED`: accept any server certificate (default: false)
/// - `LOGSTASH_SHIPPER_TOKEN`: static API token (default: unset)
/// - `LOGSTASH_SHIPPER_APP_ID`: value of the `App-ID` header (default: crate name)
/// - `LOGSTASH_SHIPPER_STAGING_DIR`: directory for staged HTTP payloads (default: temp dir)
/// - `LOGSTASH_SHIPPER_BATCH_SIZE`: records per flush in the binary (default: 100)
/// - `LOGSTASH_SHIPPER_FLUSH_INTERVAL_SECS`: seconds between flushes in the binary (default: 5)
#[derive(Debug, Clone)]
pub struct Config {
    /// Collector host, or an `http(s)://` URL
    pub host: String,

    /// Collector port, used by stream destinations
    pub port: u16,

    /// Bound on TCP connect, TLS handshake and each write
    pub timeout: Duration,

    /// Bound on one batch POST
    pub post_timeout: Duration,

    /// Accept any server certificate during the TLS handshake
    pub allow_untrusted_server: bool,

    /// Static API token sent with every record or batch
    pub auth_token: Option<String>,

    /// Application identifier sent with every HTTP batch
    pub app_id: String,

    /// Directory holding staged HTTP payloads
    pub staging_dir: PathBuf,

    /// Number of records to accumulate before the binary flushes
    pub batch_size: usize,

    /// Duration between the binary's time-based flushes
    pub flush_interval: Duration,
}

/// Error type for configuration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable holds an unusable value.
    #[error("Configuration error for {env_var}: {message}")]
    Invalid { env_var: String, message: String },

    /// The destination address cannot be used.
    #[error("Configuration error: {0}")]
    Destination(String),
}

impl ConfigError {
    fn invalid(env_var: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            env_var: env_var.to_string(),
            message: message.into(),
        }
    }
}

impl Config {
    /// Create a configuration for `host:port` with default settings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_post_timeout(mut self, timeout: Duration) -> Self {
        self.post_timeout = timeout;
        self
    }

    pub fn with_allow_untrusted_server(mut self, allow: bool) -> Self {
        self.allow_untrusted_server = allow;
        self
    }

    /// Set the API token; an empty token clears it.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.auth_token = if token.is_empty() { None } else { Some(token) };
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    /// Resolve the delivery strategy for this configuration.
    pub fn destination(&self) -> Result<Destination, ConfigError> {
        Destination::parse(&self.host, self.port)
    }

    /// Load configuration from environment variables.
    ///
    /// Returns a new `Config` instance with values from environment variables,
    /// falling back to sensible defaults where appropriate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set to a value that does not
    /// parse or lies outside its allowed range, or if the resulting
    /// destination is unusable.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use logstash_shipper::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Collector: {}", config.host);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("LOGSTASH_SHIPPER_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = Self::parse_port()?;

        let timeout = Self::parse_secs("LOGSTASH_SHIPPER_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;
        let post_timeout =
            Self::parse_secs("LOGSTASH_SHIPPER_POST_TIMEOUT_SECS", DEFAULT_POST_TIMEOUT_SECS)?;
        let flush_interval = Self::parse_secs(
            "LOGSTASH_SHIPPER_FLUSH_INTERVAL_SECS",
            DEFAULT_FLUSH_INTERVAL_SECS,
        )?;
        let batch_size = Self::parse_batch_size()?;
        let allow_untrusted_server = Self::parse_flag("LOGSTASH_SHIPPER_ALLOW_UNTRUSTED")?;

        let auth_token = env::var("LOGSTASH_SHIPPER_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());

        let app_id = match env::var("LOGSTASH_SHIPPER_APP_ID") {
            Ok(value) if value.trim().is_empty() => {
                return Err(ConfigError::invalid(
                    "LOGSTASH_SHIPPER_APP_ID",
                    "app id must not be empty",
                ))
            }
            Ok(value) => value,
            Err(_) => default_app_id(),
        };

        let staging_dir = env::var("LOGSTASH_SHIPPER_STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir());

        let config = Self {
            host,
            port,
            timeout,
            post_timeout,
            allow_untrusted_server,
            auth_token,
            app_id,
            staging_dir,
            batch_size,
            flush_interval,
        };

        config.destination()?;
        Ok(config)
    }

    fn parse_port() -> Result<u16, ConfigError> {
        let env_var = "LOGSTASH_SHIPPER_PORT";

        match env::var(env_var) {
            Ok(value) => value
                .parse()
                .map_err(|_| ConfigError::invalid(env_var, format!("'{}' is not a valid port", value))),
            Err(_) => Ok(DEFAULT_PORT),
        }
    }

    /// Parse a whole number of seconds within the allowed bounds.
    fn parse_secs(env_var: &str, default: u64) -> Result<Duration, ConfigError> {
        match env::var(env_var) {
            Ok(value) => {
                let secs: u64 = value.parse().map_err(|_| {
                    ConfigError::invalid(env_var, format!("'{}' is not a valid number", value))
                })?;

                if secs < MIN_SECS {
                    return Err(ConfigError::invalid(
                        env_var,
                        format!("{} is below minimum ({}s)", secs, MIN_SECS),
                    ));
                }

                if secs > MAX_SECS {
                    return Err(ConfigError::invalid(
                        env_var,
                        format!("{} exceeds maximum ({}s)", secs, MAX_SECS),
                    ));
                }

                Ok(Duration::from_secs(secs))
            }
            Err(_) => Ok(Duration::from_secs(default)),
        }
    }

    /// Parse batch size from environment variable with validation.
    fn parse_batch_size() -> Result<usize, ConfigError> {
        let env_var = "LOGSTASH_SHIPPER_BATCH_SIZE";

        match env::var(env_var) {
            Ok(value) => {
                let batch_size: usize = value.parse().map_err(|_| {
                    ConfigError::invalid(env_var, format!("'{}' is not a valid number", value))
                })?;

                if batch_size == 0 {
                    return Err(ConfigError::invalid(
                        env_var,
                        "batch size must be greater than 0",
                    ));
                }

                if batch_size > MAX_BATCH_SIZE {
                    return Err(ConfigError::invalid(
                        env_var,
                        format!(
                            "batch size {} exceeds maximum allowed ({})",
                            batch_size, MAX_BATCH_SIZE
                        ),
                    ));
                }

                Ok(batch_size)
            }
            Err(_) => Ok(DEFAULT_BATCH_SIZE),
        }
    }

    fn parse_flag(env_var: &str) -> Result<bool, ConfigError> {
        match env::var(env_var) {
            Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" | "" => Ok(false),
                _ => Err(ConfigError::invalid(
                    env_var,
                    format!("'{}' is not a valid boolean", value),
                )),
            },
            Err(_) => Ok(false),
        }
    }
}

fn default_app_id() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            post_timeout: Duration::from_secs(DEFAULT_POST_TIMEOUT_SECS),
            allow_untrusted_server: false,
            auth_token: None,
            app_id: default_app_id(),
            staging_dir: env::temp_dir(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
        }
    }
}
