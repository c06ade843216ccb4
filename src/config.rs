//! Configuration loading and types for the storage client.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`ClientConfig`] struct.  Each subsection governs a different part of
//! the client: API endpoints, credential resolution, retry behavior, and
//! logging.  Every section has defaults, so an empty file is valid.

use garde::Validate;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::retry::IdempotencyStrategy;

/// Public JSON API endpoint.
pub const DEFAULT_API_ENDPOINT: &str = "https://storage.googleapis.com";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ClientConfig {
    /// Default project for bucket listing, creation, and HMAC keys.
    #[serde(default)]
    #[garde(skip)]
    pub project_id: Option<String>,

    /// Endpoint and request settings.
    #[serde(default)]
    #[garde(dive)]
    pub api: ApiConfig,

    /// Credential resolution.
    #[serde(default)]
    #[garde(skip)]
    pub credentials: CredentialsConfig,

    /// Retry and backoff behavior.
    #[serde(default)]
    #[garde(dive)]
    pub retry: RetryConfig,

    /// Logging settings (used by the CLI).
    #[serde(default)]
    #[garde(skip)]
    pub logging: LoggingConfig,
}

/// API endpoint configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ApiConfig {
    /// Base URL of the JSON API (without `/storage/v1`).
    #[serde(default = "default_api_endpoint")]
    #[garde(length(min = 1))]
    pub endpoint: String,

    /// Project billed for requester-pays buckets (`userProject`).
    #[serde(default)]
    #[garde(skip)]
    pub user_project: Option<String>,

    /// Extra product token appended to the `User-Agent` header.
    #[serde(default)]
    #[garde(skip)]
    pub user_agent: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    #[garde(range(min = 1))]
    pub request_timeout_secs: u64,

    /// Resumable upload chunk size in bytes (rounded to 256 KiB).
    #[serde(default = "default_chunk_size")]
    #[garde(range(min = 262_144))]
    pub upload_chunk_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_api_endpoint(),
            user_project: None,
            user_agent: None,
            request_timeout_secs: default_request_timeout(),
            upload_chunk_size: default_chunk_size(),
        }
    }
}

impl ApiConfig {
    /// Per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// How credentials are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialsKind {
    /// Application Default Credentials chain.
    #[default]
    Default,
    /// Service account JSON key file at `path`.
    ServiceAccount,
    /// gcloud user credentials file at `path`.
    AuthorizedUser,
    /// Compute metadata server.
    Metadata,
    /// A fixed bearer token (`token`).
    Token,
    /// No `Authorization` header (public data, emulators).
    Anonymous,
}

/// Credential configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsConfig {
    /// Resolution strategy.
    #[serde(default)]
    pub kind: CredentialsKind,

    /// Path to a key or credentials file.
    #[serde(default)]
    pub path: Option<String>,

    /// Static access token for `kind: token`.
    #[serde(default)]
    pub token: Option<String>,
}

/// Retry configuration.
///
/// Defaults: three retries, one second initial delay doubling up to 64
/// seconds, a ten minute overall budget, and conditional idempotency.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RetryConfig {
    /// Master switch; when false every error is terminal.
    #[serde(default = "default_true")]
    #[garde(skip)]
    pub auto_retry: bool,

    /// Maximum retries after the first attempt.
    #[serde(default = "default_max_retries")]
    #[garde(range(max = 100))]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    #[garde(range(min = 1))]
    pub initial_delay_ms: u64,

    /// Growth factor applied to the delay after each retry.
    #[serde(default = "default_multiplier")]
    #[garde(range(min = 1.0))]
    pub retry_delay_multiplier: f64,

    /// Cap on a single backoff delay, in milliseconds.
    #[serde(default = "default_max_retry_delay_ms")]
    #[garde(range(min = 1))]
    pub max_retry_delay_ms: u64,

    /// Overall budget for one operation including retries, in milliseconds.
    #[serde(default = "default_total_timeout_ms")]
    #[garde(range(min = 1))]
    pub total_timeout_ms: u64,

    /// Which operations may be retried.
    #[serde(default)]
    #[garde(skip)]
    pub idempotency_strategy: IdempotencyStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            auto_retry: true,
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            retry_delay_multiplier: default_multiplier(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            total_timeout_ms: default_total_timeout_ms(),
            idempotency_strategy: IdempotencyStrategy::default(),
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_api_endpoint() -> String {
    DEFAULT_API_ENDPOINT.to_string()
}

fn default_request_timeout() -> u64 {
    300
}

fn default_chunk_size() -> usize {
    8 * 1024 * 1024
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_retry_delay_ms() -> u64 {
    64_000
}

fn default_total_timeout_ms() -> u64 {
    600_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Environment --------------------------------------------------------------

impl ClientConfig {
    /// Apply environment overrides.
    ///
    /// `STORAGE_EMULATOR_HOST` points every endpoint at an emulator and
    /// disables authentication; `GOOGLE_CLOUD_PROJECT` supplies a project
    /// when the file did not.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var("STORAGE_EMULATOR_HOST").ok(),
            std::env::var("GOOGLE_CLOUD_PROJECT").ok(),
        );
    }

    fn apply_overrides(&mut self, emulator_host: Option<String>, project: Option<String>) {
        if let Some(host) = emulator_host.filter(|h| !h.is_empty()) {
            let host = host.trim_end_matches('/');
            self.api.endpoint = if host.starts_with("http://") || host.starts_with("https://") {
                host.to_string()
            } else {
                format!("http://{host}")
            };
            self.credentials.kind = CredentialsKind::Anonymous;
        }
        if self.project_id.is_none() {
            self.project_id = project.filter(|p| !p.is_empty());
        }
    }
}

// -- Loader ------------------------------------------------------------------

/// Load, override from the environment, and validate configuration from a
/// YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<ClientConfig> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let mut config = parse_config(&contents)?;
    config.apply_env();
    Ok(config)
}

/// Parse and validate configuration from a YAML string.
pub fn parse_config(contents: &str) -> anyhow::Result<ClientConfig> {
    let config: ClientConfig = if contents.trim().is_empty() {
        ClientConfig::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    config
        .validate()
        .map_err(|report| anyhow::anyhow!("invalid configuration: {report}"))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.api.endpoint, DEFAULT_API_ENDPOINT);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.max_retry_delay(), Duration::from_secs(64));
        assert_eq!(config.retry.total_timeout(), Duration::from_secs(600));
        assert_eq!(
            config.retry.idempotency_strategy,
            IdempotencyStrategy::RetryConditional
        );
        assert_eq!(config.credentials.kind, CredentialsKind::Default);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project_id: my-project
api:
  endpoint: http://localhost:4443
  user_project: billing-project
  request_timeout_secs: 30
credentials:
  kind: service_account
  path: /etc/keys/sa.json
retry:
  max_retries: 5
  retry_delay_multiplier: 1.5
  idempotency_strategy: retry_always
logging:
  level: debug
  format: json
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.project_id.as_deref(), Some("my-project"));
        assert_eq!(config.api.endpoint, "http://localhost:4443");
        assert_eq!(config.api.user_project.as_deref(), Some("billing-project"));
        assert_eq!(config.api.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.credentials.kind, CredentialsKind::ServiceAccount);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(
            config.retry.idempotency_strategy,
            IdempotencyStrategy::RetryAlways
        );
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_multiplier_below_one_is_rejected() {
        let yaml = "retry:\n  retry_delay_multiplier: 0.5\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn test_tiny_chunk_size_is_rejected() {
        let yaml = "api:\n  upload_chunk_size: 1024\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn test_emulator_override() {
        let mut config = ClientConfig::default();
        config.apply_overrides(Some("localhost:9023/".to_string()), None);
        assert_eq!(config.api.endpoint, "http://localhost:9023");
        assert_eq!(config.credentials.kind, CredentialsKind::Anonymous);
    }

    #[test]
    fn test_project_env_does_not_override_file() {
        let mut config = ClientConfig {
            project_id: Some("from-file".to_string()),
            ..Default::default()
        };
        config.apply_overrides(None, Some("from-env".to_string()));
        assert_eq!(config.project_id.as_deref(), Some("from-file"));

        let mut config = ClientConfig::default();
        config.apply_overrides(None, Some("from-env".to_string()));
        assert_eq!(config.project_id.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gcs.yaml");
        std::fs::write(&path, "project_id: p1\n").unwrap();
        let config = load_config(&path).unwrap();
        assert!(config.project_id.is_some());
    }
}
