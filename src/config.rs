//! Gateway configuration. See SPEC_FULL.md §1 "AMBIENT STACK" and §6
//! "Configuration (named options)".
//!
//! Environment-variable driven, following the original `Config::from_env`
//! shape but with the spec's `gateway.*`/`ratelimit.*`/`security.*` keys
//! flattened into `GATEWAY_*` / `RATELIMIT_*` / `SECURITY_*` env vars.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// `gateway.scheduling.*`
#[derive(Debug, Clone)]
pub struct SchedulingConfig {
    pub outbox_poll_interval: Duration,
    /// `0` disables the periodic full rebuild.
    pub full_rebuild_interval: Duration,
    pub outbox_lag_warn: Duration,
    pub outbox_lag_rebuild: Duration,
    pub outbox_lag_rebuild_failures: u32,
    pub outbox_backlog_rebuild_rows: usize,
    pub db_fallback_enabled: bool,
    pub db_fallback_max_qps: u32,
    pub db_fallback_timeout: Duration,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            outbox_poll_interval: Duration::from_secs(1),
            full_rebuild_interval: Duration::from_secs(0),
            outbox_lag_warn: Duration::from_secs(5),
            outbox_lag_rebuild: Duration::from_secs(30),
            outbox_lag_rebuild_failures: 3,
            outbox_backlog_rebuild_rows: 500,
            db_fallback_enabled: false,
            db_fallback_max_qps: 5,
            db_fallback_timeout: Duration::from_millis(500),
        }
    }
}

/// `gateway.*` stream/body options that don't belong to scheduling.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub data_interval_timeout: Duration,
    pub keepalive_interval: Duration,
    pub max_line_size: usize,
    pub log_upstream_error_body: bool,
    pub log_upstream_error_body_max_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            data_interval_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            max_line_size: 1 << 20,
            log_upstream_error_body: true,
            log_upstream_error_body_max_bytes: 8 * 1024,
        }
    }
}

/// `ratelimit.*`
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub overload_cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { overload_cooldown: Duration::from_secs(60) }
    }
}

/// `security.url_allowlist.*` — SSRF guard applied before any upstream
/// request is built.
#[derive(Debug, Clone)]
pub struct UrlAllowlistConfig {
    pub enabled: bool,
    pub upstream_hosts: Vec<String>,
    pub allow_private_hosts: bool,
    pub allow_insecure_http: bool,
}

impl Default for UrlAllowlistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            upstream_hosts: vec![
                "api.anthropic.com".to_string(),
                "api.openai.com".to_string(),
                "chatgpt.com".to_string(),
                "generativelanguage.googleapis.com".to_string(),
                "cloudcode-pa.googleapis.com".to_string(),
            ],
            allow_private_hosts: false,
            allow_insecure_http: false,
        }
    }
}

impl UrlAllowlistConfig {
    /// SSRF guard applied to every upstream URL the Forwarding Engine
    /// builds, before a request is sent. `allow_private_hosts` widens the
    /// allowlist check to any host (self-hosted/proxy deployments); it
    /// does not perform DNS resolution to check the actual target IP.
    pub fn check(&self, url: &str) -> Result<(), crate::error::GatewayError> {
        if !self.enabled {
            return Ok(());
        }
        let parsed = url::Url::parse(url).map_err(|_| {
            crate::error::GatewayError::new(crate::error::ErrorKind::InvalidRequest, format!("malformed upstream url: {url}"))
        })?;
        if parsed.scheme() != "https" && !self.allow_insecure_http {
            return Err(crate::error::GatewayError::new(
                crate::error::ErrorKind::InvalidRequest,
                format!("upstream url scheme not allowed: {}", parsed.scheme()),
            ));
        }
        let host = parsed.host_str().unwrap_or_default();
        if !self.allow_private_hosts && !self.upstream_hosts.iter().any(|h| h == host) {
            return Err(crate::error::GatewayError::new(
                crate::error::ErrorKind::InvalidRequest,
                format!("upstream host not allowlisted: {host}"),
            ));
        }
        Ok(())
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Bearer proxy API keys accepted on inbound routes, each mapped to a
    /// `group_id`. See SPEC_FULL.md SUPPLEMENTAL "auth and admin surface".
    pub proxy_api_keys: Vec<ProxyApiKey>,
    pub scheduling: SchedulingConfig,
    pub stream: StreamConfig,
    pub ratelimit: RateLimitConfig,
    pub url_allowlist: UrlAllowlistConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyApiKey {
    pub key: String,
    pub group_id: i64,
}

impl Config {
    /// Spec-default configuration with no proxy API keys, for tests that
    /// don't want to round-trip through environment variables.
    #[cfg(test)]
    pub fn default_for_test() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            proxy_api_keys: Vec::new(),
            scheduling: SchedulingConfig::default(),
            stream: StreamConfig::default(),
            ratelimit: RateLimitConfig::default(),
            url_allowlist: UrlAllowlistConfig::default(),
        }
    }

    /// Load configuration from environment variables. `GATEWAY_PROXY_API_KEYS`
    /// is the only required variable; everything else has a spec-default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_env_or("GATEWAY_PORT", 8080)?;
        let data_dir = std::env::var("GATEWAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let proxy_api_keys = parse_proxy_api_keys(
            std::env::var("GATEWAY_PROXY_API_KEYS")
                .map_err(|_| ConfigError::MissingEnvVar("GATEWAY_PROXY_API_KEYS".to_string()))?,
        )?;

        let scheduling = SchedulingConfig {
            outbox_poll_interval: parse_env_secs_or("GATEWAY_SCHEDULING_OUTBOX_POLL_INTERVAL_SECONDS", 1)?,
            full_rebuild_interval: parse_env_secs_or("GATEWAY_SCHEDULING_FULL_REBUILD_INTERVAL_SECONDS", 0)?,
            outbox_lag_warn: parse_env_secs_or("GATEWAY_SCHEDULING_OUTBOX_LAG_WARN_SECONDS", 5)?,
            outbox_lag_rebuild: parse_env_secs_or("GATEWAY_SCHEDULING_OUTBOX_LAG_REBUILD_SECONDS", 30)?,
            outbox_lag_rebuild_failures: parse_env_or("GATEWAY_SCHEDULING_OUTBOX_LAG_REBUILD_FAILURES", 3)?,
            outbox_backlog_rebuild_rows: parse_env_or("GATEWAY_SCHEDULING_OUTBOX_BACKLOG_REBUILD_ROWS", 500)?,
            db_fallback_enabled: parse_env_or("GATEWAY_SCHEDULING_DB_FALLBACK_ENABLED", false)?,
            db_fallback_max_qps: parse_env_or("GATEWAY_SCHEDULING_DB_FALLBACK_MAX_QPS", 5)?,
            db_fallback_timeout: Duration::from_millis(parse_env_or("GATEWAY_SCHEDULING_DB_FALLBACK_TIMEOUT_MILLIS", 500)?),
        };

        let stream = StreamConfig {
            data_interval_timeout: parse_env_secs_or("GATEWAY_STREAM_DATA_INTERVAL_TIMEOUT_SECONDS", 30)?,
            keepalive_interval: parse_env_secs_or("GATEWAY_STREAM_KEEPALIVE_INTERVAL_SECONDS", 15)?,
            max_line_size: parse_env_or("GATEWAY_MAX_LINE_SIZE", 1 << 20)?,
            log_upstream_error_body: parse_env_or("GATEWAY_LOG_UPSTREAM_ERROR_BODY", true)?,
            log_upstream_error_body_max_bytes: parse_env_or("GATEWAY_LOG_UPSTREAM_ERROR_BODY_MAX_BYTES", 8 * 1024)?,
        };

        let ratelimit = RateLimitConfig {
            overload_cooldown: Duration::from_secs(60 * parse_env_or::<u64>("RATELIMIT_OVERLOAD_COOLDOWN_MINUTES", 1)?),
        };

        let url_allowlist = UrlAllowlistConfig {
            enabled: parse_env_or("SECURITY_URL_ALLOWLIST_ENABLED", true)?,
            upstream_hosts: std::env::var("SECURITY_URL_ALLOWLIST_UPSTREAM_HOSTS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| UrlAllowlistConfig::default().upstream_hosts),
            allow_private_hosts: parse_env_or("SECURITY_URL_ALLOWLIST_ALLOW_PRIVATE_HOSTS", false)?,
            allow_insecure_http: parse_env_or("SECURITY_URL_ALLOWLIST_ALLOW_INSECURE_HTTP", false)?,
        };

        Ok(Self { host, port, data_dir, proxy_api_keys, scheduling, stream, ratelimit, url_allowlist })
    }
}

fn parse_env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue(key.to_string(), format!("{e}"))),
        Err(_) => Ok(default),
    }
}

fn parse_env_secs_or(key: &str, default_secs: u64) -> Result<Duration, ConfigError> {
    parse_env_or::<u64>(key, default_secs).map(Duration::from_secs)
}

/// `key1:group_id1,key2:group_id2`
fn parse_proxy_api_keys(raw: String) -> Result<Vec<ProxyApiKey>, ConfigError> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            let (key, group_id) = entry
                .trim()
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidValue("GATEWAY_PROXY_API_KEYS".to_string(), entry.to_string()))?;
            let group_id = group_id
                .parse()
                .map_err(|e| ConfigError::InvalidValue("GATEWAY_PROXY_API_KEYS".to_string(), format!("{e}")))?;
            Ok(ProxyApiKey { key: key.to_string(), group_id })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_api_keys_parse_key_to_group_id_pairs() {
        let keys = parse_proxy_api_keys("sk-abc:1,sk-def:2".to_string()).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key, "sk-abc");
        assert_eq!(keys[0].group_id, 1);
        assert_eq!(keys[1].group_id, 2);
    }

    #[test]
    fn proxy_api_keys_rejects_entry_without_group_id() {
        assert!(parse_proxy_api_keys("sk-abc".to_string()).is_err());
    }

    #[test]
    fn url_allowlist_rejects_host_not_in_list() {
        let allowlist = UrlAllowlistConfig::default();
        assert!(allowlist.check("https://evil.example.com/v1/messages").is_err());
    }

    #[test]
    fn url_allowlist_accepts_known_upstream_host() {
        let allowlist = UrlAllowlistConfig::default();
        assert!(allowlist.check("https://api.anthropic.com/v1/messages").is_ok());
    }

    #[test]
    fn url_allowlist_rejects_plain_http_unless_allowed() {
        let allowlist = UrlAllowlistConfig::default();
        assert!(allowlist.check("http://api.anthropic.com/v1/messages").is_err());
    }

    #[test]
    fn defaults_match_spec_table() {
        let scheduling = SchedulingConfig::default();
        assert_eq!(scheduling.outbox_poll_interval, Duration::from_secs(1));
        assert_eq!(scheduling.full_rebuild_interval, Duration::from_secs(0));
        let stream = StreamConfig::default();
        assert_eq!(stream.max_line_size, 1 << 20);
    }
}
