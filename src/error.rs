//! Error kinds propagated across the gateway. See SPEC_FULL.md §7.
//!
//! Mirrors the shape of `llm::error::LlmError` (kind + message + optional
//! retry_after) but widened to cover operational and retry-specific
//! failures that have no upstream HTTP status of their own.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Classification
    InvalidRequest,
    Authentication,
    Permission,
    NotFound,
    RateLimit,
    Timeout,
    Overloaded,
    ApiError,
    UpstreamError,

    // Operational
    SchedulerCacheNotReady,
    SchedulerDbFallbackLimited,
    NoAvailableAccounts,
    NoAvailableAccountsSupportingModel,
    UnsupportedAccountType,
    /// Internal signal only: never serialized to a caller.
    UpstreamFailover,

    // Retry-specific
    OpsRetryInProgress,
    OpsRetryTooFrequent,
    OpsRetryPinnedAccountRequired,
    OpsRetryNoRequestBody,
    OpsRetryInvalidMode,

    // Subscription/billing
    SubscriptionNotFound,
    SubscriptionExpired,
    SubscriptionSuspended,
    DailyLimitExceeded,
    WeeklyLimitExceeded,
    MonthlyLimitExceeded,
}

impl ErrorKind {
    /// Codes `401, 403, 429, 529, ≥500` cause failover; everything else is
    /// fatal and mapped directly to a protocol error. See SPEC_FULL.md
    /// §4.2 "Failover vs fatal".
    pub fn is_failover_trigger(&self) -> bool {
        matches!(
            self,
            ErrorKind::Authentication | ErrorKind::Permission | ErrorKind::RateLimit
                | ErrorKind::Overloaded | ErrorKind::ApiError | ErrorKind::UpstreamError
                | ErrorKind::Timeout
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            model_name: None,
            retry_after_secs: None,
        }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    pub fn no_available_accounts() -> Self {
        Self::new(ErrorKind::NoAvailableAccounts, "no schedulable account is currently available")
    }

    pub fn no_available_accounts_supporting_model(model: &str) -> Self {
        Self::new(
            ErrorKind::NoAvailableAccountsSupportingModel,
            format!("no available accounts supporting model: {model}"),
        )
    }

    pub fn scheduler_cache_not_ready() -> Self {
        Self::new(ErrorKind::SchedulerCacheNotReady, "scheduler snapshot cache is not ready")
    }

    pub fn scheduler_db_fallback_limited() -> Self {
        Self::new(ErrorKind::SchedulerDbFallbackLimited, "scheduler db fallback limited")
    }

    pub fn ops_retry_in_progress() -> Self {
        Self::new(ErrorKind::OpsRetryInProgress, "a retry attempt is already running for this error")
    }

    pub fn ops_retry_too_frequent() -> Self {
        Self::new(ErrorKind::OpsRetryTooFrequent, "ops_retry_too_frequent")
    }

    /// Internal-only signal asking the handler to pick a different
    /// account; never serialized to a caller.
    pub fn upstream_failover() -> Self {
        Self::new(ErrorKind::UpstreamFailover, "upstream failover requested")
    }

    pub fn is_failover(&self) -> bool {
        self.kind == ErrorKind::UpstreamFailover
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for GatewayError {}

/// Classify an upstream HTTP status into a `GatewayError` kind. Mirrors
/// `llm::error::classify_http_status`.
pub fn classify_http_status(status: u16, message: impl Into<String>) -> GatewayError {
    let kind = match status {
        400 => ErrorKind::InvalidRequest,
        401 => ErrorKind::Authentication,
        402 | 403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        408 => ErrorKind::Timeout,
        429 => ErrorKind::RateLimit,
        529 => ErrorKind::Overloaded,
        500..=599 => ErrorKind::ApiError,
        _ if (400..500).contains(&status) => ErrorKind::InvalidRequest,
        _ => ErrorKind::UpstreamError,
    };
    GatewayError::new(kind, message)
}

/// Scrub sensitive query/body fragments before an upstream error message
/// is logged or surfaced. See SPEC_FULL.md §7 "Sensitive-data scrubbing".
pub fn scrub_sensitive(input: &str) -> String {
    let re = regex::Regex::new(
        r"(?i)(\?key=|client_secret=|access_token=|refresh_token=)[^&\s""]+",
    )
    .expect("static regex is valid");
    re.replace_all(input, "$1***").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_statuses() {
        assert_eq!(classify_http_status(429, "x").kind, ErrorKind::RateLimit);
        assert_eq!(classify_http_status(529, "x").kind, ErrorKind::Overloaded);
        assert_eq!(classify_http_status(401, "x").kind, ErrorKind::Authentication);
        assert_eq!(classify_http_status(503, "x").kind, ErrorKind::ApiError);
    }

    #[test]
    fn failover_triggers_match_spec() {
        assert!(ErrorKind::Authentication.is_failover_trigger());
        assert!(ErrorKind::RateLimit.is_failover_trigger());
        assert!(ErrorKind::Overloaded.is_failover_trigger());
        assert!(!ErrorKind::InvalidRequest.is_failover_trigger());
        assert!(!ErrorKind::NotFound.is_failover_trigger());
    }

    #[test]
    fn scrubs_sensitive_query_fragments() {
        let input = "upstream rejected request ?key=AIzaSyAbc123 please retry";
        let scrubbed = scrub_sensitive(input);
        assert!(!scrubbed.contains("AIzaSyAbc123"));
        assert!(scrubbed.contains("***"));
    }
}
