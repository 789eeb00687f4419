//! Map a `GatewayError` to the inbound protocol's own wire error shape.
//! See SPEC_FULL.md §6 "Error wire format" / §7 "User-visible".
//!
//! Upstream error bodies are never leaked verbatim unless the
//! Error-Passthrough Rule Engine already substituted one in; this module
//! only handles the fatal/operational path where the gateway itself is
//! constructing the error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::{ErrorKind, GatewayError};
use crate::forwarding::engine::InboundProtocol;

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
        ErrorKind::Permission => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Overloaded => StatusCode::from_u16(529).unwrap_or(StatusCode::SERVICE_UNAVAILABLE),
        ErrorKind::NoAvailableAccounts | ErrorKind::NoAvailableAccountsSupportingModel => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::SchedulerCacheNotReady | ErrorKind::SchedulerDbFallbackLimited => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::OpsRetryInProgress | ErrorKind::OpsRetryTooFrequent => StatusCode::CONFLICT,
        ErrorKind::OpsRetryPinnedAccountRequired | ErrorKind::OpsRetryNoRequestBody | ErrorKind::OpsRetryInvalidMode => StatusCode::BAD_REQUEST,
        ErrorKind::SubscriptionNotFound => StatusCode::NOT_FOUND,
        ErrorKind::SubscriptionExpired | ErrorKind::SubscriptionSuspended => StatusCode::FORBIDDEN,
        ErrorKind::DailyLimitExceeded | ErrorKind::WeeklyLimitExceeded | ErrorKind::MonthlyLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::UnsupportedAccountType | ErrorKind::ApiError | ErrorKind::UpstreamError | ErrorKind::UpstreamFailover => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Anthropic error `type` string for a given kind. Operational/retry
/// kinds that have no Anthropic equivalent fall back to `api_error`.
fn anthropic_error_type(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidRequest => "invalid_request_error",
        ErrorKind::Authentication => "authentication_error",
        ErrorKind::Permission => "permission_error",
        ErrorKind::NotFound => "not_found_error",
        ErrorKind::RateLimit => "rate_limit_error",
        ErrorKind::Timeout => "timeout_error",
        ErrorKind::Overloaded => "overloaded_error",
        _ => "api_error",
    }
}

pub fn render(protocol: InboundProtocol, error: &GatewayError) -> Response {
    let status = status_for(error.kind);
    let message = error.message.clone();

    let body = match protocol {
        InboundProtocol::Anthropic => json!({
            "type": "error",
            "error": { "type": anthropic_error_type(error.kind), "message": message },
        }),
        InboundProtocol::OpenaiResponses => json!({
            "type": "error",
            "error": { "type": anthropic_error_type(error.kind), "message": message },
        }),
        InboundProtocol::GeminiNative => json!({
            "error": { "code": status.as_u16(), "message": message, "status": gemini_status(error.kind) },
        }),
    };

    (status, Json(body)).into_response()
}

fn gemini_status(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidRequest => "INVALID_ARGUMENT",
        ErrorKind::Permission => "PERMISSION_DENIED",
        ErrorKind::NotFound => "NOT_FOUND",
        ErrorKind::RateLimit => "RESOURCE_EXHAUSTED",
        ErrorKind::Authentication => "UNAUTHENTICATED",
        ErrorKind::Overloaded => "UNAVAILABLE",
        ErrorKind::Timeout => "DEADLINE_EXCEEDED",
        ErrorKind::ApiError => "INTERNAL",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_maps_to_429_on_every_protocol() {
        let err = GatewayError::new(ErrorKind::RateLimit, "slow down");
        for protocol in [InboundProtocol::Anthropic, InboundProtocol::OpenaiResponses, InboundProtocol::GeminiNative] {
            let response = render(protocol, &err);
            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        }
    }
}
