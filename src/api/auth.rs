//! Bearer-token authentication against the configured proxy API keys.
//! See SPEC_FULL.md §1 "SUPPLEMENTAL — auth and admin surface".
//!
//! OAuth token issuance, user accounts, and admin RBAC are external
//! collaborators (out of scope per spec.md §1); this module only does
//! the one thing the core needs to pick a bucket: map a caller's bearer
//! token to the `group_id` the request should be scheduled against.

use axum::http::HeaderMap;

use crate::config::Config;

#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedCaller {
    pub group_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    Missing,
    Invalid,
}

/// Accepts the token from `Authorization: Bearer <token>` or `x-api-key`
/// (Anthropic-shaped inbound sends the latter).
pub fn authenticate(config: &Config, headers: &HeaderMap) -> Result<AuthenticatedCaller, AuthError> {
    let token = bearer_token(headers).or_else(|| header_str(headers, "x-api-key"));
    let Some(token) = token else { return Err(AuthError::Missing) };

    config
        .proxy_api_keys
        .iter()
        .find(|k| k.key == token)
        .map(|k| AuthenticatedCaller { group_id: k.group_id })
        .ok_or(AuthError::Invalid)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "authorization")?.strip_prefix("Bearer ").map(|s| s.to_string())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyApiKey;
    use axum::http::HeaderValue;

    fn config_with_keys() -> Config {
        let mut config = Config::default_for_test();
        config.proxy_api_keys = vec![ProxyApiKey { key: "sk-abc".to_string(), group_id: 7 }];
        config
    }

    #[test]
    fn resolves_group_id_from_bearer_token() {
        let config = config_with_keys();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-abc"));
        let caller = authenticate(&config, &headers).unwrap();
        assert_eq!(caller.group_id, 7);
    }

    #[test]
    fn falls_back_to_x_api_key_header() {
        let config = config_with_keys();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-abc"));
        let caller = authenticate(&config, &headers).unwrap();
        assert_eq!(caller.group_id, 7);
    }

    #[test]
    fn rejects_unknown_token() {
        let config = config_with_keys();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-wrong"));
        assert_eq!(authenticate(&config, &headers).unwrap_err(), AuthError::Invalid);
    }

    #[test]
    fn rejects_missing_token() {
        let config = config_with_keys();
        assert_eq!(authenticate(&config, &HeaderMap::new()).unwrap_err(), AuthError::Missing);
    }
}
