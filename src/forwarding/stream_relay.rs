//! SSE relay with a per-chunk watchdog, keepalive heartbeat, and
//! `max_line_size` enforcement. See SPEC_FULL.md §4.2 "Streaming relay".
//!
//! Line-splitting is grounded in `api::proxy::normalize_sse_stream`
//! (buffer-until-newline over a raw byte stream); the watchdog/usage-scan
//! wrapper is grounded in `api::proxy::track_stream_health` (an
//! `async_stream::stream!` block that scans passing chunks and only acts
//! once the wrapped stream ends). Usage recorded this way can't be
//! threaded back into the already-returned `ForwardResult` — it's logged
//! at stream completion instead, same as the teacher only ever logs it
//! through the health tracker rather than a return value.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use uuid::Uuid;

use crate::health::HealthStateMachine;
use crate::model::Platform;
use crate::usage::NormalizedUsage;

use super::{anthropic, StreamWatchdogConfig};

fn response_too_large_event() -> Bytes {
    Bytes::from_static(
        b"data: {\"type\":\"error\",\"error\":{\"type\":\"response_too_large\",\"message\":\"response line exceeded configured max_line_size\"}}\n\n",
    )
}

fn stream_stalled_event() -> Bytes {
    Bytes::from_static(
        b"data: {\"type\":\"error\",\"error\":{\"type\":\"stream_stalled\",\"message\":\"no data received from upstream within the configured watchdog interval\"}}\n\n",
    )
}

fn scan_usage_line(line: &[u8], platform: Platform, usage: &mut NormalizedUsage) {
    let Ok(text) = std::str::from_utf8(line) else { return };
    let Some(json_str) = text.trim_end().strip_prefix("data: ") else { return };
    let json_str = json_str.trim();
    if json_str.is_empty() || json_str == "[DONE]" {
        return;
    }
    let Ok(value) = serde_json::from_str::<Value>(json_str) else { return };

    let extracted = match platform {
        Platform::Anthropic => anthropic::usage_from_message_start(&value).or_else(|| anthropic::usage_from_message_delta(&value)),
        Platform::Openai => value
            .get("response")
            .and_then(|r| r.get("usage"))
            .or_else(|| value.get("usage"))
            .map(|u| {
                NormalizedUsage::from_openai(
                    u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                    u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                    u.get("input_tokens_details").and_then(|d| d.get("cached_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
                )
            }),
        Platform::Gemini | Platform::Antigravity => value.get("usageMetadata").map(|u| {
            NormalizedUsage::from_gemini(
                u.get("promptTokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
                u.get("candidatesTokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
                u.get("cachedContentTokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
            )
        }),
    };

    if let Some(next) = extracted {
        usage.merge_latest(next);
    }
}

/// Relay `rest` (the upstream byte stream with `head` already read off the
/// front of it) to the caller line-by-line, applying the watchdog/keepalive/
/// max_line_size rules and recording stall events against `account_id`.
/// Dropping the returned stream (client disconnect, `max_line_size`/stall
/// termination) drops `rest` with it, closing the upstream connection.
pub fn relay(
    head: Bytes,
    rest: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    config: StreamWatchdogConfig,
    health: Arc<HealthStateMachine>,
    account_id: Uuid,
    platform: Platform,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>> {
    let stream = async_stream::stream! {
        let mut upstream = Box::pin(rest);
        let mut buf: Vec<u8> = head.to_vec();
        let mut usage = NormalizedUsage::default();

        loop {
            let mut flushed_any = false;
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if line.len() > config.max_line_size {
                    yield Ok(response_too_large_event());
                    return;
                }
                scan_usage_line(&line, platform, &mut usage);
                yield Ok(Bytes::from(line));
                flushed_any = true;
            }
            if flushed_any {
                continue;
            }

            let next = match config.keepalive_interval {
                Some(keepalive) => {
                    tokio::select! {
                        biased;
                        item = tokio::time::timeout(config.data_interval_timeout, upstream.next()) => item,
                        _ = tokio::time::sleep(keepalive) => {
                            yield Ok(Bytes::from_static(b": keepalive\n\n"));
                            continue;
                        }
                    }
                }
                None => tokio::time::timeout(config.data_interval_timeout, upstream.next()).await,
            };

            match next {
                Ok(Some(Ok(chunk))) => {
                    buf.extend_from_slice(&chunk);
                    if buf.len() > config.max_line_size {
                        yield Ok(response_too_large_event());
                        return;
                    }
                }
                Ok(Some(Err(e))) => {
                    yield Err(std::io::Error::other(e.to_string()));
                    return;
                }
                Ok(None) => {
                    if !buf.is_empty() {
                        let remaining = std::mem::take(&mut buf);
                        scan_usage_line(&remaining, platform, &mut usage);
                        yield Ok(Bytes::from(remaining));
                    }
                    if usage.is_authoritative() {
                        tracing::debug!(account_id = %account_id, input_tokens = usage.input_tokens, output_tokens = usage.output_tokens, "stream completed");
                    }
                    return;
                }
                Err(_elapsed) => {
                    health.record_stream_stall(account_id).await;
                    yield Ok(stream_stalled_event());
                    return;
                }
            }
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthConfig;
    use crate::store::{JsonAccountStore, JsonOutboxStore};

    async fn test_health() -> Arc<HealthStateMachine> {
        let accounts = Arc::new(JsonAccountStore::new(tempfile::tempdir().unwrap().path().join("accounts.json")).await);
        let outbox = Arc::new(JsonOutboxStore::new(tempfile::tempdir().unwrap().path().join("outbox.json")).await);
        HealthStateMachine::new(accounts, outbox, HealthConfig::default())
    }

    #[test]
    fn scan_usage_line_extracts_anthropic_message_start() {
        let mut usage = NormalizedUsage::default();
        let line = b"data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":10,\"output_tokens\":0,\"cache_read_input_tokens\":0,\"cache_creation_input_tokens\":0}}}\n";
        scan_usage_line(line, Platform::Anthropic, &mut usage);
        assert_eq!(usage.input_tokens, 10);
    }

    #[test]
    fn scan_usage_line_ignores_done_sentinel() {
        let mut usage = NormalizedUsage::default();
        scan_usage_line(b"data: [DONE]\n", Platform::Openai, &mut usage);
        assert!(!usage.is_authoritative());
    }

    #[tokio::test]
    async fn relay_splits_chunks_on_newline_boundaries() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> =
            vec![Ok(Bytes::from_static(b"data: {\"a\":1}\ndata: {\"b\":2"))];
        let rest = futures::stream::iter(vec![Ok(Bytes::from_static(b"}\n"))]);
        let health = test_health().await;
        let relayed = relay(Bytes::new(), futures::stream::iter(chunks).chain(rest), StreamWatchdogConfig::default(), health, Uuid::new_v4(), Platform::Openai);
        let lines: Vec<_> = relayed.collect().await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].as_ref().unwrap().as_ref(), b"data: {\"a\":1}\n");
        assert_eq!(lines[1].as_ref().unwrap().as_ref(), b"data: {\"b\":2}\n");
    }

    #[tokio::test]
    async fn relay_terminates_with_synthetic_event_on_oversized_line() {
        let config = StreamWatchdogConfig { max_line_size: 4, ..StreamWatchdogConfig::default() };
        let rest = futures::stream::iter(Vec::<Result<Bytes, reqwest::Error>>::new());
        let health = test_health().await;
        let relayed = relay(Bytes::from_static(b"data: way too long\n"), rest, config, health, Uuid::new_v4(), Platform::Openai);
        let lines: Vec<_> = relayed.collect().await;
        assert_eq!(lines.len(), 1);
        let body = lines[0].as_ref().unwrap();
        assert!(std::str::from_utf8(body).unwrap().contains("response_too_large"));
    }
}
