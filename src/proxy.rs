use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::HeaderMap;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::dialect::{Dialect, SseUsageTracker, TokenUsage};
use crate::error::GatewayError;
use crate::gate::ConcurrencyGate;
use crate::pool::{AcquireError, KeyLease, KeyPool, LeaseOutcome, ReturnClassification};
use crate::store::{now_epoch, RequestLogRecord, Store};
use crate::upstream::UpstreamClient;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

const ERROR_BODY_EXCERPT_BYTES: usize = 512;

pub fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("rotor-{ts_ms}-{seq}")
}

/// One inbound proxy call, already authenticated and parsed by the route.
#[derive(Clone, Debug)]
pub struct ProxyRequest {
    pub dialect: Dialect,
    pub model: String,
    pub stream: bool,
    pub body: Bytes,
    pub principal_alias: String,
}

/// Per-request flow: admission gate, key lease, upstream dispatch,
/// forwarding, lease return, request log. Cloned freely into handlers.
#[derive(Clone)]
pub struct ProxyEngine {
    pub config: Arc<GatewayConfig>,
    pub store: Store,
    pub pool: KeyPool,
    pub gate: ConcurrencyGate,
    pub upstream: UpstreamClient,
}

enum AttemptResult {
    /// Streaming response handed to the client; the lease, the gate permit
    /// and the log write all travel with the stream finalizer.
    Streaming(axum::response::Response),
    /// Buffered response, lease already returned as success.
    Completed {
        response: axum::response::Response,
        usage: Option<TokenUsage>,
        key_identifier: String,
        key_brief: String,
    },
    /// Attempt failed, lease already returned with its classification.
    Failed {
        error: GatewayError,
        key_identifier: String,
        key_brief: String,
    },
}

impl ProxyEngine {
    pub async fn execute(
        &self,
        request: ProxyRequest,
        request_id: &str,
    ) -> Result<axum::response::Response, GatewayError> {
        let intake_time = now_epoch();

        let mut permit = match self.gate.admit().await {
            Ok(permit) => Some(permit),
            Err(error) => {
                self.log_failure(&request, request_id, intake_time, &error)
                    .await;
                return Err(error);
            }
        };

        let lease = match self.pool.acquire().await {
            Ok(lease) => lease,
            Err(AcquireError::NoKeyAvailable) => {
                let error = GatewayError::NoKeyAvailable;
                self.log_failure(&request, request_id, intake_time, &error)
                    .await;
                return Err(error);
            }
            Err(AcquireError::Store(err)) => {
                let error = GatewayError::Internal(err.to_string());
                self.log_failure(&request, request_id, intake_time, &error)
                    .await;
                return Err(error);
            }
        };
        let first_key = lease.identifier().to_string();

        let mut outcome = self
            .attempt(lease, &request, request_id, intake_time, &mut permit)
            .await;

        // One retry on a different key, only while nothing has reached the
        // client. Streaming contracts forbid replay after the first byte.
        if let AttemptResult::Failed { error, .. } = &outcome {
            if error.retryable_pre_byte() {
                match self.pool.try_acquire_excluding(&first_key).await {
                    Ok(retry_lease) => {
                        info!(
                            request_id,
                            retry_key = %retry_lease.brief(),
                            "retrying on a different key"
                        );
                        outcome = self
                            .attempt(retry_lease, &request, request_id, intake_time, &mut permit)
                            .await;
                    }
                    Err(_) => {
                        info!(request_id, "no alternate key available for retry");
                    }
                }
            }
        }

        match outcome {
            AttemptResult::Streaming(response) => Ok(response),
            AttemptResult::Completed {
                response,
                usage,
                key_identifier,
                key_brief,
            } => {
                let record = self.log_row(
                    &request,
                    request_id,
                    intake_time,
                    Some((&key_identifier, &key_brief)),
                    usage,
                    true,
                    None,
                    false,
                );
                self.write_log(record).await;
                Ok(response)
            }
            AttemptResult::Failed {
                error,
                key_identifier,
                key_brief,
            } => {
                let record = self.log_row(
                    &request,
                    request_id,
                    intake_time,
                    Some((&key_identifier, &key_brief)),
                    None,
                    false,
                    Some(error.kind()),
                    false,
                );
                self.write_log(record).await;
                Err(error)
            }
        }
    }

    async fn attempt(
        &self,
        lease: KeyLease,
        request: &ProxyRequest,
        request_id: &str,
        intake_time: f64,
        permit: &mut Option<OwnedSemaphorePermit>,
    ) -> AttemptResult {
        let key_identifier = lease.identifier().to_string();
        let key_brief = lease.brief().to_string();
        let url = request.dialect.upstream_url(
            &self.config.upstream_base_url,
            &request.model,
            request.stream,
        );

        let client = self.upstream.client().await;
        let mut builder = client
            .post(&url)
            .header("content-type", "application/json")
            .body(request.body.clone());
        if request.stream {
            builder = builder.header("accept", "text/event-stream");
        }
        builder = request.dialect.apply_auth(builder, lease.secret());

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                return self
                    .fail_send(lease, err, request_id, key_identifier, key_brief)
                    .await;
            }
        };
        self.upstream.record_success();

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let excerpt = read_error_excerpt(response).await;
            let (error, mut classification) =
                request
                    .dialect
                    .classify_failure(status.as_u16(), &headers, &excerpt);
            // An omitted retry-after falls back to the configured wait.
            if let ReturnClassification::RateLimited { retry_after: None } = classification {
                classification = ReturnClassification::RateLimited {
                    retry_after: Some(self.config.rate_limit_default_wait_seconds),
                };
            }
            warn!(
                request_id,
                key = %key_brief,
                status = status.as_u16(),
                kind = error.kind(),
                "upstream call failed"
            );
            lease.release(LeaseOutcome::Failure(classification)).await;
            return AttemptResult::Failed {
                error,
                key_identifier,
                key_brief,
            };
        }

        if request.stream {
            self.begin_streaming(response, lease, request, request_id, intake_time, permit)
        } else {
            self.finish_buffered(response, lease, request, request_id, key_identifier, key_brief)
                .await
        }
    }

    async fn fail_send(
        &self,
        lease: KeyLease,
        err: reqwest::Error,
        request_id: &str,
        key_identifier: String,
        key_brief: String,
    ) -> AttemptResult {
        let (error, classification) = if err.is_timeout() {
            (
                GatewayError::RequestTimeout,
                ReturnClassification::TransientClientOrNetwork,
            )
        } else {
            self.upstream.record_failure().await;
            (
                GatewayError::Upstream5xx(format!("failed to reach upstream: {err}")),
                ReturnClassification::Upstream5xx,
            )
        };
        warn!(request_id, key = %key_brief, kind = error.kind(), %err, "upstream dispatch error");
        lease.release(LeaseOutcome::Failure(classification)).await;
        AttemptResult::Failed {
            error,
            key_identifier,
            key_brief,
        }
    }

    async fn finish_buffered(
        &self,
        response: reqwest::Response,
        lease: KeyLease,
        request: &ProxyRequest,
        request_id: &str,
        key_identifier: String,
        key_brief: String,
    ) -> AttemptResult {
        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/json")
            .to_string();

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                return self
                    .fail_send(lease, err, request_id, key_identifier, key_brief)
                    .await;
            }
        };

        // Forwarding is byte-transparent; usage extraction is best-effort.
        let usage = serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .and_then(|value| request.dialect.extract_usage(&value));
        lease.release(LeaseOutcome::Success).await;

        let mut http_response = axum::response::Response::new(Body::from(body));
        *http_response.status_mut() = status;
        insert_header(http_response.headers_mut(), "content-type", &content_type);
        insert_header(http_response.headers_mut(), "x-request-id", request_id);
        AttemptResult::Completed {
            response: http_response,
            usage,
            key_identifier,
            key_brief,
        }
    }

    fn begin_streaming(
        &self,
        response: reqwest::Response,
        lease: KeyLease,
        request: &ProxyRequest,
        request_id: &str,
        intake_time: f64,
        permit: &mut Option<OwnedSemaphorePermit>,
    ) -> AttemptResult {
        let status = response.status();
        let upstream: BoxStream<'static, reqwest::Result<Bytes>> =
            response.bytes_stream().boxed();

        let template = self.log_row(
            request,
            request_id,
            intake_time,
            Some((lease.identifier(), lease.brief())),
            None,
            true,
            None,
            true,
        );
        let state = StreamState {
            upstream,
            tracker: SseUsageTracker::new(request.dialect),
            idle_timeout: self.config.stream_idle_timeout(),
            bytes_forwarded: 0,
            finalizer: Some(StreamFinalizer {
                store: self.store.clone(),
                lease: Some(lease),
                template,
                _permit: permit.take(),
            }),
        };

        let stream = futures_util::stream::try_unfold(state, |mut state| async move {
            match tokio::time::timeout(state.idle_timeout, state.upstream.next()).await {
                Err(_elapsed) => {
                    state
                        .finalize(StreamEnd::Errored {
                            error_kind: "request_timeout",
                            classification: ReturnClassification::TransientClientOrNetwork,
                        })
                        .await;
                    Err(std::io::Error::other("upstream idle timeout"))
                }
                Ok(Some(Ok(chunk))) => {
                    state.bytes_forwarded += chunk.len() as u64;
                    state.tracker.ingest(&chunk);
                    Ok(Some((chunk, state)))
                }
                Ok(Some(Err(err))) => {
                    let end = if err.is_timeout() {
                        StreamEnd::Errored {
                            error_kind: "request_timeout",
                            classification: ReturnClassification::TransientClientOrNetwork,
                        }
                    } else {
                        StreamEnd::Errored {
                            error_kind: "malformed_response",
                            classification: ReturnClassification::Upstream5xx,
                        }
                    };
                    state.finalize(end).await;
                    Err(std::io::Error::other(err))
                }
                Ok(None) => {
                    state.finalize(StreamEnd::Completed).await;
                    Ok(None)
                }
            }
        });

        let mut http_response = axum::response::Response::new(Body::from_stream(stream));
        *http_response.status_mut() = status;
        insert_header(
            http_response.headers_mut(),
            "content-type",
            "text/event-stream",
        );
        insert_header(http_response.headers_mut(), "x-request-id", request_id);
        AttemptResult::Streaming(http_response)
    }

    /// Records a request that failed before any key was assigned, or one
    /// rejected at authentication by the route layer.
    pub async fn log_failure(
        &self,
        request: &ProxyRequest,
        request_id: &str,
        intake_time: f64,
        error: &GatewayError,
    ) {
        let record = self.log_row(
            request,
            request_id,
            intake_time,
            None,
            None,
            false,
            Some(error.kind()),
            false,
        );
        self.write_log(record).await;
    }

    #[allow(clippy::too_many_arguments)]
    fn log_row(
        &self,
        request: &ProxyRequest,
        request_id: &str,
        intake_time: f64,
        key: Option<(&str, &str)>,
        usage: Option<TokenUsage>,
        is_success: bool,
        error_kind: Option<&str>,
        streamed: bool,
    ) -> RequestLogRecord {
        let usage = usage.unwrap_or_default();
        RequestLogRecord {
            request_id: request_id.to_string(),
            request_time: intake_time,
            principal_alias: request.principal_alias.clone(),
            key_identifier: key.map(|(identifier, _)| identifier.to_string()).unwrap_or_default(),
            key_brief: key.map(|(_, brief)| brief.to_string()),
            model_name: request.model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            is_success,
            error_kind: error_kind.map(str::to_string),
            dialect: request.dialect.as_str().to_string(),
            streamed,
        }
    }

    async fn write_log(&self, record: RequestLogRecord) {
        if let Err(err) = self.store.insert_request_log(record).await {
            error!(%err, "failed to write request log");
        }
    }
}

#[derive(Clone, Debug)]
enum StreamEnd {
    Completed,
    Aborted,
    Errored {
        error_kind: &'static str,
        classification: ReturnClassification,
    },
}

/// Owns everything a finished (or abandoned) stream must settle: the key
/// lease, the gate permit and the request log row.
struct StreamFinalizer {
    store: Store,
    lease: Option<KeyLease>,
    template: RequestLogRecord,
    _permit: Option<OwnedSemaphorePermit>,
}

impl StreamFinalizer {
    async fn finalize(mut self, usage: Option<TokenUsage>, end: StreamEnd, bytes_forwarded: u64) {
        let outcome = match &end {
            StreamEnd::Completed => LeaseOutcome::Success,
            StreamEnd::Aborted => {
                LeaseOutcome::Failure(ReturnClassification::TransientClientOrNetwork)
            }
            StreamEnd::Errored { classification, .. } => {
                LeaseOutcome::Failure(classification.clone())
            }
        };
        if let Some(lease) = self.lease.take() {
            lease.release(outcome).await;
        }

        let mut record = self.template;
        if let Some(usage) = usage {
            record.prompt_tokens = usage.prompt_tokens;
            record.completion_tokens = usage.completion_tokens;
            record.total_tokens = usage.total_tokens;
        }
        match end {
            StreamEnd::Completed => {
                record.is_success = true;
            }
            StreamEnd::Aborted => {
                // A disconnecting client does not make the request a
                // failure as long as upstream was producing valid chunks.
                record.is_success = bytes_forwarded > 0;
                if !record.is_success {
                    record.error_kind = Some("client_disconnect".to_string());
                }
            }
            StreamEnd::Errored { error_kind, .. } => {
                record.is_success = false;
                record.error_kind = Some(error_kind.to_string());
            }
        }

        if let Err(err) = self.store.insert_request_log(record).await {
            error!(%err, "failed to write streaming request log");
        }
    }
}

struct StreamState {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    tracker: SseUsageTracker,
    idle_timeout: Duration,
    bytes_forwarded: u64,
    finalizer: Option<StreamFinalizer>,
}

impl StreamState {
    async fn finalize(&mut self, end: StreamEnd) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        finalizer
            .finalize(self.tracker.observed(), end, self.bytes_forwarded)
            .await;
    }
}

impl Drop for StreamState {
    fn drop(&mut self) {
        // Reached when the client hangs up and axum drops the body stream
        // mid-flight. Settling is async; hand it to the runtime.
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        let observed = self.tracker.observed();
        let bytes_forwarded = self.bytes_forwarded;
        let settle = async move {
            finalizer
                .finalize(observed, StreamEnd::Aborted, bytes_forwarded)
                .await;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(settle);
            }
            Err(_) => {
                std::thread::spawn(move || {
                    if let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        runtime.block_on(settle);
                    }
                });
            }
        }
    }
}

async fn read_error_excerpt(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let mut excerpt: String = text.chars().take(ERROR_BODY_EXCERPT_BYTES).collect();
            if text.len() > excerpt.len() {
                excerpt.push_str("...");
            }
            excerpt
        }
        Err(_) => String::new(),
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = axum::http::HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_prefixed() {
        let first = generate_request_id();
        let second = generate_request_id();
        assert!(first.starts_with("rotor-"));
        assert_ne!(first, second);
    }
}
