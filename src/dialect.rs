use axum::http::HeaderMap;
use bytes::Bytes;
use serde_json::Value;

use crate::error::GatewayError;
use crate::pool::ReturnClassification;

const MAX_LINE_BYTES: usize = 256 * 1024;
const MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Wire format of an inbound request, selected by the route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Gemini,
    OpenAiChat,
}

/// Token counts reported by the upstream, in either dialect's shape.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAiChat => "openai_chat",
        }
    }

    /// Upstream endpoint for `model`. Streaming Gemini calls ask for SSE
    /// framing explicitly; the OpenAI dialect signals streaming in the
    /// request body instead.
    pub fn upstream_url(self, base_url: &str, model: &str, stream: bool) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            Self::Gemini => {
                if stream {
                    format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
                } else {
                    format!("{base}/v1beta/models/{model}:generateContent")
                }
            }
            Self::OpenAiChat => format!("{base}/v1/chat/completions"),
        }
    }

    /// Injects the leased credential the way the upstream expects it.
    pub fn apply_auth(
        self,
        builder: reqwest::RequestBuilder,
        secret: &str,
    ) -> reqwest::RequestBuilder {
        match self {
            Self::Gemini => builder.header("x-goog-api-key", secret),
            Self::OpenAiChat => builder.header("authorization", format!("Bearer {secret}")),
        }
    }

    /// Maps an upstream error status to the gateway error and the key
    /// return classification. Statuses outside the taxonomy are folded
    /// into the 5xx kind with the true status preserved in the message.
    pub fn classify_failure(
        self,
        status: u16,
        headers: &HeaderMap,
        body_excerpt: &str,
    ) -> (GatewayError, ReturnClassification) {
        let message = if body_excerpt.is_empty() {
            format!("upstream returned status {status}")
        } else {
            format!("upstream returned status {status}: {body_excerpt}")
        };
        match status {
            429 => (
                GatewayError::RateLimited(message),
                ReturnClassification::RateLimited {
                    retry_after: parse_retry_after(headers),
                },
            ),
            401 | 403 => (
                GatewayError::AuthRejected(message),
                ReturnClassification::AuthRejected,
            ),
            _ => (
                GatewayError::Upstream5xx(message),
                ReturnClassification::Upstream5xx,
            ),
        }
    }

    /// Pulls token counts out of a complete response document or a single
    /// streamed chunk document.
    pub fn extract_usage(self, value: &Value) -> Option<TokenUsage> {
        match self {
            Self::Gemini => {
                let usage = value.get("usageMetadata")?.as_object()?;
                let prompt_tokens = usage.get("promptTokenCount").and_then(Value::as_u64);
                let completion_tokens =
                    usage.get("candidatesTokenCount").and_then(Value::as_u64);
                let total_tokens = usage
                    .get("totalTokenCount")
                    .and_then(Value::as_u64)
                    .or_else(|| sum_tokens(prompt_tokens, completion_tokens));
                Some(TokenUsage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens,
                })
            }
            Self::OpenAiChat => {
                let usage = value.get("usage")?.as_object()?;
                let prompt_tokens = usage
                    .get("prompt_tokens")
                    .or_else(|| usage.get("input_tokens"))
                    .and_then(Value::as_u64);
                let completion_tokens = usage
                    .get("completion_tokens")
                    .or_else(|| usage.get("output_tokens"))
                    .and_then(Value::as_u64);
                let total_tokens = usage
                    .get("total_tokens")
                    .and_then(Value::as_u64)
                    .or_else(|| sum_tokens(prompt_tokens, completion_tokens));
                Some(TokenUsage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens,
                })
            }
        }
    }
}

fn sum_tokens(prompt: Option<u64>, completion: Option<u64>) -> Option<u64> {
    match (prompt, completion) {
        (Some(prompt), Some(completion)) => Some(prompt.saturating_add(completion)),
        _ => None,
    }
}

pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

/// Watches SSE frames as they pass through the gateway and remembers the
/// most recent usage block. Forwarding never waits on this: chunks are
/// ingested after they have been handed to the client, and anything that
/// fails to parse is simply skipped.
///
/// Incoming bytes are assembled into lines; `data:` fields accumulate
/// until a blank line closes the event. A line or event over its byte
/// limit poisons the event in progress, so a misbehaving upstream cannot
/// grow the tracker without bound.
#[derive(Debug)]
pub struct SseUsageTracker {
    dialect: Dialect,
    line: Vec<u8>,
    event_data: String,
    oversized: bool,
    observed: Option<TokenUsage>,
}

impl SseUsageTracker {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            line: Vec::new(),
            event_data: String::new(),
            oversized: false,
            observed: None,
        }
    }

    pub fn ingest(&mut self, chunk: &Bytes) {
        let mut rest: &[u8] = chunk.as_ref();
        while let Some(newline) = rest.iter().position(|&byte| byte == b'\n') {
            let (head, tail) = rest.split_at(newline);
            self.push_line_bytes(head);
            self.finish_line();
            rest = &tail[1..];
        }
        self.push_line_bytes(rest);
    }

    fn push_line_bytes(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.line.len().saturating_add(bytes.len()) > MAX_LINE_BYTES {
            self.line.clear();
            self.oversized = true;
            return;
        }
        self.line.extend_from_slice(bytes);
    }

    fn finish_line(&mut self) {
        let mut line = std::mem::take(&mut self.line);
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        if line.is_empty() {
            // Blank line: the event is complete.
            let payload = std::mem::take(&mut self.event_data);
            let poisoned = std::mem::replace(&mut self.oversized, false);
            if !poisoned {
                self.scan_event(payload.trim());
            }
            return;
        }
        if self.oversized {
            return;
        }

        let Ok(text) = std::str::from_utf8(&line) else {
            return;
        };
        if let Some(field) = text.strip_prefix("data:") {
            let field = field.trim_start();
            if self
                .event_data
                .len()
                .saturating_add(field.len())
                > MAX_EVENT_BYTES
            {
                self.event_data.clear();
                self.oversized = true;
                return;
            }
            if !self.event_data.is_empty() {
                self.event_data.push('\n');
            }
            self.event_data.push_str(field);
        }
    }

    fn scan_event(&mut self, payload: &str) {
        if payload.is_empty() || payload == "[DONE]" || !payload.starts_with('{') {
            return;
        }
        if let Ok(value) = serde_json::from_str::<Value>(payload) {
            if let Some(usage) = self.dialect.extract_usage(&value) {
                self.observed = Some(usage);
            }
        }
    }

    /// Last usage block observed so far; the final one in the stream is
    /// the authoritative count for the request log.
    pub fn observed(&self) -> Option<TokenUsage> {
        self.observed
    }
}
