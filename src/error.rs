use axum::http::StatusCode;
use thiserror::Error;

/// Terminal outcome of a proxied request, one variant per error kind the
/// gateway reports to clients and records in the request log.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown or inactive API key")]
    PrincipalRejected,
    #[error("gateway saturated, admission timed out")]
    AdmissionTimeout,
    #[error("no upstream key available")]
    NoKeyAvailable,
    #[error("upstream rate limited: {0}")]
    RateLimited(String),
    #[error("upstream server error: {0}")]
    Upstream5xx(String),
    #[error("upstream rejected credential: {0}")]
    AuthRejected(String),
    #[error("upstream request timed out")]
    RequestTimeout,
    #[error("client disconnected mid-stream")]
    ClientDisconnect,
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable kind, used in error bodies and log rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PrincipalRejected => "principal_rejected",
            Self::AdmissionTimeout => "admission_timeout",
            Self::NoKeyAvailable => "no_key_available",
            Self::RateLimited(_) => "rate_limited",
            Self::Upstream5xx(_) => "upstream_5xx",
            Self::AuthRejected(_) => "auth_rejected",
            Self::RequestTimeout => "request_timeout",
            Self::ClientDisconnect => "client_disconnect",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::PrincipalRejected => StatusCode::UNAUTHORIZED,
            // Both are "waited too long for a resource", the same shape
            // as a request timeout.
            Self::AdmissionTimeout | Self::NoKeyAvailable => StatusCode::GATEWAY_TIMEOUT,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream5xx(_) | Self::AuthRejected(_) | Self::MalformedResponse(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            // 499 is the conventional "client closed request" code; axum has
            // no named constant for it.
            Self::ClientDisconnect => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the orchestrator may retry this failure on a different key,
    /// provided nothing has been flushed to the client yet.
    pub fn retryable_pre_byte(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Upstream5xx(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(GatewayError::PrincipalRejected.kind(), "principal_rejected");
        assert_eq!(
            GatewayError::RateLimited("429".to_string()).kind(),
            "rate_limited"
        );
        assert_eq!(GatewayError::ClientDisconnect.kind(), "client_disconnect");
    }

    #[test]
    fn only_rate_limit_and_5xx_are_retryable() {
        assert!(GatewayError::RateLimited(String::new()).retryable_pre_byte());
        assert!(GatewayError::Upstream5xx(String::new()).retryable_pre_byte());
        assert!(!GatewayError::AuthRejected(String::new()).retryable_pre_byte());
        assert!(!GatewayError::RequestTimeout.retryable_pre_byte());
        assert!(!GatewayError::NoKeyAvailable.retryable_pre_byte());
    }

    #[test]
    fn status_codes_match_kinds() {
        assert_eq!(
            GatewayError::PrincipalRejected.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::RateLimited(String::new()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::Upstream5xx(String::new()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::AdmissionTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::NoKeyAvailable.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(GatewayError::RequestTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(GatewayError::ClientDisconnect.status().as_u16(), 499);
    }
}
