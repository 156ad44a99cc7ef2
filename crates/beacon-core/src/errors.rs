use std::time::Duration;

/// Failure of a single exchange with the collector.
/// Every variant leaves the blob in the ledger; the classification only
/// drives logging, health counters and backoff.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("server returned {status}: {body}")]
    ServerStatus { status: u16, body: String },
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("invalid response ({status}): {detail}")]
    InvalidResponse { status: u16, detail: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Timeout(_)
                | Self::ServerStatus { .. }
                | Self::RateLimited { .. }
                | Self::InvalidResponse { .. }
        )
    }

    /// Status code reported by the server, if the exchange got that far.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ServerStatus { status, .. } | Self::InvalidResponse { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Body or detail string, used for the health tracker's last error message.
    pub fn detail(&self) -> String {
        match self {
            Self::ServerStatus { body, .. } => body.clone(),
            Self::InvalidResponse { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::ServerStatus { .. } => "server_status",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify a non-2xx HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimited { retry_after: None },
            _ => Self::ServerStatus { status, body },
        }
    }
}
