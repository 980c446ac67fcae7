use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Markers the upstream puts in its throttle page. It is sometimes served
/// with a 200 status, so the body has to be checked as well.
pub const RATE_LIMIT_MARKERS: &[&str] = &["Too Many Requests", "429 Too Many Requests"];

/// Result of a single fetch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FetchOutcome {
    Success {
        content: String,
        fetched_at: DateTime<Utc>,
    },
    NotFound,
    RateLimited,
    ServerError(u16),
    NetworkError(String),
    Timeout,
}

impl FetchOutcome {
    pub fn success(content: String) -> Self {
        FetchOutcome::Success {
            content,
            fetched_at: Utc::now(),
        }
    }

    /// Classify an HTTP response from its status code and body.
    pub fn from_response(status: u16, body: String) -> Self {
        match status {
            404 | 410 => FetchOutcome::NotFound,
            429 => FetchOutcome::RateLimited,
            500..=599 => FetchOutcome::ServerError(status),
            200..=299 if is_rate_limited_body(&body) => FetchOutcome::RateLimited,
            200..=299 => FetchOutcome::success(body),
            // Anything else (3xx that was not followed, odd 4xx) is treated as
            // a transport problem so the schedule gets another go at it.
            other => FetchOutcome::NetworkError(format!("unexpected status {}", other)),
        }
    }

    /// Whether another attempt may change the result.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchOutcome::RateLimited
                | FetchOutcome::ServerError(_)
                | FetchOutcome::NetworkError(_)
                | FetchOutcome::Timeout
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success { .. } => "success",
            FetchOutcome::NotFound => "not_found",
            FetchOutcome::RateLimited => "rate_limited",
            FetchOutcome::ServerError(_) => "server_error",
            FetchOutcome::NetworkError(_) => "network_error",
            FetchOutcome::Timeout => "timeout",
        }
    }
}

pub fn is_rate_limited_body(body: &str) -> bool {
    RATE_LIMIT_MARKERS.iter().any(|marker| body.contains(marker))
}

/// Terminal result of a fetch once the retry schedule has been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Success {
        content: String,
        fetched_at: DateTime<Utc>,
    },
    NotFound,
    /// Retry budget exhausted; holds the last attempt's outcome.
    Failed(FetchOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchReport {
    pub result: FetchResult,
    pub attempts: u32,
}

impl FetchReport {
    pub fn is_success(&self) -> bool {
        matches!(self.result, FetchResult::Success { .. })
    }
}
