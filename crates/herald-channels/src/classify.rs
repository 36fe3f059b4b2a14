//! Mapping of transport failures onto [`ErrorCode`]s.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::error::ErrorCode;

/// Classify a non-success HTTP status.
pub fn classify_http_status(status: u16) -> ErrorCode {
    match status {
        401 | 403 => ErrorCode::AuthFailed,
        404 => ErrorCode::RecipientNotFound,
        413 => ErrorCode::ContentTooLarge,
        429 => ErrorCode::RateLimited,
        500..=599 => ErrorCode::ServerError,
        _ => ErrorCode::Unknown,
    }
}

/// Keyword classification for backends that only report a message
/// (SMTP relays, notification stores).
pub fn classify_error_message(message: &str) -> ErrorCode {
    let msg = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&["cancel"]) {
        ErrorCode::Cancelled
    } else if has(&["auth", "credential", "535"]) {
        ErrorCode::AuthFailed
    } else if has(&["timeout", "timed out", "deadline"]) {
        ErrorCode::Timeout
    } else if has(&["connection", "connect", "refused", "unreachable", "dns"]) {
        ErrorCode::ConnectionFailed
    } else if has(&["recipient", "mailbox", "no such user", "550"]) {
        ErrorCode::RecipientNotFound
    } else if has(&["rate limit", "too many", "throttl"]) {
        ErrorCode::RateLimited
    } else if has(&["too large", "size limit", "552"]) {
        ErrorCode::ContentTooLarge
    } else {
        ErrorCode::Unknown
    }
}

/// Classify a failed reqwest call that never produced a response.
pub fn classify_reqwest_error(err: &reqwest::Error) -> ErrorCode {
    if err.is_timeout() {
        ErrorCode::Timeout
    } else if err.is_connect() {
        ErrorCode::ConnectionFailed
    } else if err.is_builder() {
        ErrorCode::InvalidConfig
    } else {
        classify_error_message(&err.to_string())
    }
}

/// Parse a `Retry-After` header given in whole seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
