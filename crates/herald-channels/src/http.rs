use reqwest::RequestBuilder;
use tracing::debug;

use crate::{
    classify::{classify_http_status, classify_reqwest_error, parse_retry_after},
    format::truncate_content,
    types::SendOutcome,
};

/// Longest slice of an error body kept in the outcome message.
const ERROR_BODY_LIMIT: usize = 200;

/// Send a prepared request and classify the response.
///
/// 2xx is success; anything else becomes a failed outcome carrying the
/// status, a trimmed response body and any `Retry-After` hint.
pub(crate) async fn dispatch(channel: &str, request: RequestBuilder) -> SendOutcome {
    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => return SendOutcome::failed(classify_reqwest_error(&e), e.to_string()),
    };

    let status = response.status();
    if status.is_success() {
        debug!(channel, status = status.as_u16(), "remote accepted message");
        return SendOutcome::delivered();
    }

    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate_content(body.trim(), ERROR_BODY_LIMIT)
        )
    };
    SendOutcome::failed(classify_http_status(status.as_u16()), message).with_retry_after(retry_after)
}
