// Response classification for the resilient client

use crate::error::{excerpt, ExternalError};
use crate::port::{RawResponse, TransportError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// 401: refresh once, then retry
    Unauthorized,
    /// 429 or 5xx
    Transient,
    /// Everything else
    Permanent,
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        401 => StatusClass::Unauthorized,
        429 | 500..=599 => StatusClass::Transient,
        _ => StatusClass::Permanent,
    }
}

/// Parse a Retry-After header: delta-seconds or an HTTP date.
/// A date in the past yields zero.
pub fn parse_retry_after(value: &str, now_millis: i64) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait_ms = (at.timestamp_millis() - now_millis).max(0);
    Some(Duration::from_millis(wait_ms as u64))
}

/// Best-effort human message from an error body
fn error_message(response: &RawResponse) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(&response.body).ok();
    let from_body = parsed.as_ref().and_then(|body| {
        body.pointer("/errors/0/message")
            .or_else(|| body.get("message"))
            .or_else(|| body.get("error_description"))
            .or_else(|| body.get("error"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    });
    from_body.unwrap_or_else(|| format!("HTTP {}", response.status))
}

fn raw_body(response: &RawResponse) -> Option<String> {
    if response.body.is_empty() {
        None
    } else {
        Some(excerpt(&response.body))
    }
}

/// Error for a non-success response, with the server's Retry-After if it sent one
pub fn error_from_response(
    response: &RawResponse,
    now_millis: i64,
) -> (ExternalError, Option<Duration>) {
    let raw = raw_body(response);
    match classify_status(response.status) {
        StatusClass::Unauthorized => (ExternalError::AuthExpired { raw }, None),
        StatusClass::Transient => {
            let retry_after = response
                .header("retry-after")
                .and_then(|v| parse_retry_after(v, now_millis));
            (
                ExternalError::Transient {
                    status: Some(response.status),
                    message: error_message(response),
                    raw,
                },
                retry_after,
            )
        }
        StatusClass::Success | StatusClass::Permanent => (
            ExternalError::Permanent {
                status: response.status,
                message: error_message(response),
                raw,
            },
            None,
        ),
    }
}

/// No response at all is always transient
pub fn error_from_transport(err: &TransportError) -> ExternalError {
    ExternalError::Transient {
        status: None,
        message: err.to_string(),
        raw: None,
    }
}
