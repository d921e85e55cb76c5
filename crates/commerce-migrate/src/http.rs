//! HTTP plumbing shared by the REST adapters.

use std::time::Duration;

use reqwest::header::{LINK, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde_json::Value;

use crate::error::{MigrateError, Result};

/// Longest response body excerpt carried into an error message.
const BODY_EXCERPT_LEN: usize = 500;

/// Build a client with a hard per-request timeout.
pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("commerce-migrate/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| MigrateError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Map a transport-level failure onto the error taxonomy.
pub(crate) fn transport_error(operation: &str, e: reqwest::Error) -> MigrateError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        MigrateError::transient(operation, e.to_string())
    } else {
        MigrateError::Api {
            operation: operation.to_string(),
            status: 0,
            message: e.to_string(),
        }
    }
}

/// Classify a non-success status.
pub(crate) fn classify_status(
    operation: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> MigrateError {
    let message = format!("HTTP {}: {}", status.as_u16(), excerpt(body));
    match status {
        StatusCode::TOO_MANY_REQUESTS => MigrateError::TransientApi {
            operation: operation.to_string(),
            message,
            retry_after,
        },
        s if s.is_server_error() => MigrateError::TransientApi {
            operation: operation.to_string(),
            message,
            retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => MigrateError::Auth {
            operation: operation.to_string(),
            message,
        },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            MigrateError::validation(operation, message)
        }
        s => MigrateError::Api {
            operation: operation.to_string(),
            status: s.as_u16(),
            message,
        },
    }
}

/// Check the status and decode the JSON body.
pub(crate) async fn read_json(operation: &str, response: Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(&response);
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(operation, status, retry_after, &body));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_error(operation, e))?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| MigrateError::Api {
        operation: operation.to_string(),
        status: status.as_u16(),
        message: format!("invalid JSON body: {}", e),
    })
}

/// Like [`read_json`], also returning the `rel="next"` URL of a
/// cursor-paginated listing.
pub(crate) async fn read_json_page(
    operation: &str,
    response: Response,
) -> Result<(Value, Option<String>)> {
    let next = response
        .headers()
        .get(LINK)
        .and_then(|v| v.to_str().ok())
        .and_then(next_link);
    let body = read_json(operation, response).await?;
    Ok((body, next))
}

/// Target of the `rel="next"` entry in an RFC 8288 `Link` header.
pub(crate) fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let url = target.strip_prefix('<')?.strip_suffix('>')?;
        let is_next = parts.any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        });
        is_next.then(|| url.to_string())
    })
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    let raw = response.headers().get(RETRY_AFTER)?.to_str().ok()?;
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(BODY_EXCERPT_LEN) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Pull `{wrapper: {id: N}}` out of a create response.
pub(crate) fn created_id(operation: &str, body: &Value, wrapper: &str) -> Result<i64> {
    body.get(wrapper)
        .and_then(|obj| crate::model::extract_id(obj, "id"))
        .ok_or_else(|| MigrateError::Api {
            operation: operation.to_string(),
            status: 200,
            message: format!("response has no {}.id", wrapper),
        })
}
