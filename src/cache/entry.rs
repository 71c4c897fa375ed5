//! Stored response envelope.

use std::collections::BTreeMap;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const X_CACHE: &str = "x-cache";
pub const X_CACHE_KEY: &str = "x-cache-key";

/// Headers never persisted: recomputed on replay, per-connection, or per-user.
const SKIPPED_HEADERS: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "connection",
    "set-cookie",
    X_CACHE,
    X_CACHE_KEY,
];

/// Validators that would let a client revalidate against a body we no longer own.
const STRIPPED_ON_HIT: &[&str] = &["etag", "last-modified"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl CachedResponse {
    /// Capture an emitted response. Returns `None` when the body cannot be
    /// represented (non-UTF-8 and not JSON).
    pub fn from_parts(status: StatusCode, headers: &HeaderMap, body: &Bytes) -> Option<Self> {
        let headers: BTreeMap<String, String> = headers
            .iter()
            .filter(|(name, _)| !SKIPPED_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        let body = if body.is_empty() {
            Value::Null
        } else if is_json(headers.get("content-type").map(String::as_str)) {
            match serde_json::from_slice(body) {
                Ok(value) => value,
                Err(_) => Value::String(std::str::from_utf8(body).ok()?.to_string()),
            }
        } else {
            Value::String(std::str::from_utf8(body).ok()?.to_string())
        };

        Some(Self {
            status_code: status.as_u16(),
            headers,
            body,
        })
    }

    /// 2xx with a body that is neither empty nor an error payload.
    pub fn is_cacheable(&self) -> bool {
        (200..300).contains(&self.status_code) && !is_error_body(&self.body)
    }

    fn body_bytes(&self) -> Bytes {
        match &self.body {
            Value::String(text) if !is_json(self.headers.get("content-type").map(String::as_str)) => {
                Bytes::from(text.clone())
            }
            value => serde_json::to_vec(value).map(Bytes::from).unwrap_or_default(),
        }
    }

    /// Rebuild the response for a cache hit.
    pub fn into_response(self, key: &str) -> Response {
        let body = self.body_bytes();
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK);

        let mut builder = Response::builder().status(status);
        for (name, value) in &self.headers {
            if STRIPPED_ON_HIT.contains(&name.as_str()) {
                continue;
            }
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            if let Ok(value) = HeaderValue::from_str(value) {
                builder = builder.header(name, value);
            }
        }
        builder = builder.header(X_CACHE, "HIT");
        if let Ok(value) = HeaderValue::from_str(key) {
            builder = builder.header(X_CACHE_KEY, value);
        }

        builder
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Cheap pre-check before buffering a response body.
pub fn should_capture(status: StatusCode, headers: &HeaderMap) -> bool {
    if !status.is_success() || headers.contains_key(header::SET_COOKIE) {
        return false;
    }
    !headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|value| {
        let mime = value.split(';').next().unwrap_or_default().trim();
        mime == "application/json" || mime.ends_with("+json")
    })
}

fn is_error_body(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Object(map) => {
            map.contains_key("error") || map.get("success") == Some(&Value::Bool(false))
        }
        _ => false,
    }
}
