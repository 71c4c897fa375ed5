//! Response interception: observe the final status, headers and body of a
//! response exactly once, without changing what the client receives.

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode, header},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use tracing::warn;

use super::entry::should_capture;

pub trait ResponseInterceptor: Send + Sync {
    fn on_before_send(&self, status: StatusCode, headers: &HeaderMap, body: &Bytes);
}

impl<F> ResponseInterceptor for F
where
    F: Fn(StatusCode, &HeaderMap, &Bytes) + Send + Sync,
{
    fn on_before_send(&self, status: StatusCode, headers: &HeaderMap, body: &Bytes) {
        self(status, headers, body)
    }
}

/// A body read against a byte limit.
pub(crate) enum Buffered {
    /// The whole body, no longer than the limit.
    Complete(Bytes),
    /// The body ran past the limit. Replays the bytes already read, then
    /// streams the remainder untouched.
    Overflow(Body),
}

/// Read `body` frame by frame, holding at most `limit` bytes (plus the frame
/// that crossed it) in memory.
pub(crate) async fn buffer_within(mut body: Body, limit: usize) -> Result<Buffered, axum::Error> {
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;

    while let Some(frame) = body.frame().await {
        let Ok(chunk) = frame?.into_data() else {
            continue;
        };
        if chunk.is_empty() {
            continue;
        }
        total = total.saturating_add(chunk.len());
        chunks.push(chunk);
        if total > limit {
            let head = stream::iter(chunks.into_iter().map(Ok::<Bytes, axum::Error>));
            return Ok(Buffered::Overflow(Body::from_stream(
                head.chain(body.into_data_stream()),
            )));
        }
    }

    Ok(Buffered::Complete(match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.swap_remove(0),
        _ => {
            let mut joined = BytesMut::with_capacity(total);
            for chunk in &chunks {
                joined.extend_from_slice(chunk);
            }
            joined.freeze()
        }
    }))
}

/// Buffer `response` and hand it to `interceptor`, then rebuild it unchanged.
///
/// Responses that can never be cached (non-2xx, cookies, event streams, or a
/// body above `limit`) reach the client without the interceptor seeing them.
/// Oversized bodies are never held in memory whole.
pub async fn intercept<I>(response: Response, limit: usize, interceptor: &I) -> Response
where
    I: ResponseInterceptor + ?Sized,
{
    let oversized = declared_len(response.headers()).is_some_and(|len| len > limit);
    if oversized || !should_capture(response.status(), response.headers()) {
        return response;
    }

    let (parts, body) = response.into_parts();
    match buffer_within(body, limit).await {
        Ok(Buffered::Complete(bytes)) => {
            interceptor.on_before_send(parts.status, &parts.headers, &bytes);
            Response::from_parts(parts, Body::from(bytes))
        }
        Ok(Buffered::Overflow(body)) => Response::from_parts(parts, body),
        Err(error) => {
            warn!(
                target = "tagcache::cache::interceptor",
                error = %error,
                "Failed to buffer response body"
            );
            let mut rebuilt = Response::from_parts(parts, Body::empty());
            *rebuilt.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            rebuilt
        }
    }
}

fn declared_len(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}
