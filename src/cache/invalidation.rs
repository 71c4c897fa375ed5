//! Invalidation middleware for mutating routes.
//!
//! Runs after the handler. Only a 2xx status counts as a successful mutation;
//! the purge is awaited before the response is returned so the caller's next
//! read observes its own write.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{RawPathParams, State, rejection::RawPathParamsRejection},
    http::{Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::interceptor::{Buffered, buffer_within};
use super::keys::parse_query;
use super::middleware::path_params;
use super::route::{InvalidationRoute, MutationRequest, MutationResponse, Principal};
use super::service::CacheService;

const TARGET: &str = "tagcache::cache::invalidation";

#[derive(Clone)]
pub struct InvalidationState {
    pub service: Arc<CacheService>,
    pub route: Arc<InvalidationRoute>,
}

impl InvalidationState {
    pub fn new(service: Arc<CacheService>, route: InvalidationRoute) -> Self {
        Self {
            service,
            route: Arc::new(route),
        }
    }
}

fn is_read(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

fn parse_json(bytes: &Bytes, limit: usize) -> Value {
    if bytes.is_empty() || bytes.len() > limit {
        return Value::Null;
    }
    serde_json::from_slice(bytes).unwrap_or(Value::Null)
}

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn invalidation_layer(
    State(state): State<InvalidationState>,
    params: Result<RawPathParams, RawPathParamsRejection>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if is_read(request.method()) || !state.service.is_enabled() || state.route.is_skipped() {
        return next.run(request).await;
    }
    let limit = state.service.config().body_limit_bytes;

    let (parts, body) = request.into_parts();
    // An oversized payload still reaches the handler; it just goes unparsed.
    let (payload, body) = match buffer_within(body, limit).await {
        Ok(Buffered::Complete(bytes)) => (parse_json(&bytes, limit), Body::from(bytes)),
        Ok(Buffered::Overflow(body)) => (Value::Null, body),
        Err(error) => {
            warn!(target = TARGET, error = %error, "Failed to read request body");
            return (StatusCode::BAD_REQUEST, "request body could not be read").into_response();
        }
    };
    let mutation_request = MutationRequest {
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        path_params: path_params(params),
        query: parse_query(parts.uri.query()),
        payload,
        principal: parts.extensions.get::<Principal>().cloned(),
    };

    let response = next.run(Request::from_parts(parts, body)).await;
    if !response.status().is_success() {
        return response;
    }

    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("json"));
    let (response, body) = if is_json {
        let (parts, body) = response.into_parts();
        match buffer_within(body, limit).await {
            Ok(Buffered::Complete(bytes)) => {
                let value = parse_json(&bytes, limit);
                (Response::from_parts(parts, Body::from(bytes)), value)
            }
            Ok(Buffered::Overflow(body)) => (Response::from_parts(parts, body), Value::Null),
            Err(error) => {
                warn!(target = TARGET, error = %error, "Failed to buffer response body");
                (Response::from_parts(parts, Body::empty()), Value::Null)
            }
        }
    } else {
        (response, Value::Null)
    };

    let mutation_response = MutationResponse {
        status: response.status(),
        body,
    };
    let plan = state.route.plan(&mutation_request, &mutation_response);
    if plan.tags.is_empty() {
        return response;
    }

    let invalidated = state.service.invalidate(&plan.tags).await;
    info!(
        target = TARGET,
        mutation = plan.mutation.map(|mutation| mutation.as_str()),
        tags = plan.tags.len(),
        invalidated,
        "Mutation invalidated cache"
    );
    response
}
