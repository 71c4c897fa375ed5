//! Response cache middleware.
//!
//! Serves GET requests from the shared store when possible. On a miss the
//! handler runs, the emitted response is captured through a
//! [`ResponseInterceptor`] and handed to the write-behind worker; the client
//! never waits for the store write.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    extract::{RawPathParams, State, rejection::RawPathParamsRejection},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use tracing::{debug, instrument};

use super::entry::{CachedResponse, X_CACHE, X_CACHE_KEY};
use super::interceptor::{ResponseInterceptor, intercept};
use super::keys::parse_query;
use super::lock::mutex_lock;
use super::route::{CacheRoute, Principal};
use super::service::CacheService;
use super::writeback::{PersistJob, WriteBehind};

const SOURCE: &str = "cache::middleware";

/// State for one cached read route.
#[derive(Clone)]
pub struct ResponseCacheState {
    pub service: Arc<CacheService>,
    pub writer: WriteBehind,
    pub route: Arc<CacheRoute>,
}

impl ResponseCacheState {
    pub fn new(service: Arc<CacheService>, writer: WriteBehind, route: CacheRoute) -> Self {
        Self {
            service,
            writer,
            route: Arc::new(route),
        }
    }
}

/// Keeps the first cacheable response seen.
#[derive(Default)]
struct Capture {
    slot: Mutex<Option<CachedResponse>>,
}

impl ResponseInterceptor for Capture {
    fn on_before_send(&self, status: StatusCode, headers: &HeaderMap, body: &Bytes) {
        let Some(cached) = CachedResponse::from_parts(status, headers, body) else {
            return;
        };
        if cached.is_cacheable() {
            mutex_lock(&self.slot, SOURCE, "capture").get_or_insert(cached);
        }
    }
}

impl Capture {
    fn take(&self) -> Option<CachedResponse> {
        mutex_lock(&self.slot, SOURCE, "take").take()
    }
}

pub(crate) fn path_params(params: Result<RawPathParams, RawPathParamsRejection>) -> BTreeMap<String, String> {
    params
        .map(|params| {
            params
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(state): State<ResponseCacheState>,
    params: Result<RawPathParams, RawPathParamsRejection>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let service = &state.service;
    if request.method() != Method::GET || !service.is_enabled() || state.route.is_skipped() {
        return next.run(request).await;
    }

    let principal = request.extensions().get::<Principal>().cloned();
    let path_params = path_params(params);
    let query = parse_query(request.uri().query());

    let Some(resolved) = state.route.resolve(
        service.keys(),
        service.config(),
        request.uri().path(),
        &path_params,
        &query,
        principal.as_ref(),
    ) else {
        debug!(outcome = "bypass", "request not cacheable");
        return next.run(request).await;
    };

    if let Some(cached) = service.get::<CachedResponse>(&resolved.key).await {
        return cached.into_response(&resolved.key);
    }

    let response = next.run(request).await;
    let capture = Capture::default();
    let mut response = intercept(response, service.config().body_limit_bytes, &capture).await;

    if let Some(cached) = capture.take() {
        let tags = state
            .route
            .derive_tags(&path_params, &query, principal.as_ref(), &cached.body);
        state
            .writer
            .submit(PersistJob::new(resolved.key.clone(), cached, resolved.ttl, tags));
    }

    let headers = response.headers_mut();
    headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
    if let Ok(value) = HeaderValue::from_str(&resolved.key) {
        headers.insert(X_CACHE_KEY, value);
    }
    response
}
