#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use serde_json::Value;
use tagcache::cache::{
    Backend, CacheConfig, CacheService, MemoryBackend, Principal, WriteBehind, X_CACHE,
};

pub const PRINCIPAL_HEADER: &str = "x-user";

pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub service: Arc<CacheService>,
    pub writer: WriteBehind,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let service = Arc::new(CacheService::new(
            config,
            Arc::clone(&backend) as Arc<dyn Backend>,
        ));
        let (writer, _handle) = WriteBehind::spawn(Arc::clone(&service), 64);
        Self {
            backend,
            service,
            writer,
        }
    }

    pub async fn settle(&self) {
        assert!(self.writer.flush().await, "write-behind worker should be running");
    }
}

/// Stand-in for an auth layer: trusts the `x-user` header.
pub async fn authenticate(mut request: Request<Body>, next: Next) -> Response {
    let principal = request
        .headers()
        .get(PRINCIPAL_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(Principal::new);
    if let Some(principal) = principal {
        request.extensions_mut().insert(principal);
    }
    next.run(request).await
}

pub fn request(method: Method, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(PRINCIPAL_HEADER, user);
    }
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    builder.body(body).expect("request should build")
}

pub fn x_cache(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(X_CACHE)
        .and_then(|value| value.to_str().ok())
}

pub async fn json_body(response: Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should buffer");
    let value = serde_json::from_slice(&bytes).expect("body should be json");
    (status, value)
}
