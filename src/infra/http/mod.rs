//! Operational HTTP surface for the cache.

mod middleware;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheService, StatsSnapshot, Tag, WriteBehind};

pub use middleware::{RequestContext, log_responses, set_request_context};

#[derive(Clone)]
pub struct AdminState {
    pub service: Arc<CacheService>,
    pub writer: Option<WriteBehind>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub enabled: bool,
    pub available: bool,
    pub prefix: String,
    pub write_dropped: u64,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub tags: Vec<Tag>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub tags: Vec<Tag>,
    pub invalidated: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagMembersResponse {
    pub tag: Tag,
    pub keys: Vec<String>,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/_cache/stats", get(cache_stats))
        .route("/_cache/invalidate", post(invalidate_tags))
        .route("/_cache/tags/{tag}", get(tag_members))
        .route("/_health/cache", get(cache_health))
        .with_state(state)
        .layer(from_fn(log_responses))
        .layer(from_fn(set_request_context))
}

async fn cache_stats(State(state): State<AdminState>) -> Json<StatsResponse> {
    let service = &state.service;
    Json(StatsResponse {
        enabled: service.is_enabled(),
        available: service.store().is_available(),
        prefix: service.keys().prefix().to_string(),
        write_dropped: state.writer.as_ref().map_or(0, WriteBehind::dropped),
        stats: service.stats().snapshot(),
    })
}

async fn invalidate_tags(
    State(state): State<AdminState>,
    Json(request): Json<InvalidateRequest>,
) -> Response {
    if request.tags.is_empty() {
        return (StatusCode::BAD_REQUEST, "at least one tag is required").into_response();
    }
    let invalidated = state.service.invalidate(&request.tags).await;
    Json(InvalidateResponse {
        tags: request.tags,
        invalidated,
    })
    .into_response()
}

async fn tag_members(
    State(state): State<AdminState>,
    Path(tag): Path<String>,
) -> Json<TagMembersResponse> {
    let tag = Tag::new(tag);
    let keys = state.service.members_of(&tag).await;
    Json(TagMembersResponse { tag, keys })
}

async fn cache_health(State(state): State<AdminState>) -> StatusCode {
    if !state.service.is_enabled() {
        return StatusCode::NO_CONTENT;
    }
    if state.service.store().probe().await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::cache::{Backend, CacheConfig, MemoryBackend};

    fn state() -> (Arc<MemoryBackend>, AdminState) {
        let backend = Arc::new(MemoryBackend::new());
        let service = Arc::new(CacheService::new(
            CacheConfig::default(),
            Arc::clone(&backend) as Arc<dyn Backend>,
        ));
        (
            backend,
            AdminState {
                service,
                writer: None,
            },
        )
    }

    #[tokio::test]
    async fn invalidate_endpoint_purges_tags() {
        let (_, state) = state();
        state
            .service
            .set("app:card:c1", &json!({ "id": "c1" }), Duration::from_secs(60), &[Tag::class("Card")])
            .await;

        let response = build_admin_router(state.clone())
            .oneshot(
                Request::post("/_cache/invalidate")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"tags":["Card"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: InvalidateResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.invalidated, 1);
        assert!(!state.service.exists("app:card:c1").await);
    }

    #[tokio::test]
    async fn empty_invalidation_is_rejected() {
        let (_, state) = state();
        let response = build_admin_router(state)
            .oneshot(
                Request::post("/_cache/invalidate")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"tags":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tag_members_and_stats() {
        let (_, state) = state();
        state
            .service
            .set("app:card:c1", &json!({ "id": "c1" }), Duration::from_secs(60), &[Tag::instance("Overview", "c1")])
            .await;

        let router = build_admin_router(state);
        let response = router
            .clone()
            .oneshot(Request::get("/_cache/tags/Overview:c1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let members: TagMembersResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(members.keys, vec!["app:card:c1".to_string()]);

        let response = router
            .oneshot(Request::get("/_cache/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["enabled"], json!(true));
        assert_eq!(stats["stats"]["sets"], json!(1));
    }

    #[tokio::test]
    async fn health_reflects_store_reachability() {
        let (backend, state) = state();
        let router = build_admin_router(state);
        let health = |router: Router| async move {
            router
                .oneshot(Request::get("/_health/cache").body(Body::empty()).unwrap())
                .await
                .unwrap()
                .status()
        };

        assert_eq!(health(router.clone()).await, StatusCode::NO_CONTENT);
        backend.set_reachable(false);
        assert_eq!(health(router).await, StatusCode::SERVICE_UNAVAILABLE);
    }
}
