mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, Bytes, to_bytes},
    extract::Path,
    http::{Method, Request, StatusCode},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, patch, post},
};
use futures::stream;
use serde_json::{Value, json};
use tagcache::cache::{
    CacheConfig, CacheRoute, InvalidationRoute, InvalidationState, Mutation, ResponseCacheState,
    Tag, invalidation_layer, response_cache_layer, rules::class,
};
use tower::ServiceExt;

use common::{Harness, authenticate, request, x_cache};

fn app(harness: &Harness) -> Router {
    let read = |route: CacheRoute| {
        from_fn_with_state(
            ResponseCacheState::new(
                Arc::clone(&harness.service),
                harness.writer.clone(),
                route,
            ),
            response_cache_layer,
        )
    };
    let write = |route: InvalidationRoute| {
        from_fn_with_state(
            InvalidationState::new(Arc::clone(&harness.service), route),
            invalidation_layer,
        )
    };

    let card_reads = CacheRoute::new("card")
        .identifier("id")
        .tag_path_param(class::OVERVIEW, "id");
    let quiz_reads = CacheRoute::new("quiz")
        .identifier("id")
        .tag_path_param(class::QUIZ, "id");
    let category_reads = CacheRoute::new("category")
        .identifier("category")
        .tag_path_param(class::CATEGORY, "category");

    let card_writes = InvalidationRoute::new().operation(Mutation::CardUpdated);
    let rejecting_writes = InvalidationRoute::new().operation(Mutation::CardDeleted);
    let tagging_writes = InvalidationRoute::new()
        .tag(class::CARD)
        .tags_from(|_, response| {
            response.body["category"]
                .as_str()
                .map(|category| vec![Tag::instance(class::CATEGORY, category)])
                .unwrap_or_default()
        });

    Router::new()
        .route(
            "/cards/{id}",
            get(|Path(id): Path<String>| async move {
                Json(json!({"id": id, "title": "Fractions"}))
            })
            .layer(read(card_reads))
            .merge(
                patch(|Path(id): Path<String>, Json(payload): Json<Value>| async move {
                    Json(json!({"id": id, "updated": payload}))
                })
                .layer(write(card_writes)),
            )
            .merge(
                axum::routing::delete(|| async {
                    (StatusCode::CONFLICT, Json(json!({"error": "card is shared"})))
                })
                .layer(write(rejecting_writes)),
            ),
        )
        .route(
            "/cards/{id}/quiz",
            get(|Path(id): Path<String>| async move {
                Json(json!({"card": id, "questions": 3}))
            })
            .layer(read(quiz_reads)),
        )
        .route(
            "/categories/{category}",
            get(|Path(category): Path<String>| async move {
                Json(json!({"category": category, "cards": ["c1"]}))
            })
            .layer(read(category_reads)),
        )
        .route(
            "/cards",
            post(|Json(payload): Json<Value>| async move {
                (
                    StatusCode::CREATED,
                    Json(json!({"id": "c9", "category": payload["category"]})),
                )
            })
            .layer(write(tagging_writes)),
        )
        .layer(from_fn(authenticate))
}

async fn warm(app: &Router, harness: &Harness, uris: &[&str]) {
    for uri in uris {
        app.clone()
            .oneshot(request(Method::GET, uri, None, None))
            .await
            .expect("router should respond");
    }
    harness.settle().await;
}

async fn cache_state(app: &Router, uri: &str) -> Option<String> {
    let response = app
        .clone()
        .oneshot(request(Method::GET, uri, None, None))
        .await
        .expect("router should respond");
    x_cache(&response).map(str::to_string)
}

#[tokio::test]
async fn quiz_edit_invalidates_only_the_quiz_region_and_aggregates() {
    let harness = Harness::new();
    let app = app(&harness);
    warm(&app, &harness, &["/cards/c1", "/cards/c1/quiz", "/categories/Math"]).await;

    let response = app
        .clone()
        .oneshot(request(
            Method::PATCH,
            "/cards/c1",
            Some("u1"),
            Some(json!({"options": ["a", "b"]})),
        ))
        .await
        .expect("router should respond");
    assert_eq!(response.status(), StatusCode::OK);

    // Invalidation is awaited, so the very next read already misses.
    assert_eq!(cache_state(&app, "/cards/c1").await.as_deref(), Some("MISS"));
    assert_eq!(cache_state(&app, "/cards/c1/quiz").await.as_deref(), Some("MISS"));
    assert_eq!(cache_state(&app, "/categories/Math").await.as_deref(), Some("HIT"));
}

#[tokio::test]
async fn category_edit_reaches_category_listings() {
    let harness = Harness::new();
    let app = app(&harness);
    warm(&app, &harness, &["/cards/c1/quiz", "/categories/Math"]).await;

    app.clone()
        .oneshot(request(
            Method::PATCH,
            "/cards/c1",
            Some("u1"),
            Some(json!({"category": "Science"})),
        ))
        .await
        .expect("router should respond");

    assert_eq!(cache_state(&app, "/categories/Math").await.as_deref(), Some("MISS"));
    assert_eq!(cache_state(&app, "/cards/c1/quiz").await.as_deref(), Some("HIT"));
}

#[tokio::test]
async fn failed_mutation_leaves_the_cache_alone() {
    let harness = Harness::new();
    let app = app(&harness);
    warm(&app, &harness, &["/cards/c1", "/categories/Math"]).await;

    let response = app
        .clone()
        .oneshot(request(Method::DELETE, "/cards/c1", Some("u1"), None))
        .await
        .expect("router should respond");
    assert_eq!(response.status(), StatusCode::CONFLICT);

    assert_eq!(cache_state(&app, "/cards/c1").await.as_deref(), Some("HIT"));
    assert_eq!(cache_state(&app, "/categories/Math").await.as_deref(), Some("HIT"));
}

#[tokio::test]
async fn dynamic_tags_come_from_the_response_body() {
    let harness = Harness::new();
    let app = app(&harness);
    warm(&app, &harness, &["/categories/Math", "/categories/Art"]).await;

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/cards",
            Some("u1"),
            Some(json!({"title": "Shapes", "category": "Math"})),
        ))
        .await
        .expect("router should respond");
    assert_eq!(response.status(), StatusCode::CREATED);

    assert_eq!(cache_state(&app, "/categories/Math").await.as_deref(), Some("MISS"));
    assert_eq!(cache_state(&app, "/categories/Art").await.as_deref(), Some("HIT"));
}

#[tokio::test]
async fn handler_still_sees_the_request_body() {
    let harness = Harness::new();
    let app = app(&harness);

    let response = app
        .oneshot(request(
            Method::PATCH,
            "/cards/c1",
            None,
            Some(json!({"title": "Renamed"})),
        ))
        .await
        .expect("router should respond");
    let (status, body) = common::json_body(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"]["title"], "Renamed");
}

#[tokio::test]
async fn unreachable_store_does_not_affect_mutations() {
    let harness = Harness::new();
    let app = app(&harness);
    harness.backend.set_reachable(false);

    let response = app
        .oneshot(request(
            Method::PATCH,
            "/cards/c1",
            Some("u1"),
            Some(json!({"quiz": []})),
        ))
        .await
        .expect("router should respond");
    assert_eq!(response.status(), StatusCode::OK);
}

/// A write route whose handler counts calls and echoes the body length.
fn uploads_app(harness: &Harness, calls: Arc<AtomicUsize>) -> Router {
    Router::new().route(
        "/uploads",
        post(move |body: Bytes| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Json(json!({"received": body.len()}))
            }
        })
        .layer(from_fn_with_state(
            InvalidationState::new(
                Arc::clone(&harness.service),
                InvalidationRoute::new().tag(class::CARD),
            ),
            invalidation_layer,
        )),
    )
}

#[tokio::test]
async fn unreadable_request_body_is_rejected_before_the_handler() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let app = uploads_app(&harness, Arc::clone(&calls));

    let body = Body::from_stream(stream::iter(vec![
        Ok(Bytes::from_static(b"{\"title\":")),
        Err(std::io::Error::other("connection reset")),
    ]));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/uploads")
        .header("content-type", "application/json")
        .body(body)
        .expect("request should build");

    let response = app.oneshot(request).await.expect("router should respond");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn oversized_request_body_reaches_the_handler_intact() {
    let harness = Harness::with_config(CacheConfig {
        body_limit_bytes: 16,
        ..CacheConfig::default()
    });
    harness
        .service
        .set("app:card:c1", &json!({"id": "c1"}), Duration::from_secs(60), &[Tag::class(class::CARD)])
        .await;
    let calls = Arc::new(AtomicUsize::new(0));
    let app = uploads_app(&harness, Arc::clone(&calls));

    let payload = "x".repeat(4_096);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/uploads")
        .body(Body::from(payload))
        .expect("request should build");

    let response = app.oneshot(request).await.expect("router should respond");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should buffer");
    let body: Value = serde_json::from_slice(&bytes).expect("body should be json");
    assert_eq!(body["received"], 4_096);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!harness.service.exists("app:card:c1").await);
}
