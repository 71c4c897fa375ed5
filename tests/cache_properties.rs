use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tagcache::cache::{
    AffectedIds, Backend, CacheConfig, CacheService, ChangedFields, CompressionCodec,
    CompressionConfig, MemoryBackend, Mutation, Tag,
};

const TTL: Duration = Duration::from_secs(600);

fn service() -> (Arc<MemoryBackend>, CacheService) {
    service_with(CacheConfig::default())
}

fn service_with(config: CacheConfig) -> (Arc<MemoryBackend>, CacheService) {
    let backend = Arc::new(MemoryBackend::new());
    let service = CacheService::new(config, Arc::clone(&backend) as Arc<dyn Backend>);
    (backend, service)
}

fn tags(names: &[&str]) -> Vec<Tag> {
    names.iter().map(|name| Tag::from(*name)).collect()
}

#[tokio::test]
async fn stored_values_come_back_deep_equal() {
    let (_, service) = service();
    let value = json!({
        "id": "c1",
        "items": [{"q": "2+2", "a": 4}, {"q": "3*3", "a": 9}],
        "meta": {"public": true, "score": 0.5, "owner": null}
    });

    assert!(service.set("app:card:c1", &value, TTL, &[]).await);
    assert_eq!(service.get::<Value>("app:card:c1").await, Some(value));
}

#[tokio::test]
async fn invalidating_one_tag_clears_every_membership() {
    let (_, service) = service();
    assert!(service.set("k", &json!(1), TTL, &tags(&["A", "B"])).await);

    assert_eq!(service.invalidate(&tags(&["A"])).await, 1);
    assert_eq!(service.get::<Value>("k").await, None);
    assert!(service.members_of(&Tag::from("A")).await.is_empty());
    assert!(service.members_of(&Tag::from("B")).await.is_empty());
}

#[tokio::test]
async fn principal_scoped_tags_never_cross_principals() {
    let (_, service) = service();
    assert!(service.set("app:library:u1:me", &json!(["c1"]), TTL, &tags(&["u1:Library"])).await);
    assert!(service.set("app:library:u2:me", &json!(["c2"]), TTL, &tags(&["u2:Library"])).await);

    assert_eq!(service.invalidate(&tags(&["u1:Library"])).await, 1);
    assert_eq!(service.get::<Value>("app:library:u1:me").await, None);
    assert_eq!(
        service.get::<Value>("app:library:u2:me").await,
        Some(json!(["c2"]))
    );
}

#[tokio::test]
async fn quiz_edit_leaves_unrelated_category_listing() {
    let (_, service) = service();
    assert!(service.set("app:overview:c1", &json!({"id": "c1"}), TTL, &tags(&["Overview:c1"])).await);
    assert!(service.set("app:quiz:c1", &json!({"q": 3}), TTL, &tags(&["Quiz:c1"])).await);
    assert!(service.set("app:review_queue:c1", &json!([]), TTL, &tags(&["ReviewQueue:c1"])).await);
    assert!(
        service
            .set("app:category:Math", &json!(["c1"]), TTL, &tags(&["Category", "Category:Math"]))
            .await
    );

    let quiz_edit = Mutation::CardUpdated.tags(&AffectedIds::card("c1"), &ChangedFields::new(["quiz"]));
    assert_eq!(
        quiz_edit,
        tags(&["Overview:c1", "Quiz:c1", "ReviewQueue:c1"])
    );
    assert_eq!(service.invalidate(&quiz_edit).await, 3);
    assert!(service.exists("app:category:Math").await);

    let category_edit = Mutation::CardUpdated.tags(
        &AffectedIds::card("c1"),
        &ChangedFields::default().with_category("Science"),
    );
    assert_eq!(service.invalidate(&category_edit).await, 1);
    assert!(!service.exists("app:category:Math").await);
}

#[tokio::test]
async fn unreachable_store_degrades_to_neutral_values() {
    let (backend, service) = service();
    backend.set_reachable(false);

    assert_eq!(service.get::<Value>("k").await, None);
    assert!(!service.set("k", &json!(1), TTL, &tags(&["A"])).await);
    assert_eq!(service.invalidate(&tags(&["A"])).await, 0);
    assert!(service.members_of(&Tag::from("A")).await.is_empty());
    assert!(!service.delete("k").await);
    assert!(service.stats().snapshot().errors > 0);
}

#[test]
fn compression_is_transparent() {
    let codec = CompressionCodec::new(CompressionConfig {
        enabled: true,
        threshold_bytes: 64,
    });

    let small = br#"{"id":"c1"}"#.to_vec();
    let stored = codec.compress(small.clone());
    assert!(!stored.compressed);
    assert_eq!(stored.data, small);

    let large = serde_json::to_vec(&json!({"text": "lorem ipsum ".repeat(50)}))
        .expect("payload should encode");
    let stored = codec.compress(large.clone());
    assert!(stored.compressed);
    assert_ne!(stored.data, large);
    assert_eq!(codec.decompress(&stored.data).expect("decompress"), large);
}

#[tokio::test]
async fn compressed_entries_round_trip_through_the_service() {
    let (_, service) = service_with(CacheConfig {
        compression: CompressionConfig {
            enabled: true,
            threshold_bytes: 32,
        },
        ..Default::default()
    });
    let value = json!({"body": "x".repeat(4_096)});

    assert!(service.set("big", &value, TTL, &[]).await);
    assert_eq!(service.get::<Value>("big").await, Some(value));
}

#[tokio::test]
async fn repeated_invalidation_is_a_no_op() {
    let (_, service) = service();
    assert!(service.set("k", &json!(1), TTL, &tags(&["T"])).await);

    assert_eq!(service.invalidate(&tags(&["T"])).await, 1);
    assert_eq!(service.invalidate(&tags(&["T"])).await, 0);
}

#[tokio::test]
async fn card_tagged_entry_is_removed_by_class_invalidation() {
    let (_, service) = service();
    let key = "app:card:abc123";
    let value = json!({"id": "abc123", "title": "X"});

    assert!(
        service
            .set(key, &value, Duration::from_secs(21_600), &tags(&["Overview:abc123", "Card"]))
            .await
    );
    assert_eq!(service.invalidate(&tags(&["Card"])).await, 1);
    assert_eq!(service.get::<Value>(key).await, None);
    assert!(
        !service
            .members_of(&Tag::from("Overview:abc123"))
            .await
            .contains(&key.to_string())
    );
}

#[tokio::test]
async fn disabled_service_is_inert() {
    let (backend, service) = service_with(CacheConfig::disabled());

    assert!(!service.set("k", &json!(1), TTL, &tags(&["A"])).await);
    assert_eq!(service.get::<Value>("k").await, None);
    assert_eq!(service.invalidate(&tags(&["A"])).await, 0);
    assert_eq!(backend.value_count(), 0);
}
