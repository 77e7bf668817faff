use chrono::{TimeDelta, Utc};
use nestfeed_core::models::{ListingRecord, TransactionType};
use nestfeed_core::traits::{ListingStore, RequestLogStore};
use nestfeed_db::Database;

use crate::integration::common::{backdate_listing, setup_test_db};

fn listing(external_id: &str, price: f64) -> ListingRecord {
    ListingRecord {
        external_id: external_id.into(),
        transaction: TransactionType::Rent,
        url: Some(format!("https://listings.example.com/listings/{external_id}")),
        price: Some(price),
        images: vec![],
        data: serde_json::json!({"id": external_id, "price": price}),
    }
}

async fn stored_hash(db: &Database, external_id: &str) -> String {
    let (hash,): (String,) = sqlx::query_as("SELECT data_hash FROM listings WHERE external_id = $1")
        .bind(external_id)
        .fetch_one(db.pool())
        .await
        .unwrap();
    hash
}

#[tokio::test]
async fn upsert_reports_new_then_updated() {
    let (db, _container) = setup_test_db().await;

    let first = db.upsert_listing(&listing("W100", 2400.0)).await.unwrap();
    assert!(first.was_new);

    let updated = listing("W100", 2350.0);
    let second = db.upsert_listing(&updated).await.unwrap();
    assert!(!second.was_new);
    assert_eq!(second.id, first.id);
    assert_eq!(stored_hash(&db, "W100").await, updated.data_hash());

    let counts = db.listing_counts().await.unwrap();
    assert_eq!(counts.total, 1);
    assert_eq!(counts.active, 1);
}

#[tokio::test]
async fn images_are_replaced_in_order() {
    let (db, _container) = setup_test_db().await;
    let id = db.upsert_listing(&listing("W200", 1800.0)).await.unwrap().id;

    db.upsert_images(id, &["a.jpg".into(), "b.jpg".into(), "c.jpg".into()])
        .await
        .unwrap();
    db.upsert_images(id, &["d.jpg".into(), "a.jpg".into()])
        .await
        .unwrap();

    assert_eq!(db.listings().images(id).await.unwrap(), vec!["d.jpg", "a.jpg"]);
}

#[tokio::test]
async fn stale_sweep_only_touches_old_listings() {
    let (db, _container) = setup_test_db().await;
    db.upsert_listing(&listing("OLD", 1000.0)).await.unwrap();
    db.upsert_listing(&listing("RECENT", 1100.0)).await.unwrap();
    backdate_listing(&db, "OLD", 8).await;
    backdate_listing(&db, "RECENT", 6).await;

    let removed = db.mark_stale(Utc::now() - TimeDelta::days(7)).await.unwrap();
    assert_eq!(removed, 1);
    // Already inactive rows are not counted twice.
    assert_eq!(db.mark_stale(Utc::now() - TimeDelta::days(7)).await.unwrap(), 0);

    let counts = db.listing_counts().await.unwrap();
    assert_eq!(counts.active, 1);

    // Seeing the listing again reactivates it.
    db.upsert_listing(&listing("OLD", 990.0)).await.unwrap();
    assert_eq!(db.listing_counts().await.unwrap().active, 2);
}

#[tokio::test]
async fn due_for_refresh_is_oldest_first() {
    let (db, _container) = setup_test_db().await;
    for (id, days) in [("A", 2), ("B", 5), ("C", 0)] {
        db.upsert_listing(&listing(id, 1000.0)).await.unwrap();
        backdate_listing(&db, id, days).await;
    }

    let due = db
        .listings_due_for_refresh(Utc::now() - TimeDelta::days(1), 10)
        .await
        .unwrap();
    let ids: Vec<&str> = due.iter().map(|l| l.external_id.as_str()).collect();
    assert_eq!(ids, vec!["B", "A"]);
    assert_eq!(due[0].transaction, TransactionType::Rent);

    let limited = db
        .listings_due_for_refresh(Utc::now() - TimeDelta::days(1), 1)
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn view_log_prune_respects_cutoff() {
    let (db, _container) = setup_test_db().await;
    let id = db.upsert_listing(&listing("V1", 1500.0)).await.unwrap().id;
    db.listings().record_view(id).await.unwrap();
    sqlx::query(
        "INSERT INTO listing_views (listing_id, viewed_at) VALUES ($1, NOW() - INTERVAL '40 days')",
    )
    .bind(id)
    .execute(db.pool())
    .await
    .unwrap();

    let pruned = db
        .prune_view_log(Utc::now() - TimeDelta::days(30))
        .await
        .unwrap();
    assert_eq!(pruned, 1);
}
