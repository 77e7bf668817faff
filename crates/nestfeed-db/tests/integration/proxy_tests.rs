use chrono::{TimeDelta, Utc};
use nestfeed_core::models::{NewProxy, ProxyOutcome, ProxyProtocol, RequestLogEntry};
use nestfeed_core::traits::{ProxyStore, RequestLogStore};

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn add_proxy_is_idempotent_per_endpoint() {
    let (db, _container) = setup_test_db().await;

    let first = db
        .add_proxy(&NewProxy::new("10.0.0.1", 3128, ProxyProtocol::Http))
        .await
        .unwrap();
    let again = db
        .add_proxy(
            &NewProxy::new("10.0.0.1", 3128, ProxyProtocol::Http)
                .with_credentials("user", "pass")
                .with_country("CA"),
        )
        .await
        .unwrap();

    assert_eq!(first.id, again.id);
    assert_eq!(again.success_rate, 100.0);
    assert!(again.active);
    assert_eq!(again.country.as_deref(), Some("CA"));
    assert_eq!(
        again.credentials.as_ref().map(|c| c.username.as_str()),
        Some("user")
    );
    assert_eq!(db.list_proxies().await.unwrap().len(), 1);
}

#[tokio::test]
async fn active_proxies_are_least_recently_used_first() {
    let (db, _container) = setup_test_db().await;
    let a = db
        .add_proxy(&NewProxy::new("10.0.0.1", 3128, ProxyProtocol::Http))
        .await
        .unwrap();
    let b = db
        .add_proxy(&NewProxy::new("10.0.0.2", 1080, ProxyProtocol::Socks5))
        .await
        .unwrap();

    db.mark_proxy_used(a.id, Utc::now()).await.unwrap();

    let active = db.active_proxies().await.unwrap();
    assert_eq!(active[0].id, b.id);
    assert_eq!(active[1].id, a.id);
    assert_eq!(active[0].protocol, ProxyProtocol::Socks5);
}

#[tokio::test]
async fn health_failures_decay_and_deactivate() {
    let (db, _container) = setup_test_db().await;
    let proxy = db
        .add_proxy(&NewProxy::new("10.0.0.9", 8080, ProxyProtocol::Http))
        .await
        .unwrap();

    let mut scores = Vec::new();
    for _ in 0..4 {
        let score = db
            .update_proxy_stats(proxy.id, &ProxyOutcome::health_check(false, None), 50.0)
            .await
            .unwrap();
        scores.push(score);
    }

    assert!((scores[0].success_rate - 80.0).abs() < 1e-9);
    assert!((scores[2].success_rate - 51.2).abs() < 1e-9);
    assert!(scores[2].active);
    assert!((scores[3].success_rate - 40.96).abs() < 1e-9);
    assert!(!scores[3].active);
    assert!(db.active_proxies().await.unwrap().is_empty());

    let revived = db
        .update_proxy_stats(proxy.id, &ProxyOutcome::health_check(true, Some(120)), 50.0)
        .await
        .unwrap();
    assert!(revived.active);
    assert!((revived.success_rate - (40.96 * 0.9 + 10.0)).abs() < 1e-9);

    let stored = db.list_proxies().await.unwrap().remove(0);
    assert_eq!(stored.response_time_ms, Some(120));
    assert!(stored.last_tested.is_some());
}

#[tokio::test]
async fn concurrent_live_failures_are_not_lost() {
    let (db, _container) = setup_test_db().await;
    let proxy = db
        .add_proxy(&NewProxy::new("10.0.0.3", 3128, ProxyProtocol::Http))
        .await
        .unwrap();
    let id = proxy.id;

    let updates = (0..10).map(|_| {
        let db = db.clone();
        tokio::spawn(async move {
            db.update_proxy_stats(id, &ProxyOutcome::live(false, None), 0.0)
                .await
                .unwrap()
        })
    });
    for handle in updates.collect::<Vec<_>>() {
        handle.await.unwrap();
    }

    let stored = db.list_proxies().await.unwrap().remove(0);
    assert!((stored.success_rate - 100.0 * 0.9f64.powi(10)).abs() < 1e-6);
}

#[tokio::test]
async fn due_for_test_skips_recently_tested() {
    let (db, _container) = setup_test_db().await;
    let tested = db
        .add_proxy(&NewProxy::new("10.0.0.4", 3128, ProxyProtocol::Http))
        .await
        .unwrap();
    db.add_proxy(&NewProxy::new("10.0.0.5", 3128, ProxyProtocol::Http))
        .await
        .unwrap();
    db.update_proxy_stats(tested.id, &ProxyOutcome::health_check(true, Some(50)), 50.0)
        .await
        .unwrap();

    let due = db
        .proxies_due_for_test(Utc::now() - TimeDelta::hours(1), 10)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].address, "10.0.0.5");

    let stats = db.proxy_stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.active, 2);
    assert_eq!(stats.avg_response_time_ms, Some(50.0));
}

#[tokio::test]
async fn request_log_counts_and_prunes() {
    let (db, _container) = setup_test_db().await;
    let now = Utc::now();
    for age_days in [0, 0, 10] {
        db.log_request(&RequestLogEntry {
            url: "https://listings.example.com/search".into(),
            proxy_id: None,
            success: true,
            status_code: Some(200),
            response_time_ms: Some(80),
            at: now - TimeDelta::days(age_days),
        })
        .await
        .unwrap();
    }

    assert_eq!(
        db.count_requests_since(now - TimeDelta::hours(1)).await.unwrap(),
        2
    );
    assert_eq!(
        db.prune_request_log(now - TimeDelta::days(7)).await.unwrap(),
        1
    );
}
