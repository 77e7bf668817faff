use chrono::{TimeDelta, Utc};
use nestfeed_core::job::{JobKind, SessionCounts, SessionOutcome, SessionStatus};
use nestfeed_core::traits::SessionStore;

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn session_lifecycle_and_stats() {
    let (db, _container) = setup_test_db().await;

    let full = db.log_session_start(JobKind::Full).await.unwrap();
    assert_eq!(full.status, SessionStatus::Started);
    let counts = SessionCounts {
        found: 10,
        new: 4,
        updated: 6,
        removed: 2,
    };
    db.log_session_end(full.id, &SessionOutcome::completed(counts, 1500))
        .await
        .unwrap();

    let failed = db.log_session_start(JobKind::Incremental).await.unwrap();
    db.log_session_end(
        failed.id,
        &SessionOutcome::failed(SessionCounts::default(), "Daily request quota of 5 exhausted", 500),
    )
    .await
    .unwrap();

    db.log_session_start(JobKind::PriceUpdate).await.unwrap();

    let stats = db
        .session_stats(Utc::now() - TimeDelta::hours(24))
        .await
        .unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.counts, counts);
    assert_eq!(stats.avg_execution_ms, Some(1000.0));

    let recent = db.recent_sessions(10).await.unwrap();
    assert_eq!(recent[0].kind, JobKind::PriceUpdate);
    let stored = recent.iter().find(|s| s.id == failed.id).unwrap();
    assert_eq!(stored.status, SessionStatus::Failed);
    assert!(stored.error.as_deref().unwrap().contains("quota"));
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn ending_twice_is_rejected() {
    let (db, _container) = setup_test_db().await;
    let session = db.log_session_start(JobKind::Cleanup).await.unwrap();
    let outcome = SessionOutcome::completed(SessionCounts::default(), 10);

    db.log_session_end(session.id, &outcome).await.unwrap();
    assert!(db.log_session_end(session.id, &outcome).await.is_err());
}

#[tokio::test]
async fn prune_keeps_most_recent_and_running() {
    let (db, _container) = setup_test_db().await;
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(db.log_session_start(JobKind::ProxyHealth).await.unwrap().id);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let outcome = SessionOutcome::completed(SessionCounts::default(), 10);
    for (i, id) in ids.iter().enumerate() {
        if i != 1 {
            db.log_session_end(*id, &outcome).await.unwrap();
        }
    }

    assert_eq!(db.prune_sessions(2).await.unwrap(), 2);

    let remaining: Vec<_> = db
        .recent_sessions(10)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(remaining, vec![ids[4], ids[3], ids[1]]);

    db.log_session_end(ids[1], &outcome).await.unwrap();
}
