mod common;

use chrono::{Duration, Utc};

use common::{metered_entitlement, months, Harness, METER, NAMESPACE};
use credits::bus::RecordingPublisher;
use credits::credit::{CreateGrantInput, Granularity, OwnerRef};
use credits::events::{DomainEvent, EntitlementSnapshotEvent, SnapshotOperation};
use credits::worker::RecalculatorOptions;
use credits::CreditError;

fn seed(harness: &Harness) {
    let start = Granularity::Minute.truncate(Utc::now() - Duration::days(3));
    for (id, subject) in [("ent-a", "customer-1"), ("ent-b", "customer-2"), ("ent-c", "customer-3")] {
        harness
            .store
            .insert_entitlement(metered_entitlement(id, subject, start));
        harness
            .store
            .record_usage(NAMESPACE, METER, subject, start + Duration::hours(2), 5.0);
    }
}

fn published(harness: &Harness) -> Vec<EntitlementSnapshotEvent> {
    harness
        .snapshots_out
        .published_named(&EntitlementSnapshotEvent::event_name())
        .iter()
        .map(|envelope| envelope.decode().unwrap())
        .collect()
}

// key: recalculator-tests -> namespace sweep
#[tokio::test]
async fn sweep_covers_live_and_recently_deleted_entitlements() {
    let harness = Harness::new();
    seed(&harness);
    harness
        .credit
        .create_grant(
            &OwnerRef::new(NAMESPACE, "ent-a"),
            CreateGrantInput::new(
                50.0,
                Granularity::Minute.truncate(Utc::now() - Duration::days(3)),
                months(1),
            ),
        )
        .await
        .unwrap();
    harness
        .store
        .delete_entitlement(NAMESPACE, "ent-b", Utc::now() - Duration::hours(2));
    harness
        .store
        .delete_entitlement(NAMESPACE, "ent-c", Utc::now() - Duration::days(2));

    let recalculator = harness.recalculator(RecalculatorOptions {
        max_batch_size: 1,
        ..RecalculatorOptions::default()
    });
    let report = recalculator.recalculate(NAMESPACE).await.unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.published, 2);
    assert_eq!(report.failed, 0);

    let snapshots = published(&harness);
    let live = snapshots
        .iter()
        .find(|snapshot| snapshot.entitlement.id == "ent-a")
        .unwrap();
    assert_eq!(live.operation, SnapshotOperation::Update);
    assert_eq!(live.value.as_ref().unwrap().balance, Some(45.0));

    let deleted = snapshots
        .iter()
        .find(|snapshot| snapshot.entitlement.id == "ent-b")
        .unwrap();
    assert_eq!(deleted.operation, SnapshotOperation::Delete);
}

#[tokio::test]
async fn one_failure_does_not_stop_the_sweep() {
    let harness = Harness::new();
    seed(&harness);
    let mut orphan = metered_entitlement("ent-0-orphan", "customer-9", Utc::now());
    orphan.feature_id = "feat-gone".into();
    harness.store.insert_entitlement(orphan);

    let recalculator = harness.recalculator(RecalculatorOptions::default());
    let err = recalculator.recalculate(NAMESPACE).await.unwrap_err();

    assert!(matches!(err, CreditError::NotFound { .. }));
    assert_eq!(published(&harness).len(), 3);
}

#[tokio::test]
async fn publish_failures_are_collected_per_batch() {
    let harness = Harness::with_snapshot_publisher(RecordingPublisher::rejecting(|envelope| {
        envelope.subject.ends_with("/customer-1")
    }));
    seed(&harness);

    let recalculator = harness.recalculator(RecalculatorOptions {
        max_batch_size: 1,
        ..RecalculatorOptions::default()
    });
    let err = recalculator.recalculate(NAMESPACE).await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(published(&harness).len(), 2);
}
