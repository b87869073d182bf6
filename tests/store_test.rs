//! Integration tests for the atomic document store.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use intakeq::model::{AttachmentRef, NewSubmission, QueueId, ReportStatus, SubmissionPayload};
use intakeq::store::{CommitOutcome, DocumentStore};

async fn test_store() -> (TempDir, DocumentStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = DocumentStore::open(dir.path().join("reports.json"))
        .await
        .expect("open store");
    (dir, store)
}

fn entry_id(at: DateTime<Utc>) -> QueueId {
    QueueId::generate(at)
}

fn attachment(name: &str) -> AttachmentRef {
    AttachmentRef {
        id: Uuid::new_v4(),
        name: name.to_string(),
        content_type: "image/jpeg".to_string(),
        size: 42,
        location: format!("stored/{name}"),
    }
}

async fn apply(
    store: &DocumentStore,
    payload: &SubmissionPayload,
    attachments: Vec<AttachmentRef>,
    now: DateTime<Utc>,
) -> CommitOutcome {
    store
        .apply_entry(&entry_id(now), payload, attachments, now)
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Insert and persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_commit_creates_report() {
    let (_dir, store) = test_store().await;
    let now = Utc::now();

    let payload = NewSubmission::new("Acme Corp").field("location", "Town").build();
    let outcome = apply(&store, &payload, vec![], now).await;

    let report = match outcome {
        CommitOutcome::Created(report) => report,
        other => panic!("expected Created, got {other:?}"),
    };
    assert_eq!(report.identity_key, "acme corp");
    assert_eq!(report.subject, "Acme Corp");
    assert_eq!(report.status, ReportStatus::New);
    assert_eq!(report.first_seen_at, report.last_seen_at);

    let snapshot = store.read().await;
    assert_eq!(snapshot.version, 1);
    assert!(snapshot.get("acme corp").is_some());
}

#[tokio::test]
async fn snapshot_survives_reopen() {
    let (dir, store) = test_store().await;
    apply(&store, &NewSubmission::new("Acme Corp").build(), vec![], Utc::now()).await;
    drop(store);

    let reopened = DocumentStore::open(dir.path().join("reports.json")).await.unwrap();
    let snapshot = reopened.read().await;
    assert_eq!(snapshot.version, 1);
    assert!(snapshot.get("acme corp").is_some());
}

// ---------------------------------------------------------------------------
// Merge semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn merge_fills_gaps_but_never_overwrites() {
    let (_dir, store) = test_store().await;
    let t0 = Utc::now();

    let first = NewSubmission::new("Acme Corp").field("location", "Town").build();
    apply(&store, &first, vec![], t0).await;

    let second = NewSubmission::new("Acme Corp")
        .field("location", "Elsewhere")
        .field("description", "shady storefront")
        .build();
    let outcome = apply(&store, &second, vec![], t0 + ChronoDuration::seconds(1)).await;

    let report = match outcome {
        CommitOutcome::Merged(report) => report,
        other => panic!("expected Merged, got {other:?}"),
    };
    assert_eq!(report.fields["location"], "Town");
    assert_eq!(report.fields["description"], "shady storefront");
}

#[tokio::test]
async fn merge_ignores_empty_values() {
    let (_dir, store) = test_store().await;
    let t0 = Utc::now();

    apply(
        &store,
        &NewSubmission::new("Acme Corp").field("location", "Town").build(),
        vec![],
        t0,
    )
    .await;
    apply(
        &store,
        &NewSubmission::new("Acme Corp").field("location", "  ").build(),
        vec![],
        t0 + ChronoDuration::seconds(1),
    )
    .await;

    let snapshot = store.read().await;
    assert_eq!(snapshot.get("acme corp").unwrap().fields["location"], "Town");
}

#[tokio::test]
async fn identity_key_is_case_insensitive() {
    // Enqueue {Acme} then {acme, location: Town} -> one report with the
    // location present and lastSeenAt after firstSeenAt.
    let (_dir, store) = test_store().await;
    let t0 = Utc::now();

    apply(&store, &NewSubmission::new("Acme").build(), vec![], t0).await;
    apply(
        &store,
        &NewSubmission::new("acme").field("location", "Town").build(),
        vec![],
        t0 + ChronoDuration::seconds(2),
    )
    .await;

    let snapshot = store.read().await;
    assert_eq!(snapshot.reports.len(), 1);
    let report = snapshot.get("acme").unwrap();
    assert_eq!(report.subject, "Acme");
    assert_eq!(report.fields["location"], "Town");
    assert!(report.last_seen_at > report.first_seen_at);
}

#[tokio::test]
async fn attachments_append_and_never_truncate() {
    let (_dir, store) = test_store().await;
    let t0 = Utc::now();

    apply(
        &store,
        &NewSubmission::new("Acme Corp").build(),
        vec![attachment("one.jpg")],
        t0,
    )
    .await;
    // A later merge with no attachments must not truncate.
    apply(
        &store,
        &NewSubmission::new("Acme Corp").build(),
        vec![],
        t0 + ChronoDuration::seconds(1),
    )
    .await;
    apply(
        &store,
        &NewSubmission::new("Acme Corp").build(),
        vec![attachment("two.jpg")],
        t0 + ChronoDuration::seconds(2),
    )
    .await;

    let snapshot = store.read().await;
    let names: Vec<_> = snapshot
        .get("acme corp")
        .unwrap()
        .attachments
        .iter()
        .map(|a| a.name.as_str())
        .collect();
    assert_eq!(names, vec!["one.jpg", "two.jpg"]);
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reapplying_the_same_entry_is_a_noop() {
    let (_dir, store) = test_store().await;
    let t0 = Utc::now();
    let queue_id = entry_id(t0);
    let payload = NewSubmission::new("Acme Corp").field("location", "Town").build();

    store
        .apply_entry(&queue_id, &payload, vec![attachment("one.jpg")], t0)
        .await
        .unwrap();
    let before = store.read().await.get("acme corp").unwrap().clone();

    // Same entry again, as after a crash between commit and retirement.
    let outcome = store
        .apply_entry(
            &queue_id,
            &payload,
            vec![attachment("one.jpg")],
            t0 + ChronoDuration::seconds(5),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, CommitOutcome::AlreadyApplied(_)));
    let snapshot = store.read().await;
    let after = snapshot.get("acme corp").unwrap();
    assert_eq!(after.attachments.len(), before.attachments.len());
    assert_eq!(after.fields, before.fields);
    assert_eq!(after.last_seen_at, before.last_seen_at);
    assert_eq!(after.applied_entries, before.applied_entries);
    // A no-op re-commit neither rewrites the snapshot nor advances it.
    assert_eq!(snapshot.version, 1);
}

// ---------------------------------------------------------------------------
// Admin path and lookup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn set_status_goes_through_commit() {
    let (dir, store) = test_store().await;
    apply(&store, &NewSubmission::new("Acme Corp").build(), vec![], Utc::now()).await;

    let id = store.read().await.get("acme corp").unwrap().id.0.to_string();
    let updated = store
        .set_status(&id[..8], ReportStatus::InReview)
        .await
        .unwrap();
    assert_eq!(updated.status, ReportStatus::InReview);

    let snapshot = store.read().await;
    assert_eq!(snapshot.version, 2);

    // Persisted, not just in memory.
    let reopened = DocumentStore::open(dir.path().join("reports.json")).await.unwrap();
    assert_eq!(
        reopened.read().await.get("acme corp").unwrap().status,
        ReportStatus::InReview
    );
}

#[tokio::test]
async fn find_by_id_rejects_unknown_and_blank_prefixes() {
    let (_dir, store) = test_store().await;
    apply(&store, &NewSubmission::new("one").build(), vec![], Utc::now()).await;

    let snapshot = store.read().await;
    assert!(snapshot.find_by_id("ffffffff-0000").is_err());
    // A blank prefix must not resolve, even when only one report exists.
    assert!(snapshot.find_by_id("").is_err());
    assert!(snapshot.find_by_id("   ").is_err());
}

// ---------------------------------------------------------------------------
// Atomicity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_publish_keeps_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reports.json");
    let store = DocumentStore::open(&path).await.unwrap();

    // Make the rename target impossible to replace.
    std::fs::create_dir(&path).unwrap();

    let err = store
        .apply_entry(
            &entry_id(Utc::now()),
            &NewSubmission::new("Acme Corp").build(),
            vec![],
            Utc::now(),
        )
        .await
        .unwrap_err();
    assert!(err.is_transient());

    // The published (empty) snapshot is unaffected.
    let snapshot = store.read().await;
    assert_eq!(snapshot.version, 0);
    assert!(snapshot.reports.is_empty());
}

#[tokio::test]
async fn readers_never_observe_a_torn_snapshot() {
    let (_dir, store) = test_store().await;
    let store = Arc::new(store);

    // Each commit inserts exactly one report, so in every consistent
    // snapshot version == number of reports.
    let writer = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            for i in 0..20 {
                apply(&store, &NewSubmission::new(format!("subject {i}")).build(), vec![], Utc::now())
                    .await;
            }
        })
    };

    let reader = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            loop {
                let snapshot = store.read().await;
                assert_eq!(
                    snapshot.version,
                    snapshot.reports.len() as u64,
                    "snapshot mixes pre- and post-commit state"
                );
                if snapshot.version == 20 {
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();
}
