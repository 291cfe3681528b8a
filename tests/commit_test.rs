mod common;

use chrono::Duration;
use common::*;
use labelq::clock::Clock;
use labelq::commit::{CommitResult, LabelCommitter, Rejection, ValidationError};
use labelq::lease::{LeaseConfig, LeaseManager};
use labelq::model::{ItemStatus, LabelPayload, QaStatus};
use labelq::stats::StatsUpdater;
use std::sync::Arc;

fn committed(result: CommitResult) -> Box<labelq::commit::Committed> {
    match result {
        CommitResult::Committed(c) => c,
        CommitResult::Rejected(r) => panic!("expected commit, got rejection: {r}"),
    }
}

fn rejected(result: CommitResult) -> Rejection {
    match result {
        CommitResult::Rejected(r) => r,
        CommitResult::Committed(c) => panic!("expected rejection, committed {}", c.item.id),
    }
}

#[tokio::test]
async fn commit_completes_item_and_counts() {
    let h = Harness::new();
    h.ingest(&["IMG1"]).await;
    h.leases.claim(&rid("alice")).await.unwrap();
    h.clock.advance(Duration::minutes(10));

    let c = committed(
        h.committer
            .commit(&iid("IMG1"), &rid("alice"), bathroom(), 3)
            .await
            .unwrap(),
    );
    assert!(c.revision.is_none());
    assert_eq!(c.label.schema_version, 3);
    assert_eq!(c.label.author, rid("alice"));
    assert_eq!(c.label.created_at, h.clock.now());

    let item = h.item("IMG1").await;
    assert_eq!(item.status, ItemStatus::Done);
    assert_eq!(item.holder, None);
    assert_eq!(item.lease_deadline, None);
    assert_eq!(item.completed_at, Some(h.clock.now()));
    assert_eq!(item, c.item);

    let label = h.store.get_label(&iid("IMG1")).await.unwrap().unwrap();
    assert_eq!(label.payload, bathroom());

    let alice = h.requester("alice").await.unwrap();
    assert_eq!(alice.completed_count, 1);
    assert_eq!(alice.last_completed_item, Some(iid("IMG1")));
    assert_eq!(alice.last_completed_at, Some(h.clock.now()));
    assert_eq!(alice.current_lease, None);
    assert_eq!(c.requester, Some(alice));
}

#[tokio::test]
async fn incomplete_hierarchy_is_rejected_without_writes() {
    let h = Harness::new();
    h.ingest(&["IMG1"]).await;
    h.leases.claim(&rid("alice")).await.unwrap();

    let gappy = LabelPayload {
        location_tags: vec![
            "Residential Interior".to_string(),
            "Residential Interior > Private Spaces > Bathroom > Full".to_string(),
        ],
        ..Default::default()
    };
    let reason = rejected(
        h.committer
            .commit(&iid("IMG1"), &rid("alice"), gappy, 1)
            .await
            .unwrap(),
    );
    assert!(matches!(
        reason,
        Rejection::Invalid(ValidationError::IncompleteHierarchy { .. })
    ));

    assert!(h.item("IMG1").await.is_leased_by(&rid("alice")));
    assert!(h.store.get_label(&iid("IMG1")).await.unwrap().is_none());
    assert_eq!(h.requester("alice").await.unwrap().completed_count, 0);

    // The complete four-element chain goes through.
    let result = h
        .committer
        .commit(&iid("IMG1"), &rid("alice"), bathroom(), 1)
        .await
        .unwrap();
    assert!(result.is_committed());
}

#[tokio::test]
async fn other_validation_reasons() {
    let h = Harness::new();
    h.ingest(&["IMG1"]).await;
    h.leases.claim(&rid("alice")).await.unwrap();

    let empty = LabelPayload::default();
    assert_eq!(
        rejected(h.committer.commit(&iid("IMG1"), &rid("alice"), empty, 1).await.unwrap()),
        Rejection::Invalid(ValidationError::NoLocation)
    );

    assert_eq!(
        rejected(
            h.committer
                .commit(&iid("IMG1"), &rid("alice"), bathroom(), 0)
                .await
                .unwrap()
        ),
        Rejection::Invalid(ValidationError::UnsupportedSchema { version: 0 })
    );

    let mut bad_feature = bathroom();
    bad_feature.feature_tags.insert("Vanity".to_string());
    assert!(matches!(
        rejected(
            h.committer
                .commit(&iid("IMG1"), &rid("alice"), bad_feature, 1)
                .await
                .unwrap()
        ),
        Rejection::Invalid(ValidationError::MalformedFeature { .. })
    ));
}

#[tokio::test]
async fn unknown_item_is_rejected() {
    let h = Harness::new();
    let reason = rejected(
        h.committer
            .commit(&iid("NOPE"), &rid("alice"), bathroom(), 1)
            .await
            .unwrap(),
    );
    assert_eq!(reason, Rejection::UnknownItem);
}

#[tokio::test]
async fn commit_after_reclaim_is_not_your_lease() {
    let h = Harness::new();
    h.ingest(&["IMG1"]).await;
    h.leases.claim(&rid("alice")).await.unwrap();

    h.clock.advance(Duration::minutes(61));
    assert_eq!(h.reclaimer.sweep(h.clock.now()).await.unwrap(), 1);
    let before = h.item("IMG1").await;

    let reason = rejected(
        h.committer
            .commit(&iid("IMG1"), &rid("alice"), bathroom(), 1)
            .await
            .unwrap(),
    );
    assert_eq!(reason, Rejection::NotYourLease);
    assert_eq!(h.item("IMG1").await, before);
    assert!(h.store.get_label(&iid("IMG1")).await.unwrap().is_none());

    // Bob picks it up; Alice still cannot commit over him.
    h.leases.claim(&rid("bob")).await.unwrap();
    let held_by_bob = h.item("IMG1").await;
    let reason = rejected(
        h.committer
            .commit(&iid("IMG1"), &rid("alice"), bathroom(), 1)
            .await
            .unwrap(),
    );
    assert_eq!(reason, Rejection::NotYourLease);
    assert_eq!(h.item("IMG1").await, held_by_bob);
}

#[tokio::test]
async fn second_commit_accumulates_one_revision() {
    let h = Harness::new();
    h.ingest(&["IMG1"]).await;
    h.leases.claim(&rid("alice")).await.unwrap();
    h.committer
        .commit(&iid("IMG1"), &rid("alice"), bathroom(), 1)
        .await
        .unwrap();
    let first_created = h.clock.now();

    // QA sends it back; Alice resumes and relabels.
    h.clock.advance(Duration::hours(2));
    assert!(
        h.admin
            .send_back(&iid("IMG1"), &rid("alice"), Some("wrong room".into()))
            .await
            .unwrap()
    );
    let resumed = h.leases.claim(&rid("alice")).await.unwrap();
    assert_eq!(resumed.item().unwrap().id.as_str(), "IMG1");

    h.clock.advance(Duration::minutes(5));
    let c = committed(
        h.committer
            .commit(&iid("IMG1"), &rid("alice"), kitchen(), 2)
            .await
            .unwrap(),
    );

    let rev = c.revision.as_ref().unwrap();
    assert_eq!(rev.seq, 1);
    assert_eq!(rev.edited_by, rid("alice"));

    let label = h.store.get_label(&iid("IMG1")).await.unwrap().unwrap();
    assert_eq!(label.payload, kitchen());
    assert_eq!(label.schema_version, 2);
    assert_eq!(label.created_at, first_created);
    assert_eq!(label.updated_at, h.clock.now());

    let trail = h.store.list_revisions(&iid("IMG1")).await.unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].label.payload, bathroom());
    assert_eq!(trail[0].label.schema_version, 1);

    let item = h.item("IMG1").await;
    assert_eq!(item.status, ItemStatus::Done);
    assert_eq!(item.qa_status, QaStatus::Pending);
    assert_eq!(h.requester("alice").await.unwrap().completed_count, 2);
}

#[tokio::test]
async fn flag_is_copied_from_payload() {
    let h = Harness::new();
    h.ingest(&["IMG1"]).await;
    h.leases.claim(&rid("alice")).await.unwrap();

    let mut payload = bathroom();
    payload.flagged = true;
    h.committer
        .commit(&iid("IMG1"), &rid("alice"), payload, 1)
        .await
        .unwrap();

    assert!(h.item("IMG1").await.flagged);
    let flagged = h.admin.flagged(10).await.unwrap();
    assert_eq!(flagged.len(), 1);
}

#[tokio::test]
async fn stats_failure_keeps_the_commit() {
    let faulty = Arc::new(FaultyStore::default());
    let h = Harness::with_store(faulty.clone());
    h.ingest(&["IMG1"]).await;
    h.leases.claim(&rid("alice")).await.unwrap();

    FaultyStore::set(&faulty.fail_completion, true);
    let c = committed(
        h.committer
            .commit(&iid("IMG1"), &rid("alice"), bathroom(), 1)
            .await
            .unwrap(),
    );
    assert!(c.requester.is_none());
    assert_eq!(h.item("IMG1").await.status, ItemStatus::Done);
    assert!(h.store.get_label(&iid("IMG1")).await.unwrap().is_some());
    assert_eq!(h.requester("alice").await.unwrap().completed_count, 0);

    // The reconciler catches the counter up.
    FaultyStore::set(&faulty.fail_completion, false);
    let stats = StatsUpdater::new(h.store.clone());
    let recount = stats.recount(&rid("alice")).await.unwrap();
    assert!(recount.repaired());
    assert_eq!(h.requester("alice").await.unwrap().completed_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counters_increase_by_exactly_k_under_interleaving() {
    const K: usize = 6;
    let h = Harness::new();
    let ids: Vec<String> = (0..(K * 3)).map(|i| format!("IMG{i:02}")).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    h.ingest(&refs).await;

    let leases = Arc::new(LeaseManager::new(
        h.store.clone(),
        h.clock.clone(),
        LeaseConfig::default(),
    ));
    let committer = Arc::new(LabelCommitter::new(h.store.clone(), h.clock.clone()));

    let tasks: Vec<_> = ["alice", "bob", "carol"]
        .into_iter()
        .map(|who| {
            let leases = leases.clone();
            let committer = committer.clone();
            tokio::spawn(async move {
                for _ in 0..K {
                    let claim = leases.claim(&rid(who)).await.unwrap();
                    let item = claim.item().expect("pool has enough items").id.clone();
                    let result = committer
                        .commit(&item, &rid(who), bathroom(), 1)
                        .await
                        .unwrap();
                    assert!(result.is_committed());
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    for who in ["alice", "bob", "carol"] {
        assert_eq!(h.requester(who).await.unwrap().completed_count, K as u64);
    }
}

#[tokio::test]
async fn lost_completion_leaves_no_label_behind() {
    let faulty = Arc::new(FaultyStore::default());
    let h = Harness::with_store(faulty.clone());
    h.ingest(&["IMG1"]).await;
    h.leases.claim(&rid("alice")).await.unwrap();

    FaultyStore::set(&faulty.lose_completion, true);
    let reason = rejected(
        h.committer
            .commit(&iid("IMG1"), &rid("alice"), bathroom(), 1)
            .await
            .unwrap(),
    );
    assert_eq!(reason, Rejection::NotYourLease);
    assert_eq!(h.item("IMG1").await.status, ItemStatus::Unassigned);
    assert!(h.store.get_label(&iid("IMG1")).await.unwrap().is_none());
    assert!(h.store.list_revisions(&iid("IMG1")).await.unwrap().is_empty());
    assert_eq!(h.store.count_commits_by(&rid("alice")).await.unwrap(), 0);
}

#[tokio::test]
async fn lost_completion_restores_the_displaced_label() {
    let faulty = Arc::new(FaultyStore::default());
    let h = Harness::with_store(faulty.clone());
    h.ingest(&["IMG1"]).await;
    h.leases.claim(&rid("alice")).await.unwrap();
    committed(
        h.committer
            .commit(&iid("IMG1"), &rid("alice"), bathroom(), 1)
            .await
            .unwrap(),
    );
    let original = h.store.get_label(&iid("IMG1")).await.unwrap().unwrap();

    h.admin
        .send_back(&iid("IMG1"), &rid("bob"), None)
        .await
        .unwrap();
    FaultyStore::set(&faulty.lose_completion, true);
    let reason = rejected(
        h.committer
            .commit(&iid("IMG1"), &rid("bob"), kitchen(), 1)
            .await
            .unwrap(),
    );
    assert_eq!(reason, Rejection::NotYourLease);
    assert_eq!(
        h.store.get_label(&iid("IMG1")).await.unwrap(),
        Some(original)
    );
    assert!(h.store.list_revisions(&iid("IMG1")).await.unwrap().is_empty());

    // Bob picks the released item up again and this time it lands.
    FaultyStore::set(&faulty.lose_completion, false);
    let claim = h.leases.claim(&rid("bob")).await.unwrap();
    assert_eq!(claim.item().unwrap().id, iid("IMG1"));
    let c = committed(
        h.committer
            .commit(&iid("IMG1"), &rid("bob"), kitchen(), 1)
            .await
            .unwrap(),
    );
    assert_eq!(c.revision.as_ref().unwrap().seq, 1);
    assert_eq!(c.label.generation, 1);

    let trail = h.store.list_revisions(&iid("IMG1")).await.unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].label.author, rid("alice"));

    let stats = StatsUpdater::new(h.store.clone());
    for who in ["alice", "bob"] {
        let r = stats.recount(&rid(who)).await.unwrap();
        assert!(!r.repaired(), "{who} was over-credited");
        assert_eq!(r.after, 1);
    }
}
