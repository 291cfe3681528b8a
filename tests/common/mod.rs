//! Shared fixtures: a pinned clock, an in-memory store, and a store wrapper
//! that injects failures into selected primitives.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use labelq::admin::Admin;
use labelq::clock::ManualClock;
use labelq::commit::LabelCommitter;
use labelq::error::{Error, Result};
use labelq::hierarchy::expand_chain;
use labelq::lease::{LeaseConfig, LeaseManager};
use labelq::model::*;
use labelq::reclaim::{Reclaimer, SweepConfig};
use labelq::store::{ItemCondition, ItemTransition, LeaseQuery, MemoryStore, Store};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

/// Every component wired to one store and one clock.
pub struct Harness {
    pub store: Arc<dyn Store>,
    pub clock: Arc<ManualClock>,
    pub leases: LeaseManager,
    pub committer: LabelCommitter,
    pub reclaimer: Reclaimer,
    pub admin: Admin,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn Store>) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        Self {
            leases: LeaseManager::new(store.clone(), clock.clone(), LeaseConfig::default()),
            committer: LabelCommitter::new(store.clone(), clock.clone()),
            reclaimer: Reclaimer::new(store.clone(), clock.clone(), SweepConfig::default()),
            admin: Admin::new(store.clone(), clock.clone(), LeaseConfig::default()),
            store,
            clock,
        }
    }

    /// Ingest `ids` one minute apart, in order.
    pub async fn ingest(&self, ids: &[&str]) {
        for (i, id) in ids.iter().enumerate() {
            let new = NewItem::new(*id, format!("b2://photos/{id}.jpg"))
                .ingested_at(t0() - chrono::Duration::minutes((ids.len() - i) as i64));
            self.admin.ingest(new).await.unwrap();
        }
    }

    pub async fn item(&self, id: &str) -> Item {
        self.store.get_item(&id.into()).await.unwrap().unwrap()
    }

    pub async fn requester(&self, id: &str) -> Option<Requester> {
        self.store.get_requester(&id.into()).await.unwrap()
    }
}

pub fn rid(s: &str) -> RequesterId {
    s.into()
}

pub fn iid(s: &str) -> ItemId {
    s.into()
}

/// A valid payload for a full bathroom.
pub fn bathroom() -> LabelPayload {
    LabelPayload {
        location_tags: expand_chain(&["Residential Interior", "Private Spaces", "Bathroom", "Full"]),
        feature_tags: ["Full:Fixtures:Double Vanity".to_string()].into(),
        notes: "first pass".to_string(),
        ..Default::default()
    }
}

/// A different valid payload for the same photo.
pub fn kitchen() -> LabelPayload {
    LabelPayload {
        location_tags: expand_chain(&["Residential Interior", "Living Areas", "Kitchen"]),
        notes: "actually a kitchen".to_string(),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// Delegates to a [`MemoryStore`], failing selected primitives on demand.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    /// `record_completion` returns a store error.
    pub fail_completion: AtomicBool,
    /// `set_current_lease` returns a store error.
    pub fail_pointer: AtomicBool,
    /// Every `unassigned → leased` write reports a lost race.
    pub lose_claims: AtomicBool,
    /// The lease is released just before a completing write reaches the
    /// store, as if a sweep got there first.
    pub lose_completion: AtomicBool,
}

impl FaultyStore {
    pub fn set(flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }
}

fn injected(what: &str) -> Error {
    Error::Other(format!("injected failure: {what}"))
}

#[async_trait]
impl Store for FaultyStore {
    async fn insert_item(&self, item: &Item) -> Result<()> {
        self.inner.insert_item(item).await
    }

    async fn get_item(&self, id: &ItemId) -> Result<Option<Item>> {
        self.inner.get_item(id).await
    }

    async fn list_items(&self, status: ItemStatus, limit: i64) -> Result<Vec<Item>> {
        self.inner.list_items(status, limit).await
    }

    async fn list_leases(&self, query: &LeaseQuery) -> Result<Vec<Item>> {
        self.inner.list_leases(query).await
    }

    async fn find_lease_held_by(&self, holder: &RequesterId) -> Result<Option<Item>> {
        self.inner.find_lease_held_by(holder).await
    }

    async fn list_flagged(&self, limit: i64) -> Result<Vec<Item>> {
        self.inner.list_flagged(limit).await
    }

    async fn list_by_qa(&self, qa_status: QaStatus, limit: i64) -> Result<Vec<Item>> {
        self.inner.list_by_qa(qa_status, limit).await
    }

    async fn transition_item(
        &self,
        id: &ItemId,
        condition: &ItemCondition,
        transition: &ItemTransition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if self.lose_claims.load(Ordering::SeqCst) && *condition == ItemCondition::Unassigned {
            return Ok(false);
        }
        if self.lose_completion.load(Ordering::SeqCst)
            && matches!(transition, ItemTransition::Complete { .. })
        {
            self.inner
                .transition_item(id, &ItemCondition::Any, &ItemTransition::Release, now)
                .await?;
        }
        self.inner
            .transition_item(id, condition, transition, now)
            .await
    }

    async fn get_label(&self, id: &ItemId) -> Result<Option<Label>> {
        self.inner.get_label(id).await
    }

    async fn put_label(&self, label: &Label, expected: Option<u64>) -> Result<bool> {
        self.inner.put_label(label, expected).await
    }

    async fn delete_label(&self, id: &ItemId, generation: u64) -> Result<bool> {
        self.inner.delete_label(id, generation).await
    }

    async fn append_revision(
        &self,
        label: &Label,
        edited_by: &RequesterId,
        at: DateTime<Utc>,
    ) -> Result<Revision> {
        self.inner.append_revision(label, edited_by, at).await
    }

    async fn retract_revision(&self, id: &ItemId, seq: u64) -> Result<bool> {
        self.inner.retract_revision(id, seq).await
    }

    async fn list_revisions(&self, id: &ItemId) -> Result<Vec<Revision>> {
        self.inner.list_revisions(id).await
    }

    async fn labels_by_author(&self, author: &RequesterId, limit: i64) -> Result<Vec<Label>> {
        self.inner.labels_by_author(author, limit).await
    }

    async fn count_commits_by(&self, author: &RequesterId) -> Result<u64> {
        self.inner.count_commits_by(author).await
    }

    async fn get_requester(&self, id: &RequesterId) -> Result<Option<Requester>> {
        self.inner.get_requester(id).await
    }

    async fn upsert_requester(&self, requester: &Requester) -> Result<()> {
        self.inner.upsert_requester(requester).await
    }

    async fn set_current_lease(&self, id: &RequesterId, item: Option<&ItemId>) -> Result<()> {
        if self.fail_pointer.load(Ordering::SeqCst) {
            return Err(injected("set_current_lease"));
        }
        self.inner.set_current_lease(id, item).await
    }

    async fn record_completion(
        &self,
        id: &RequesterId,
        item: &ItemId,
        at: DateTime<Utc>,
    ) -> Result<Requester> {
        if self.fail_completion.load(Ordering::SeqCst) {
            return Err(injected("record_completion"));
        }
        self.inner.record_completion(id, item, at).await
    }

    async fn raise_completed_count(&self, id: &RequesterId, at_least: u64) -> Result<Requester> {
        self.inner.raise_completed_count(id, at_least).await
    }

    async fn list_requesters(&self) -> Result<Vec<Requester>> {
        self.inner.list_requesters().await
    }
}
