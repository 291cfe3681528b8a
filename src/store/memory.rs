//! In-process store, optionally persisted to a flat JSON snapshot file.
//!
//! Every primitive runs under one mutex, which gives exact per-document
//! compare-and-set semantics within a process. The snapshot file is for
//! local development and tests; it is not safe to share between processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{ItemCondition, ItemTransition, LeaseQuery, Store};
use crate::error::{Error, Result};
use crate::model::*;

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    items: BTreeMap<ItemId, Item>,
    labels: BTreeMap<ItemId, Label>,
    revisions: BTreeMap<ItemId, Vec<Revision>>,
    requesters: BTreeMap<RequesterId, Requester>,
}

/// Mutex-guarded collections with an optional snapshot file.
pub struct MemoryStore {
    state: Mutex<State>,
    snapshot: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty, non-persistent store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            snapshot: None,
        }
    }

    /// Open a store backed by a snapshot file. A missing file starts empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)
                .map_err(|e| Error::Snapshot(format!("cannot parse {}: {e}", path.display())))?
        } else {
            State::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            snapshot: Some(path),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write the snapshot, if any. Temp file + rename so a crash never
    /// leaves a half-written file behind.
    fn persist(&self, state: &State) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)
            .map_err(|e| Error::Snapshot(format!("cannot write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| Error::Snapshot(format!("cannot replace {}: {e}", path.display())))?;
        Ok(())
    }
}

fn take(limit: i64) -> usize {
    usize::try_from(limit).unwrap_or(0)
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_item(&self, item: &Item) -> Result<()> {
        let mut state = self.lock();
        if state.items.contains_key(&item.id) {
            return Err(Error::Conflict(format!("item {} already exists", item.id)));
        }
        state.items.insert(item.id.clone(), item.clone());
        self.persist(&state)
    }

    async fn get_item(&self, id: &ItemId) -> Result<Option<Item>> {
        Ok(self.lock().items.get(id).cloned())
    }

    async fn list_items(&self, status: ItemStatus, limit: i64) -> Result<Vec<Item>> {
        let state = self.lock();
        let mut items: Vec<Item> = state
            .items
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        items.sort_by(|a, b| (a.ingested_at, &a.id).cmp(&(b.ingested_at, &b.id)));
        items.truncate(take(limit));
        Ok(items)
    }

    async fn list_leases(&self, query: &LeaseQuery) -> Result<Vec<Item>> {
        let state = self.lock();
        let mut items: Vec<Item> = state
            .items
            .values()
            .filter(|i| match i.lease() {
                Some((holder, deadline)) => {
                    query.cutoff.is_none_or(|cutoff| deadline < cutoff)
                        && query.holder.as_ref().is_none_or(|h| h == holder)
                }
                None => false,
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| (a.lease_deadline, &a.id).cmp(&(b.lease_deadline, &b.id)));
        items.truncate(take(query.limit));
        Ok(items)
    }

    async fn find_lease_held_by(&self, holder: &RequesterId) -> Result<Option<Item>> {
        let state = self.lock();
        Ok(state
            .items
            .values()
            .filter(|i| i.is_leased_by(holder))
            .min_by(|a, b| (a.lease_deadline, &a.id).cmp(&(b.lease_deadline, &b.id)))
            .cloned())
    }

    async fn list_flagged(&self, limit: i64) -> Result<Vec<Item>> {
        let state = self.lock();
        Ok(state
            .items
            .values()
            .filter(|i| i.flagged)
            .take(take(limit))
            .cloned()
            .collect())
    }

    async fn list_by_qa(&self, qa_status: QaStatus, limit: i64) -> Result<Vec<Item>> {
        let state = self.lock();
        let mut items: Vec<Item> = state
            .items
            .values()
            .filter(|i| i.status == ItemStatus::Done && i.qa_status == qa_status)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.completed_at.cmp(&a.completed_at).then(a.id.cmp(&b.id)));
        items.truncate(take(limit));
        Ok(items)
    }

    async fn transition_item(
        &self,
        id: &ItemId,
        condition: &ItemCondition,
        transition: &ItemTransition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.lock();
        let Some(item) = state.items.get_mut(id) else {
            return Ok(false);
        };
        if !condition.holds(item) {
            return Ok(false);
        }
        transition.apply(item, now);
        self.persist(&state)?;
        Ok(true)
    }

    async fn get_label(&self, id: &ItemId) -> Result<Option<Label>> {
        Ok(self.lock().labels.get(id).cloned())
    }

    async fn put_label(&self, label: &Label, expected: Option<u64>) -> Result<bool> {
        let mut state = self.lock();
        let current = state.labels.get(&label.item_id).map(|l| l.generation);
        if current != expected {
            return Ok(false);
        }
        state.labels.insert(label.item_id.clone(), label.clone());
        self.persist(&state)?;
        Ok(true)
    }

    async fn delete_label(&self, id: &ItemId, generation: u64) -> Result<bool> {
        let mut state = self.lock();
        if state.labels.get(id).map(|l| l.generation) != Some(generation) {
            return Ok(false);
        }
        state.labels.remove(id);
        self.persist(&state)?;
        Ok(true)
    }

    async fn append_revision(
        &self,
        label: &Label,
        edited_by: &RequesterId,
        at: DateTime<Utc>,
    ) -> Result<Revision> {
        let mut state = self.lock();
        let seq = label.generation + 1;
        let trail = state.revisions.entry(label.item_id.clone()).or_default();
        if trail.iter().any(|r| r.seq == seq) {
            return Err(Error::Conflict(format!(
                "revision {seq} of {} already written",
                label.item_id
            )));
        }
        let revision = Revision {
            id: Uuid::new_v4(),
            item_id: label.item_id.clone(),
            seq,
            label: label.clone(),
            edited_by: edited_by.clone(),
            edited_at: at,
        };
        trail.push(revision.clone());
        trail.sort_by_key(|r| r.seq);
        self.persist(&state)?;
        Ok(revision)
    }

    async fn retract_revision(&self, id: &ItemId, seq: u64) -> Result<bool> {
        let mut state = self.lock();
        let Some(trail) = state.revisions.get_mut(id) else {
            return Ok(false);
        };
        let before = trail.len();
        trail.retain(|r| r.seq != seq);
        if trail.len() == before {
            return Ok(false);
        }
        if trail.is_empty() {
            state.revisions.remove(id);
        }
        self.persist(&state)?;
        Ok(true)
    }

    async fn list_revisions(&self, id: &ItemId) -> Result<Vec<Revision>> {
        Ok(self.lock().revisions.get(id).cloned().unwrap_or_default())
    }

    async fn labels_by_author(&self, author: &RequesterId, limit: i64) -> Result<Vec<Label>> {
        let state = self.lock();
        let mut labels: Vec<Label> = state
            .labels
            .values()
            .filter(|l| &l.author == author)
            .cloned()
            .collect();
        labels.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.item_id.cmp(&b.item_id)));
        labels.truncate(take(limit));
        Ok(labels)
    }

    async fn count_commits_by(&self, author: &RequesterId) -> Result<u64> {
        let state = self.lock();
        let active = state.labels.values().filter(|l| &l.author == author).count();
        let displaced = state
            .revisions
            .values()
            .flatten()
            .filter(|r| &r.label.author == author)
            .count();
        Ok((active + displaced) as u64)
    }

    async fn get_requester(&self, id: &RequesterId) -> Result<Option<Requester>> {
        Ok(self.lock().requesters.get(id).cloned())
    }

    async fn upsert_requester(&self, requester: &Requester) -> Result<()> {
        let mut state = self.lock();
        state
            .requesters
            .entry(requester.id.clone())
            .and_modify(|r| {
                r.enabled = requester.enabled;
                r.role = requester.role.clone();
            })
            .or_insert_with(|| requester.clone());
        self.persist(&state)
    }

    async fn set_current_lease(&self, id: &RequesterId, item: Option<&ItemId>) -> Result<()> {
        let mut state = self.lock();
        let requester = state
            .requesters
            .entry(id.clone())
            .or_insert_with(|| Requester::new(id.clone()));
        requester.current_lease = item.cloned();
        self.persist(&state)
    }

    async fn record_completion(
        &self,
        id: &RequesterId,
        item: &ItemId,
        at: DateTime<Utc>,
    ) -> Result<Requester> {
        let mut state = self.lock();
        let requester = state
            .requesters
            .entry(id.clone())
            .or_insert_with(|| Requester::new(id.clone()));
        requester.completed_count += 1;
        requester.last_completed_item = Some(item.clone());
        requester.last_completed_at = Some(at);
        requester.current_lease = None;
        let updated = requester.clone();
        self.persist(&state)?;
        Ok(updated)
    }

    async fn raise_completed_count(&self, id: &RequesterId, at_least: u64) -> Result<Requester> {
        let mut state = self.lock();
        let requester = state
            .requesters
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("requester {id}")))?;
        requester.completed_count = requester.completed_count.max(at_least);
        let updated = requester.clone();
        self.persist(&state)?;
        Ok(updated)
    }

    async fn list_requesters(&self) -> Result<Vec<Requester>> {
        Ok(self.lock().requesters.values().cloned().collect())
    }
}
