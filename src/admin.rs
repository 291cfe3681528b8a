//! Privileged operations and read-only queries.
//!
//! These bypass the lease protocol and are meant for operators and the
//! QA workflow. Each mutation is still one conditional write on one item,
//! so it composes safely with live claims and sweeps.

use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::lease::LeaseConfig;
use crate::model::*;
use crate::store::{ItemCondition, ItemTransition, Store};
use crate::telemetry::metrics;

/// An item with its label and history, for display.
#[derive(Debug, Clone)]
pub struct ItemDetail {
    pub item: Item,
    pub label: Option<Label>,
    pub revisions: Vec<Revision>,
}

pub struct Admin {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    lease: LeaseConfig,
}

impl Admin {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, lease: LeaseConfig) -> Self {
        Self {
            store,
            clock,
            lease,
        }
    }

    // -- ingestion and provisioning ------------------------------------------

    /// Add a new unassigned item to the pool.
    pub async fn ingest(&self, new: NewItem) -> Result<Item> {
        let item = new.into_item(self.clock.now());
        self.store.insert_item(&item).await?;
        info!(item = %item.id, "item ingested");
        Ok(item)
    }

    /// Create or update a requester account. Counters and the resume
    /// pointer of an existing account are kept.
    pub async fn provision(&self, requester: Requester) -> Result<Requester> {
        self.store.upsert_requester(&requester).await?;
        info!(requester = %requester.id, role = %requester.role, enabled = requester.enabled, "requester provisioned");
        self.store
            .get_requester(&requester.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("requester {}", requester.id)))
    }

    // -- item transitions ----------------------------------------------------

    /// Move an item to `removed` whatever its state. Irreversible.
    pub async fn retire(&self, id: &ItemId) -> Result<bool> {
        let retired = self
            .apply(id, &ItemCondition::Any, &ItemTransition::Remove)
            .await?;
        if retired {
            info!(item = %id, "item retired");
        }
        Ok(retired)
    }

    /// Release a lease before it expires. `false` if the item was not
    /// leased or the lease changed under us.
    pub async fn force_unlock(&self, id: &ItemId) -> Result<bool> {
        let item = self.require(id).await?;
        let Some((holder, deadline)) = item.lease() else {
            return Ok(false);
        };
        let condition = ItemCondition::LeasedUntil {
            holder: holder.clone(),
            deadline,
        };
        let unlocked = self.apply(id, &condition, &ItemTransition::Release).await?;
        if unlocked {
            info!(item = %id, holder = %holder, "lease force-unlocked");
        }
        Ok(unlocked)
    }

    pub async fn set_flag(&self, id: &ItemId, flagged: bool) -> Result<bool> {
        self.apply(id, &ItemCondition::Any, &ItemTransition::Flag { flagged })
            .await
    }

    /// Accept a done item's label.
    pub async fn approve(&self, id: &ItemId) -> Result<bool> {
        let approved = self
            .apply(
                id,
                &ItemCondition::Done,
                &ItemTransition::Review {
                    qa_status: QaStatus::Approved,
                },
            )
            .await?;
        if approved {
            info!(item = %id, "label approved");
        }
        Ok(approved)
    }

    /// Return a done item to `labeler` for revision. The item is leased to
    /// them straight away and their resume pointer is set, so their next
    /// claim picks it up.
    pub async fn send_back(
        &self,
        id: &ItemId,
        labeler: &RequesterId,
        feedback: Option<String>,
    ) -> Result<bool> {
        let deadline = self.lease.deadline_from(self.clock.now())?;
        let sent = self
            .apply(
                id,
                &ItemCondition::Done,
                &ItemTransition::SendBack {
                    holder: labeler.clone(),
                    deadline,
                    feedback,
                },
            )
            .await?;
        if !sent {
            return Ok(false);
        }

        info!(item = %id, labeler = %labeler, "item sent back for revision");
        if let Err(e) = self.store.set_current_lease(labeler, Some(id)).await {
            warn!(labeler = %labeler, "resume pointer write failed: {e}");
        }
        Ok(true)
    }

    /// Clear a verdict back to pending.
    pub async fn reset_qa(&self, id: &ItemId) -> Result<bool> {
        self.apply(
            id,
            &ItemCondition::Any,
            &ItemTransition::Review {
                qa_status: QaStatus::Pending,
            },
        )
        .await
    }

    // -- queries -------------------------------------------------------------

    pub async fn item(&self, id: &ItemId) -> Result<Option<Item>> {
        self.store.get_item(id).await
    }

    /// Stored image reference for the presentation layer to resolve.
    pub async fn image_ref(&self, id: &ItemId) -> Result<String> {
        Ok(self.require(id).await?.image_ref)
    }

    pub async fn label(&self, id: &ItemId) -> Result<Option<Label>> {
        self.store.get_label(id).await
    }

    pub async fn revisions(&self, id: &ItemId) -> Result<Vec<Revision>> {
        self.store.list_revisions(id).await
    }

    pub async fn detail(&self, id: &ItemId) -> Result<ItemDetail> {
        let item = self.require(id).await?;
        let label = self.store.get_label(id).await?;
        let revisions = self.store.list_revisions(id).await?;
        Ok(ItemDetail {
            item,
            label,
            revisions,
        })
    }

    /// Labels `requester` authored, newest first.
    pub async fn history(&self, requester: &RequesterId, limit: i64) -> Result<Vec<Label>> {
        self.store.labels_by_author(requester, limit).await
    }

    pub async fn requester(&self, id: &RequesterId) -> Result<Option<Requester>> {
        self.store.get_requester(id).await
    }

    pub async fn requesters(&self) -> Result<Vec<Requester>> {
        self.store.list_requesters().await
    }

    pub async fn flagged(&self, limit: i64) -> Result<Vec<Item>> {
        self.store.list_flagged(limit).await
    }

    pub async fn by_qa(&self, qa_status: QaStatus, limit: i64) -> Result<Vec<Item>> {
        self.store.list_by_qa(qa_status, limit).await
    }

    // -- helpers -------------------------------------------------------------

    async fn require(&self, id: &ItemId) -> Result<Item> {
        self.store
            .get_item(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("item {id}")))
    }

    async fn apply(
        &self,
        id: &ItemId,
        condition: &ItemCondition,
        transition: &ItemTransition,
    ) -> Result<bool> {
        let applied = self
            .store
            .transition_item(id, condition, transition, self.clock.now())
            .await?;
        if !applied {
            metrics::cas_lost().add(1, &[KeyValue::new("transition", transition.name())]);
            debug!(item = %id, transition = transition.name(), "admin transition did not apply");
        }
        Ok(applied)
    }
}
