//! Backing store contract.
//!
//! The protocol never assumes cross-collection transactions. Everything it
//! needs is a point read, a single-document conditional write
//! ([`Store::transition_item`]), single-document upserts, and an append-only
//! revision log per label. [`MemoryStore`] and [`PgStore`] implement it.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::*;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---------------------------------------------------------------------------
// Conditional write vocabulary
// ---------------------------------------------------------------------------

/// Predicate over an item's current state. A conditional write applies only
/// when it holds.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemCondition {
    /// Privileged. Always holds.
    Any,
    Unassigned,
    Done,
    /// Leased by this holder, whatever the deadline.
    LeasedBy { holder: RequesterId },
    /// Leased by this holder with exactly this deadline.
    LeasedUntil {
        holder: RequesterId,
        deadline: DateTime<Utc>,
    },
}

impl ItemCondition {
    pub fn holds(&self, item: &Item) -> bool {
        match self {
            ItemCondition::Any => true,
            ItemCondition::Unassigned => item.status == ItemStatus::Unassigned,
            ItemCondition::Done => item.status == ItemStatus::Done,
            ItemCondition::LeasedBy { holder } => item.is_leased_by(holder),
            ItemCondition::LeasedUntil { holder, deadline } => {
                item.is_leased_by(holder) && item.lease_deadline == Some(*deadline)
            }
        }
    }

    /// `(status, holder, deadline)` that must match; `None` means unchecked.
    pub fn parts(&self) -> (Option<ItemStatus>, Option<&RequesterId>, Option<DateTime<Utc>>) {
        match self {
            ItemCondition::Any => (None, None, None),
            ItemCondition::Unassigned => (Some(ItemStatus::Unassigned), None, None),
            ItemCondition::Done => (Some(ItemStatus::Done), None, None),
            ItemCondition::LeasedBy { holder } => (Some(ItemStatus::Leased), Some(holder), None),
            ItemCondition::LeasedUntil { holder, deadline } => {
                (Some(ItemStatus::Leased), Some(holder), Some(*deadline))
            }
        }
    }
}

/// The change a conditional write makes. Every variant keeps the
/// holder/deadline invariant.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemTransition {
    /// → leased by `holder` until `deadline`.
    Lease {
        holder: RequesterId,
        deadline: DateTime<Utc>,
    },
    /// → unassigned, holder and deadline cleared.
    Release,
    /// → done, holder and deadline cleared, QA reset to pending.
    Complete { flagged: bool },
    /// → removed, holder and deadline cleared.
    Remove,
    /// done → leased by the original labeler for revision, QA rejected.
    SendBack {
        holder: RequesterId,
        deadline: DateTime<Utc>,
        feedback: Option<String>,
    },
    /// QA verdict only; status untouched. Clears reviewer feedback.
    Review { qa_status: QaStatus },
    /// Flag only; status untouched.
    Flag { flagged: bool },
}

/// Field-level effect of a transition. `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemPatch {
    pub status: Option<ItemStatus>,
    /// `Some(None)` clears the lease, `Some(Some(..))` sets it.
    pub lease: Option<Option<(RequesterId, DateTime<Utc>)>>,
    pub qa_status: Option<QaStatus>,
    /// `Some(None)` clears the feedback.
    pub qa_feedback: Option<Option<String>>,
    pub flagged: Option<bool>,
    pub completed: bool,
}

impl ItemTransition {
    pub fn patch(&self) -> ItemPatch {
        let none = ItemPatch {
            status: None,
            lease: None,
            qa_status: None,
            qa_feedback: None,
            flagged: None,
            completed: false,
        };
        match self {
            ItemTransition::Lease { holder, deadline } => ItemPatch {
                status: Some(ItemStatus::Leased),
                lease: Some(Some((holder.clone(), *deadline))),
                ..none
            },
            ItemTransition::Release => ItemPatch {
                status: Some(ItemStatus::Unassigned),
                lease: Some(None),
                ..none
            },
            ItemTransition::Complete { flagged } => ItemPatch {
                status: Some(ItemStatus::Done),
                lease: Some(None),
                qa_status: Some(QaStatus::Pending),
                flagged: Some(*flagged),
                completed: true,
                ..none
            },
            ItemTransition::Remove => ItemPatch {
                status: Some(ItemStatus::Removed),
                lease: Some(None),
                ..none
            },
            ItemTransition::SendBack {
                holder,
                deadline,
                feedback,
            } => ItemPatch {
                status: Some(ItemStatus::Leased),
                lease: Some(Some((holder.clone(), *deadline))),
                qa_status: Some(QaStatus::Rejected),
                qa_feedback: Some(feedback.clone()),
                ..none
            },
            ItemTransition::Review { qa_status } => ItemPatch {
                qa_status: Some(*qa_status),
                qa_feedback: Some(None),
                ..none
            },
            ItemTransition::Flag { flagged } => ItemPatch {
                flagged: Some(*flagged),
                ..none
            },
        }
    }

    /// Apply to an in-memory copy.
    pub fn apply(&self, item: &mut Item, now: DateTime<Utc>) {
        let patch = self.patch();
        if let Some(status) = patch.status {
            item.status = status;
        }
        match patch.lease {
            Some(Some((holder, deadline))) => {
                item.holder = Some(holder);
                item.lease_deadline = Some(deadline);
            }
            Some(None) => {
                item.holder = None;
                item.lease_deadline = None;
            }
            None => {}
        }
        if let Some(qa) = patch.qa_status {
            item.qa_status = qa;
        }
        if let Some(feedback) = patch.qa_feedback {
            item.qa_feedback = feedback;
        }
        if let Some(flagged) = patch.flagged {
            item.flagged = flagged;
        }
        if patch.completed {
            item.completed_at = Some(now);
        }
        item.updated_at = now;
    }

    /// Short name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            ItemTransition::Lease { .. } => "lease",
            ItemTransition::Release => "release",
            ItemTransition::Complete { .. } => "complete",
            ItemTransition::Remove => "remove",
            ItemTransition::SendBack { .. } => "send_back",
            ItemTransition::Review { .. } => "review",
            ItemTransition::Flag { .. } => "flag",
        }
    }
}

/// Which expired leases a sweep should look at.
#[derive(Debug, Clone, Default)]
pub struct LeaseQuery {
    /// Only leases whose deadline is strictly before this instant.
    pub cutoff: Option<DateTime<Utc>>,
    pub holder: Option<RequesterId>,
    pub limit: i64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Per-document read / conditional-write / append contract over the three
/// collections plus the revision log.
#[async_trait]
pub trait Store: Send + Sync {
    // -- items -------------------------------------------------------------

    /// Insert a new unassigned item. Fails if the id already exists.
    async fn insert_item(&self, item: &Item) -> Result<()>;

    async fn get_item(&self, id: &ItemId) -> Result<Option<Item>>;

    /// Items in `status`, oldest ingested first, ties by id.
    async fn list_items(&self, status: ItemStatus, limit: i64) -> Result<Vec<Item>>;

    /// Leased items matching `query`, earliest deadline first.
    async fn list_leases(&self, query: &LeaseQuery) -> Result<Vec<Item>>;

    /// An item currently leased by `holder`, if any.
    async fn find_lease_held_by(&self, holder: &RequesterId) -> Result<Option<Item>>;

    async fn list_flagged(&self, limit: i64) -> Result<Vec<Item>>;

    /// Done items with the given QA verdict, most recently completed first.
    async fn list_by_qa(&self, qa_status: QaStatus, limit: i64) -> Result<Vec<Item>>;

    /// The conditional write. Returns `false`, with no side effects, when
    /// the item is missing or `condition` does not hold.
    async fn transition_item(
        &self,
        id: &ItemId,
        condition: &ItemCondition,
        transition: &ItemTransition,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // -- labels ------------------------------------------------------------

    async fn get_label(&self, id: &ItemId) -> Result<Option<Label>>;

    /// Write the active label for `label.item_id` if the current one is at
    /// generation `expected` (`None`: no label yet). `false` if it is not.
    async fn put_label(&self, label: &Label, expected: Option<u64>) -> Result<bool>;

    /// Remove the active label if it is still at `generation`.
    async fn delete_label(&self, id: &ItemId, generation: u64) -> Result<bool>;

    /// Append `label` to the item's revision trail at seq
    /// `label.generation + 1`. `Conflict` if that seq is taken.
    async fn append_revision(
        &self,
        label: &Label,
        edited_by: &RequesterId,
        at: DateTime<Utc>,
    ) -> Result<Revision>;

    /// Drop trail entry `seq`. Only for backing out a commit that never
    /// completed; committed history is never retracted.
    async fn retract_revision(&self, id: &ItemId, seq: u64) -> Result<bool>;

    /// Full trail, oldest first.
    async fn list_revisions(&self, id: &ItemId) -> Result<Vec<Revision>>;

    /// Active labels authored by `author`, newest first.
    async fn labels_by_author(&self, author: &RequesterId, limit: i64) -> Result<Vec<Label>>;

    /// Commits attributable to `author`: active labels they authored plus
    /// revisions whose displaced label they authored.
    async fn count_commits_by(&self, author: &RequesterId) -> Result<u64>;

    // -- requesters --------------------------------------------------------

    async fn get_requester(&self, id: &RequesterId) -> Result<Option<Requester>>;

    /// Provisioning upsert. Keeps counters and resume pointer of an
    /// existing record; only `enabled` and `role` are replaced.
    async fn upsert_requester(&self, requester: &Requester) -> Result<()>;

    /// Set or clear the resume pointer, creating the record if absent.
    async fn set_current_lease(&self, id: &RequesterId, item: Option<&ItemId>) -> Result<()>;

    /// Atomic counter bump plus last-completed fields; clears the resume
    /// pointer. Creates the record if absent.
    async fn record_completion(
        &self,
        id: &RequesterId,
        item: &ItemId,
        at: DateTime<Utc>,
    ) -> Result<Requester>;

    /// Raise `completed_count` to `at_least` if it is lower. Never lowers it.
    async fn raise_completed_count(&self, id: &RequesterId, at_least: u64) -> Result<Requester>;

    async fn list_requesters(&self) -> Result<Vec<Requester>>;
}
