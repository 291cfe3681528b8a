//! Core data model.
//!
//! An item is one photograph waiting to be annotated. A label is the
//! annotation payload for one item, with an append-only revision trail.
//! A requester is one annotator account with its resume pointer and counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable, globally unique item identifier (typically the image name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

/// Opaque requester identifier, validated by the auth layer before it reaches us.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequesterId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(ItemId);
string_id!(RequesterId);

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// One unit of work: a single property photograph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,

    /// Opaque storage pointer. The presentation layer resolves it into a
    /// displayable URL; the core never calls the resolver.
    pub image_ref: String,

    /// Optional grouping key (the property the photo belongs to).
    pub property_id: Option<String>,

    pub status: ItemStatus,

    /// Set iff `status == Leased`.
    pub holder: Option<RequesterId>,

    /// Set iff `status == Leased`.
    pub lease_deadline: Option<DateTime<Utc>>,

    pub flagged: bool,
    pub qa_status: QaStatus,

    /// Reviewer remarks from the last send-back. Cleared by a verdict.
    #[serde(default)]
    pub qa_feedback: Option<String>,

    /// Selection order for the claim policy (oldest first).
    pub ingested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Item {
    /// Is this item currently leased to `requester`?
    pub fn is_leased_by(&self, requester: &RequesterId) -> bool {
        self.status == ItemStatus::Leased && self.holder.as_ref() == Some(requester)
    }

    /// Has the lease deadline passed at `now`? False when not leased.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ItemStatus::Leased && self.lease_deadline.is_some_and(|d| d < now)
    }

    /// The holder/deadline pair iff the lease invariant holds.
    pub fn lease(&self) -> Option<(&RequesterId, DateTime<Utc>)> {
        match (self.status, self.holder.as_ref(), self.lease_deadline) {
            (ItemStatus::Leased, Some(holder), Some(deadline)) => Some((holder, deadline)),
            _ => None,
        }
    }
}

/// Lifecycle status of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// In the pool, waiting for a requester.
    Unassigned,
    /// Exclusively held by one requester until its deadline.
    Leased,
    /// Label committed.
    Done,
    /// Retired from the pool. Terminal.
    Removed,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemStatus::Unassigned => "unassigned",
            ItemStatus::Leased => "leased",
            ItemStatus::Done => "done",
            ItemStatus::Removed => "removed",
        };
        f.pad(s)
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unassigned" => Ok(ItemStatus::Unassigned),
            "leased" => Ok(ItemStatus::Leased),
            "done" => Ok(ItemStatus::Done),
            "removed" => Ok(ItemStatus::Removed),
            _ => Err(Error::Other(format!("unknown item status: {s}"))),
        }
    }
}

/// Reviewer verdict on a done item. Driven by the QA workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaStatus {
    #[default]
    Pending,
    Approved,
    /// Sent back to the labeler for revision.
    Rejected,
}

impl std::fmt::Display for QaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QaStatus::Pending => "pending",
            QaStatus::Approved => "approved",
            QaStatus::Rejected => "rejected",
        };
        f.pad(s)
    }
}

impl std::str::FromStr for QaStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QaStatus::Pending),
            "approved" => Ok(QaStatus::Approved),
            "rejected" => Ok(QaStatus::Rejected),
            _ => Err(Error::Other(format!("unknown qa status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Label
// ---------------------------------------------------------------------------

/// What an annotator submits. Shape is enforced by serde; content rules
/// (hierarchy completeness, ranges) by [`crate::commit::validate_payload`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelPayload {
    /// Expanded location chains, e.g. `"Residential Interior > Private Spaces"`.
    pub location_tags: Vec<String>,

    /// `Location:Category:Feature` triples.
    #[serde(default)]
    pub feature_tags: BTreeSet<String>,

    /// Contextual attributes. `None` records an explicit N/A.
    #[serde(default)]
    pub attributes: BTreeMap<String, Option<String>>,

    #[serde(default)]
    pub condition: ConditionScores,

    #[serde(default)]
    pub notes: String,

    /// Copied onto the item's `flagged` field on commit.
    #[serde(default)]
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionScores {
    /// 1.0 ..= 5.0, `None` for N/A.
    #[serde(default)]
    pub property_condition: Option<f64>,
    #[serde(default)]
    pub quality_of_construction: Option<String>,
    #[serde(default)]
    pub improvement_condition: Option<String>,
}

/// The active label for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub item_id: ItemId,
    pub payload: LabelPayload,
    /// Taxonomy version in force when this payload was committed.
    pub schema_version: u32,
    pub author: RequesterId,
    /// How many labels this one displaced. Its predecessor, if any, sits in
    /// the revision trail at this seq.
    #[serde(default)]
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A displaced label, appended to the item's history before an overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: Uuid,
    pub item_id: ItemId,
    /// 1-based position in the trail. Oldest first.
    pub seq: u64,
    /// The label exactly as it was before the overwrite.
    pub label: Label,
    /// Whose commit displaced it.
    pub edited_by: RequesterId,
    pub edited_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Requester
// ---------------------------------------------------------------------------

/// One annotator account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requester {
    pub id: RequesterId,
    pub enabled: bool,
    /// Interpreted by the auth layer only.
    pub role: String,
    /// Resume pointer. A cache of the active lease, never authoritative.
    pub current_lease: Option<ItemId>,
    pub completed_count: u64,
    pub last_completed_item: Option<ItemId>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl Requester {
    pub fn new(id: impl Into<RequesterId>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            role: "labeler".to_string(),
            current_lease: None,
            completed_count: 0,
            last_completed_item: None,
            last_completed_at: None,
        }
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for ingesting new items into the pool.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub(crate) id: ItemId,
    pub(crate) image_ref: String,
    pub(crate) property_id: Option<String>,
    pub(crate) ingested_at: Option<DateTime<Utc>>,
}

impl NewItem {
    pub fn new(id: impl Into<ItemId>, image_ref: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image_ref: image_ref.into(),
            property_id: None,
            ingested_at: None,
        }
    }

    pub fn property(mut self, property_id: impl Into<String>) -> Self {
        self.property_id = Some(property_id.into());
        self
    }

    /// Override the ingestion timestamp (defaults to the store clock's now).
    pub fn ingested_at(mut self, at: DateTime<Utc>) -> Self {
        self.ingested_at = Some(at);
        self
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    /// Materialize as a fresh unassigned item.
    pub fn into_item(self, now: DateTime<Utc>) -> Item {
        let ingested_at = self.ingested_at.unwrap_or(now);
        Item {
            id: self.id,
            image_ref: self.image_ref,
            property_id: self.property_id,
            status: ItemStatus::Unassigned,
            holder: None,
            lease_deadline: None,
            flagged: false,
            qa_status: QaStatus::Pending,
            qa_feedback: None,
            ingested_at,
            updated_at: now,
            completed_at: None,
        }
    }
}
