//! Label commit: validate, write the label and its history, complete the
//! item, then bump the requester's counters.
//!
//! Write order is label (and revision) first, item second. A reader that
//! sees an item `done` can therefore always find its label. If the item
//! write is lost, the label writes are backed out. The requester
//! update runs last and may lag; see [`crate::stats`].

use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{Instrument, debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::hierarchy;
use crate::model::*;
use crate::stats::StatsUpdater;
use crate::store::{ItemCondition, ItemTransition, Store};
use crate::telemetry::metrics;
use crate::telemetry::protocol::{Timer, record_result, record_transition, start_span};

/// Why a payload failed structural validation. Nothing is written.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("no location tags")]
    NoLocation,

    #[error("malformed location tag {tag:?}")]
    MalformedTag { tag: String },

    #[error("location tag {tag:?} is missing its parent {missing:?}")]
    IncompleteHierarchy { tag: String, missing: String },

    #[error("feature tag {tag:?} is not Location:Category:Feature")]
    MalformedFeature { tag: String },

    #[error("property condition {value} is outside 1.0..=5.0")]
    ConditionOutOfRange { value: f64 },

    #[error("unsupported taxonomy version {version}")]
    UnsupportedSchema { version: u32 },
}

/// Check a payload's shape against the commit rules.
pub fn validate_payload(
    payload: &LabelPayload,
    taxonomy_version: u32,
) -> std::result::Result<(), ValidationError> {
    if taxonomy_version == 0 {
        return Err(ValidationError::UnsupportedSchema {
            version: taxonomy_version,
        });
    }

    hierarchy::validate_chain(&payload.location_tags)?;

    for tag in &payload.feature_tags {
        let parts: Vec<&str> = tag.split(':').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.trim().is_empty()) {
            return Err(ValidationError::MalformedFeature { tag: tag.clone() });
        }
    }

    if let Some(value) = payload.condition.property_condition {
        if !(1.0..=5.0).contains(&value) {
            return Err(ValidationError::ConditionOutOfRange { value });
        }
    }

    Ok(())
}

/// Normal refusals. The caller shows these to the annotator.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    UnknownItem,
    /// The item is not leased by this requester. Claim again.
    NotYourLease,
    Invalid(ValidationError),
}

impl Rejection {
    fn metric_label(&self) -> &'static str {
        match self {
            Rejection::UnknownItem => "unknown_item",
            Rejection::NotYourLease => "not_your_lease",
            Rejection::Invalid(_) => "invalid",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::UnknownItem => write!(f, "unknown item"),
            Rejection::NotYourLease => write!(f, "not your lease"),
            Rejection::Invalid(e) => write!(f, "invalid payload: {e}"),
        }
    }
}

/// Everything a successful commit wrote.
#[derive(Debug, Clone)]
pub struct Committed {
    pub item: Item,
    pub label: Label,
    /// The displaced label, when this commit overwrote one.
    pub revision: Option<Revision>,
    /// Updated counters; `None` if the stats update failed.
    pub requester: Option<Requester>,
}

#[derive(Debug, Clone)]
pub enum CommitResult {
    Committed(Box<Committed>),
    Rejected(Rejection),
}

impl CommitResult {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitResult::Committed(_))
    }
}

pub struct LabelCommitter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    stats: StatsUpdater,
}

impl LabelCommitter {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        let stats = StatsUpdater::new(Arc::clone(&store));
        Self {
            store,
            clock,
            stats,
        }
    }

    /// Commit `payload` as the label for `item_id`.
    ///
    /// `taxonomy_version` is stamped on the label as its `schema_version`.
    ///
    /// # Errors
    ///
    /// `Conflict` if the item is still leased to `requester` but the
    /// completing write did not land; store failures otherwise.
    pub async fn commit(
        &self,
        item_id: &ItemId,
        requester: &RequesterId,
        payload: LabelPayload,
        taxonomy_version: u32,
    ) -> Result<CommitResult> {
        let _timer = Timer::start("commit");
        let span = start_span("commit", Some(requester.as_str()), Some(item_id.as_str()));

        let result = self
            .commit_inner(item_id, requester, payload, taxonomy_version, &span)
            .instrument(span.clone())
            .await;

        let label = match &result {
            Ok(CommitResult::Committed(_)) => "committed",
            Ok(CommitResult::Rejected(r)) => r.metric_label(),
            Err(e) if e.is_retryable() => "conflict",
            Err(_) => "error",
        };
        record_result(&span, label);
        metrics::commits().add(1, &[KeyValue::new("result", label)]);
        result
    }

    async fn commit_inner(
        &self,
        item_id: &ItemId,
        requester: &RequesterId,
        payload: LabelPayload,
        taxonomy_version: u32,
        span: &tracing::Span,
    ) -> Result<CommitResult> {
        let Some(item) = self.store.get_item(item_id).await? else {
            return Ok(CommitResult::Rejected(Rejection::UnknownItem));
        };
        if !item.is_leased_by(requester) {
            debug!(status = %item.status, "commit against a lease the requester does not hold");
            return Ok(CommitResult::Rejected(Rejection::NotYourLease));
        }

        if let Err(e) = validate_payload(&payload, taxonomy_version) {
            debug!("payload rejected: {e}");
            return Ok(CommitResult::Rejected(Rejection::Invalid(e)));
        }

        let now = self.clock.now();
        let flagged = payload.flagged;

        // Label first. The previous payload goes to the revision trail
        // before it is overwritten; both writes are guarded on the label's
        // generation, so a concurrent commit on the same label loses here.
        let existing = self.store.get_label(item_id).await?;
        let revision = match &existing {
            Some(previous) => Some(self.store.append_revision(previous, requester, now).await?),
            None => None,
        };
        let label = Label {
            item_id: item_id.clone(),
            payload,
            schema_version: taxonomy_version,
            author: requester.clone(),
            generation: existing.as_ref().map_or(0, |l| l.generation + 1),
            created_at: existing.as_ref().map_or(now, |l| l.created_at),
            updated_at: now,
        };
        let expected = existing.as_ref().map(|l| l.generation);
        if !self.store.put_label(&label, expected).await? {
            metrics::cas_lost().add(1, &[KeyValue::new("transition", "label")]);
            if let Some(revision) = &revision {
                self.store.retract_revision(item_id, revision.seq).await?;
            }
            return Err(Error::Conflict(format!(
                "label for {item_id} changed during commit"
            )));
        }

        let condition = ItemCondition::LeasedBy {
            holder: requester.clone(),
        };
        let transition = ItemTransition::Complete { flagged };
        if !self
            .store
            .transition_item(item_id, &condition, &transition, now)
            .await?
        {
            metrics::cas_lost().add(1, &[KeyValue::new("transition", transition.name())]);
            self.back_out(&label, existing.as_ref(), revision.as_ref())
                .await?;
            let current = self.store.get_item(item_id).await?;
            return match current {
                Some(current) if current.is_leased_by(requester) => Err(Error::Conflict(format!(
                    "item {item_id} still leased to {requester} but completion did not apply"
                ))),
                _ => {
                    debug!("lease lost between read and completion");
                    Ok(CommitResult::Rejected(Rejection::NotYourLease))
                }
            };
        }

        let mut item = item;
        transition.apply(&mut item, now);
        record_transition(span, item_id.as_str(), "leased", "done");
        info!(
            revision = revision.as_ref().map(|r| r.seq),
            schema_version = taxonomy_version,
            "label committed"
        );

        let requester = match self.stats.record(requester, item_id, now).await {
            Ok(r) => Some(r),
            Err(e) => {
                metrics::stats_failures().add(1, &[]);
                warn!("stats update failed, counter will lag until recount: {e}");
                None
            }
        };

        Ok(CommitResult::Committed(Box::new(Committed {
            item,
            label,
            revision,
            requester,
        })))
    }

    /// Undo the label writes of a commit whose item write did not land, so
    /// an uncommitted payload never shows up in the trail or in recounts.
    /// A label that already moved on is left alone.
    async fn back_out(
        &self,
        label: &Label,
        previous: Option<&Label>,
        revision: Option<&Revision>,
    ) -> Result<()> {
        let restored = match previous {
            Some(previous) => self.store.put_label(previous, Some(label.generation)).await?,
            None => {
                self.store
                    .delete_label(&label.item_id, label.generation)
                    .await?
            }
        };
        if !restored {
            warn!(generation = label.generation, "label moved on before the commit was backed out");
            return Ok(());
        }
        if let Some(revision) = revision {
            self.store
                .retract_revision(&label.item_id, revision.seq)
                .await?;
        }
        debug!("uncommitted label backed out");
        Ok(())
    }
}
