//! Claiming and releasing items.
//!
//! A claim first tries to resume the requester's existing lease, then walks
//! a window of the oldest unassigned items attempting `unassigned → leased`
//! on each until one write lands. The store's conditional write decides
//! every race; a lost race moves on to the next candidate and never retries
//! the same item.

use chrono::{DateTime, Duration, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{Instrument, debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{ItemCondition, ItemTransition, Store};
use crate::telemetry::metrics;
use crate::telemetry::protocol::{Timer, record_item, record_result, record_transition, start_span};

/// Lease policy.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long a fresh lease lasts.
    pub lease_duration: Duration,
    /// Unassigned items read per selection round.
    pub candidate_window: i64,
    /// Selection rounds before giving up with a conflict.
    pub claim_rounds: u32,
}

impl LeaseConfig {
    /// Deadline of a lease granted at `now`.
    pub fn deadline_from(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        now.checked_add_signed(self.lease_duration).ok_or_else(|| {
            Error::Config(format!(
                "lease duration of {} minutes overflows the clock",
                self.lease_duration.num_minutes()
            ))
        })
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::minutes(60),
            candidate_window: 50,
            claim_rounds: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResult {
    /// A new lease on an item taken from the pool.
    Claimed(Item),
    /// The requester already held this lease.
    Resumed(Item),
    NoWorkAvailable,
}

impl ClaimResult {
    pub fn item(&self) -> Option<&Item> {
        match self {
            ClaimResult::Claimed(item) | ClaimResult::Resumed(item) => Some(item),
            ClaimResult::NoWorkAvailable => None,
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            ClaimResult::Claimed(_) => "claimed",
            ClaimResult::Resumed(_) => "resumed",
            ClaimResult::NoWorkAvailable => "no_work",
        }
    }
}

pub struct LeaseManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: LeaseConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Give `requester` an item to work on.
    ///
    /// # Errors
    ///
    /// `Conflict` when every candidate in every round was taken by someone
    /// else first; store failures otherwise.
    pub async fn claim(&self, requester: &RequesterId) -> Result<ClaimResult> {
        let _timer = Timer::start("claim");
        let span = start_span("claim", Some(requester.as_str()), None);

        let result = async {
            if let Some(item) = self.resume(requester, &span).await? {
                return Ok(ClaimResult::Resumed(item));
            }
            self.acquire(requester, &span).await
        }
        .instrument(span.clone())
        .await;

        let label = match &result {
            Ok(r) => r.metric_label(),
            Err(e) if e.is_retryable() => "conflict",
            Err(_) => "error",
        };
        record_result(&span, label);
        metrics::claims().add(1, &[KeyValue::new("result", label)]);
        result
    }

    /// Return a held lease to the pool. `false` if `requester` did not hold it.
    pub async fn release(&self, item_id: &ItemId, requester: &RequesterId) -> Result<bool> {
        let _timer = Timer::start("release");
        let span = start_span("release", Some(requester.as_str()), Some(item_id.as_str()));

        let released = async {
            let condition = ItemCondition::LeasedBy {
                holder: requester.clone(),
            };
            let released = self
                .store
                .transition_item(item_id, &condition, &ItemTransition::Release, self.clock.now())
                .await?;
            if released {
                record_transition(&span, item_id.as_str(), "leased", "unassigned");
                info!("lease released");
                self.point_at(requester, None).await;
            } else {
                debug!("release of a lease the requester does not hold");
            }
            Ok::<_, Error>(released)
        }
        .instrument(span.clone())
        .await?;

        let label = if released { "released" } else { "not_held" };
        record_result(&span, label);
        metrics::releases().add(1, &[KeyValue::new("result", label)]);
        Ok(released)
    }

    /// The requester's current lease, if any, found via the resume pointer
    /// or by asking the store directly when the pointer is missing or stale.
    async fn resume(&self, requester: &RequesterId, span: &tracing::Span) -> Result<Option<Item>> {
        let pointer = self
            .store
            .get_requester(requester)
            .await?
            .and_then(|r| r.current_lease);

        let mut held = None;
        if let Some(id) = &pointer {
            if let Some(item) = self.store.get_item(id).await? {
                if item.is_leased_by(requester) {
                    held = Some(item);
                }
            }
        }
        if held.is_none() {
            held = self.store.find_lease_held_by(requester).await?;
        }

        let Some(item) = held else {
            if pointer.is_some() {
                debug!("clearing stale resume pointer");
                self.point_at(requester, None).await;
            }
            return Ok(None);
        };
        record_item(span, item.id.as_str());

        let now = self.clock.now();
        if !item.lease_expired(now) {
            if pointer.as_ref() != Some(&item.id) {
                info!(item = %item.id, "resume pointer healed");
                self.point_at(requester, Some(&item.id)).await;
            }
            return Ok(Some(item));
        }

        // Expired but not yet swept. Renew on the exact lease we saw; the
        // reclaimer races on the same predicate.
        let Some((holder, deadline)) = item.lease() else {
            return Ok(None);
        };
        let condition = ItemCondition::LeasedUntil {
            holder: holder.clone(),
            deadline,
        };
        let transition = ItemTransition::Lease {
            holder: requester.clone(),
            deadline: self.config.deadline_from(now)?,
        };
        if !self
            .store
            .transition_item(&item.id, &condition, &transition, now)
            .await?
        {
            metrics::cas_lost().add(1, &[KeyValue::new("transition", "renew")]);
            debug!(item = %item.id, "expired lease reclaimed before renewal");
            return Ok(None);
        }

        let mut item = item;
        transition.apply(&mut item, now);
        info!(item = %item.id, deadline = ?item.lease_deadline, "expired lease renewed on resume");
        if pointer.as_ref() != Some(&item.id) {
            self.point_at(requester, Some(&item.id)).await;
        }
        Ok(Some(item))
    }

    async fn acquire(&self, requester: &RequesterId, span: &tracing::Span) -> Result<ClaimResult> {
        let mut lost = 0usize;
        for round in 0..self.config.claim_rounds {
            let candidates = self
                .store
                .list_items(ItemStatus::Unassigned, self.config.candidate_window)
                .await?;
            if candidates.is_empty() {
                return Ok(ClaimResult::NoWorkAvailable);
            }

            for candidate in candidates {
                let now = self.clock.now();
                let transition = ItemTransition::Lease {
                    holder: requester.clone(),
                    deadline: self.config.deadline_from(now)?,
                };
                if self
                    .store
                    .transition_item(&candidate.id, &ItemCondition::Unassigned, &transition, now)
                    .await?
                {
                    let mut item = candidate;
                    transition.apply(&mut item, now);
                    record_item(span, item.id.as_str());
                    record_transition(span, item.id.as_str(), "unassigned", "leased");
                    info!(item = %item.id, round, "item claimed");
                    self.point_at(requester, Some(&item.id)).await;
                    return Ok(ClaimResult::Claimed(item));
                }
                lost += 1;
                metrics::cas_lost().add(1, &[KeyValue::new("transition", transition.name())]);
                debug!(item = %candidate.id, "lost claim race");
            }
        }

        Err(Error::Conflict(format!(
            "lost {lost} claim races over {} rounds",
            self.config.claim_rounds
        )))
    }

    /// Best-effort resume pointer write. The lease stands either way.
    async fn point_at(&self, requester: &RequesterId, item: Option<&ItemId>) {
        if let Err(e) = self.store.set_current_lease(requester, item).await {
            warn!(requester = %requester, "resume pointer write failed: {e}");
        }
    }
}
