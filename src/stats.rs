//! Per-requester completion counters.
//!
//! Bumped once per successful commit. A failed bump is never retried inside
//! the commit; [`StatsUpdater::recount`] repairs lagging counters from the
//! label store and never lowers them.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{ItemId, Requester, RequesterId};
use crate::store::Store;

/// Outcome of reconciling one requester's counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Recount {
    pub requester: RequesterId,
    pub before: u64,
    pub after: u64,
}

impl Recount {
    pub fn repaired(&self) -> bool {
        self.after > self.before
    }
}

#[derive(Clone)]
pub struct StatsUpdater {
    store: Arc<dyn Store>,
}

impl StatsUpdater {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Count one completed commit. Single-document atomic increment that
    /// also clears the resume pointer.
    pub async fn record(
        &self,
        requester: &RequesterId,
        item: &ItemId,
        at: DateTime<Utc>,
    ) -> Result<Requester> {
        self.store.record_completion(requester, item, at).await
    }

    /// Raise `completed_count` to the number of commits the store can
    /// attribute to `requester`.
    pub async fn recount(&self, requester: &RequesterId) -> Result<Recount> {
        let current = self
            .store
            .get_requester(requester)
            .await?
            .ok_or_else(|| Error::NotFound(format!("requester {requester}")))?;

        let attributed = self.store.count_commits_by(requester).await?;
        if attributed <= current.completed_count {
            return Ok(Recount {
                requester: requester.clone(),
                before: current.completed_count,
                after: current.completed_count,
            });
        }

        let updated = self
            .store
            .raise_completed_count(requester, attributed)
            .await?;
        info!(
            requester = %requester,
            before = current.completed_count,
            after = updated.completed_count,
            "completed_count repaired"
        );
        Ok(Recount {
            requester: requester.clone(),
            before: current.completed_count,
            after: updated.completed_count,
        })
    }

    /// Recount every known requester. One failure does not stop the pass.
    pub async fn recount_all(&self) -> Result<Vec<Recount>> {
        let requesters = self.store.list_requesters().await?;
        let mut out = Vec::with_capacity(requesters.len());
        for requester in requesters {
            match self.recount(&requester.id).await {
                Ok(r) => out.push(r),
                Err(e) => warn!(requester = %requester.id, "recount failed: {e}"),
            }
        }
        Ok(out)
    }
}
