//! Returning expired leases to the pool.
//!
//! Each candidate is released with a conditional write on the exact
//! holder/deadline pair that was read, so a lease renewed or completed in
//! the meantime is left alone. Losing that race is not an error. The sweep
//! never touches requester resume pointers; claims heal those.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info};

use crate::clock::Clock;
use crate::error::Result;
use crate::model::*;
use crate::store::{ItemCondition, ItemTransition, LeaseQuery, Store};
use crate::telemetry::metrics;
use crate::telemetry::protocol::{Timer, record_result, record_transition, start_span};

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Pause between passes of [`Reclaimer::run`].
    pub interval: Duration,
    /// Most leases released per pass.
    pub batch: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch: 500,
        }
    }
}

/// Which deadlines count as reclaimable.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Cutoff {
    /// Deadline before the clock's now.
    #[default]
    Now,
    /// Deadline before this instant.
    At(DateTime<Utc>),
    /// Any lease, expired or not. Operator use only.
    Any,
}

/// Narrows a sweep. The default matches every expired lease.
#[derive(Debug, Clone, Default)]
pub struct SweepFilter {
    pub cutoff: Cutoff,
    pub holder: Option<RequesterId>,
    pub item: Option<ItemId>,
    /// Overrides [`SweepConfig::batch`].
    pub limit: Option<i64>,
}

pub struct Reclaimer {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: SweepConfig,
}

impl Reclaimer {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: SweepConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Release every lease whose deadline is before `now`. Returns how many
    /// were released by this call.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        self.sweep_with(&SweepFilter {
            cutoff: Cutoff::At(now),
            ..Default::default()
        })
        .await
    }

    /// Leases `filter` would release, without releasing them.
    pub async fn candidates(&self, filter: &SweepFilter) -> Result<Vec<Item>> {
        let cutoff = match filter.cutoff {
            Cutoff::Now => Some(self.clock.now()),
            Cutoff::At(at) => Some(at),
            Cutoff::Any => None,
        };

        if let Some(id) = &filter.item {
            let item = self.store.get_item(id).await?;
            return Ok(item
                .filter(|item| match item.lease() {
                    Some((holder, deadline)) => {
                        cutoff.is_none_or(|c| deadline < c)
                            && filter.holder.as_ref().is_none_or(|h| h == holder)
                    }
                    None => false,
                })
                .into_iter()
                .collect());
        }

        self.store
            .list_leases(&LeaseQuery {
                cutoff,
                holder: filter.holder.clone(),
                limit: filter.limit.unwrap_or(self.config.batch),
            })
            .await
    }

    pub async fn sweep_with(&self, filter: &SweepFilter) -> Result<usize> {
        let _timer = Timer::start("sweep");
        let span = start_span(
            "sweep",
            filter.holder.as_ref().map(|h| h.as_str()),
            filter.item.as_ref().map(|i| i.as_str()),
        );

        let reclaimed = async {
            let candidates = self.candidates(filter).await?;
            let mut reclaimed = 0usize;
            for item in candidates {
                let Some((holder, deadline)) = item.lease() else {
                    continue;
                };
                let condition = ItemCondition::LeasedUntil {
                    holder: holder.clone(),
                    deadline,
                };
                let now = self.clock.now();
                if self
                    .store
                    .transition_item(&item.id, &condition, &ItemTransition::Release, now)
                    .await?
                {
                    reclaimed += 1;
                    record_transition(&span, item.id.as_str(), "leased", "unassigned");
                    info!(item = %item.id, holder = %holder, deadline = %deadline, "lease reclaimed");
                } else {
                    metrics::cas_lost().add(1, &[KeyValue::new("transition", "reclaim")]);
                    debug!(item = %item.id, "lease changed before reclaim");
                }
            }
            Ok::<_, crate::error::Error>(reclaimed)
        }
        .instrument(span.clone())
        .await?;

        record_result(&span, &reclaimed.to_string());
        metrics::leases_reclaimed().add(reclaimed as u64, &[]);
        Ok(reclaimed)
    }

    /// Sweep on a fixed interval until `shutdown` is notified. A failed pass
    /// is logged and the loop carries on.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch = self.config.batch,
            "reclaimer started"
        );

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("reclaimer shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            match self.sweep(self.clock.now()).await {
                Ok(0) => debug!("sweep found nothing to reclaim"),
                Ok(n) => info!(reclaimed = n, "sweep pass complete"),
                Err(e) => error!("sweep failed: {e}"),
            }
        }
    }
}
