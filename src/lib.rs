//! # labelq
//!
//! Task leasing and label commit protocol for photo annotation.
//!
//! Many annotators pull items from a shared pool. Each item is leased to at
//! most one annotator at a time, abandoned leases expire and are reclaimed,
//! and every committed label keeps an append-only revision trail. All
//! coordination goes through single-document conditional writes on a
//! [`store::Store`]; there is no lock manager.

pub mod admin;
pub mod clock;
pub mod commit;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod lease;
pub mod model;
pub mod reclaim;
pub mod stats;
pub mod store;
pub mod telemetry;

use secrecy::ExposeSecret;
use std::sync::Arc;

use config::{Backend, Config};
use error::Result;
use store::{MemoryStore, PgStore, Store};

/// Open the store `config` points at. Postgres stores are migrated first.
pub async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    match &config.backend {
        Backend::Postgres(url) => {
            let store = PgStore::connect(url.expose_secret()).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        Backend::File(path) => Ok(Arc::new(MemoryStore::open(path)?)),
    }
}
