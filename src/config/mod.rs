//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on missing or malformed values.
//! The database URL is wrapped in `secrecy::SecretString` so it never
//! reaches a log line.

use chrono::Duration;
use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::lease::LeaseConfig;
use crate::reclaim::SweepConfig;

/// Longest lease `LEASE_MINUTES` may ask for: one week.
pub const MAX_LEASE_MINUTES: i64 = 7 * 24 * 60;

/// Where state lives.
#[derive(Debug)]
pub enum Backend {
    /// `DATABASE_URL`.
    Postgres(SecretString),
    /// `LABELQ_STORE_FILE`: single-process JSON snapshot.
    File(PathBuf),
}

#[derive(Debug)]
pub struct Config {
    pub backend: Backend,
    pub lease: LeaseConfig,
    pub sweep: SweepConfig,
    /// Stamped on every label committed by this process.
    pub taxonomy_version: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let backend = match (lookup("DATABASE_URL"), lookup("LABELQ_STORE_FILE")) {
            (Some(url), _) if !url.is_empty() => Backend::Postgres(SecretString::from(url)),
            (_, Some(path)) if !path.is_empty() => Backend::File(PathBuf::from(path)),
            _ => {
                return Err(Error::Config(
                    "set DATABASE_URL or LABELQ_STORE_FILE".to_string(),
                ));
            }
        };

        let lease_minutes: i64 = parsed_var(&lookup, "LEASE_MINUTES", 60)?;
        let candidate_window: i64 = parsed_var(&lookup, "CANDIDATE_WINDOW", 50)?;
        let claim_rounds: u32 = parsed_var(&lookup, "CLAIM_ROUNDS", 3)?;
        let sweep_interval_secs: u64 = parsed_var(&lookup, "SWEEP_INTERVAL_SECS", 300)?;
        let sweep_batch: i64 = parsed_var(&lookup, "SWEEP_BATCH", 500)?;
        let taxonomy_version: u32 = parsed_var(&lookup, "TAXONOMY_VERSION", 1)?;

        positive("LEASE_MINUTES", lease_minutes)?;
        positive("CANDIDATE_WINDOW", candidate_window)?;
        positive("CLAIM_ROUNDS", claim_rounds as i64)?;
        positive("SWEEP_INTERVAL_SECS", sweep_interval_secs as i64)?;
        positive("SWEEP_BATCH", sweep_batch)?;
        positive("TAXONOMY_VERSION", taxonomy_version as i64)?;
        if lease_minutes > MAX_LEASE_MINUTES {
            return Err(Error::Config(format!(
                "LEASE_MINUTES must be at most {MAX_LEASE_MINUTES}, got {lease_minutes}"
            )));
        }

        Ok(Self {
            backend,
            lease: LeaseConfig {
                lease_duration: Duration::minutes(lease_minutes),
                candidate_window,
                claim_rounds,
            },
            sweep: SweepConfig {
                interval: std::time::Duration::from_secs(sweep_interval_secs),
                batch: sweep_batch,
            },
            taxonomy_version,
            otel_endpoint: lookup("OTEL_ENDPOINT").filter(|s| !s.is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parsed_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
    }
}

fn positive(name: &str, value: i64) -> Result<()> {
    if value <= 0 {
        return Err(Error::Config(format!("{name} must be positive, got {value}")));
    }
    Ok(())
}
