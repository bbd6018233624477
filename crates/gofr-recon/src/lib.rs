//! Reconciliation engine and cleanup passes for GOFR.
//!
//! The engine decides, for each incoming offer, whether it is genuinely new
//! (insert), a re-sighting of a known offer inside the freshness window
//! (bump last-seen only), or a legitimate reappearance after expiry (a new
//! independent entry). Cleanup runs separately and owns all deletes.

use chrono::{DateTime, Duration, Utc};
use gofr_core::{AdCopyGenerator, DraftError, Offer, OfferDraft};
use gofr_store::{format_ts, Row, SqlParam, StoreClient, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "gofr-recon";

pub const DEFAULT_FRESHNESS_HOURS: i64 = 24;
pub const DEFAULT_RETENTION_DAYS: i64 = 7;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REDIRECT_BASE: &str = "https://www.goodoffers.theworkpc.com/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(String),
    #[error("environment variable {name} has invalid value {value:?}")]
    Invalid { name: String, value: String },
}

/// Runtime configuration, read once at startup.
///
/// Required values abort startup when absent; only tuning knobs default.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub retention_days: i64,
    pub freshness_hours: i64,
    pub redirect_base: String,
    pub http_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("GOFR_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("GOFR_DATABASE_URL".into()))?;
        Ok(Self {
            database_url,
            retention_days: parse_env("GOFR_RETENTION_DAYS", DEFAULT_RETENTION_DAYS)?,
            freshness_hours: parse_env("GOFR_FRESHNESS_HOURS", DEFAULT_FRESHNESS_HOURS)?,
            redirect_base: std::env::var("GOFR_REDIRECT_BASE")
                .unwrap_or_else(|_| DEFAULT_REDIRECT_BASE.to_string()),
            http_timeout_secs: parse_env("GOFR_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?,
        })
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::hours(self.freshness_hours)
    }

    pub fn retention_horizon(&self) -> Duration {
        Duration::days(self.retention_days)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid offer draft: {0}")]
    Draft(#[from] DraftError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconcileOutcome {
    /// First sighting (or reappearance after expiry); a new row was created.
    Inserted,
    /// Re-sighting inside the freshness window; only last-seen advanced.
    Refreshed,
}

/// Per-batch tally. One bad item never fails the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub inserted: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// The add/update protocol against the store.
///
/// Owns all writes to offer rows; retries live in the store client only.
pub struct ReconcileEngine<'a> {
    store: &'a StoreClient,
    ad_copy: &'a dyn AdCopyGenerator,
    freshness_window: Duration,
}

impl<'a> ReconcileEngine<'a> {
    pub fn new(
        store: &'a StoreClient,
        ad_copy: &'a dyn AdCopyGenerator,
        freshness_window: Duration,
    ) -> Self {
        Self {
            store,
            ad_copy,
            freshness_window,
        }
    }

    pub async fn add_or_refresh(&self, draft: OfferDraft) -> Result<ReconcileOutcome, ReconcileError> {
        self.add_or_refresh_at(draft, Utc::now()).await
    }

    /// As [`Self::add_or_refresh`], with an explicit observation time.
    pub async fn add_or_refresh_at(
        &self,
        draft: OfferDraft,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let offer = draft.validate()?;
        let window_start = format_ts(now - self.freshness_window);

        // Strictly inside the window: a sighting exactly one window after the
        // last one starts a new generation rather than refreshing the old.
        let existing = self
            .store
            .fetch_optional(
                "SELECT id FROM feeds \
                 WHERE item_hash = ? AND last_seen_at > ? \
                 ORDER BY last_seen_at DESC LIMIT 1",
                &[
                    SqlParam::Text(offer.identity_hash.clone()),
                    SqlParam::Text(window_start),
                ],
            )
            .await?;

        match existing {
            Some(row) => {
                let id: i64 = row.get("id");
                self.store
                    .execute(
                        "UPDATE feeds SET last_seen_at = ? WHERE id = ?",
                        &[SqlParam::Text(format_ts(now)), SqlParam::Int(id)],
                    )
                    .await?;
                debug!(hash = %offer.identity_hash, title = %offer.title, "re-sighting, bumped last-seen");
                Ok(ReconcileOutcome::Refreshed)
            }
            None => {
                self.insert_offer(offer, now).await?;
                Ok(ReconcileOutcome::Inserted)
            }
        }
    }

    async fn insert_offer(&self, offer: Offer, now: DateTime<Utc>) -> Result<(), StoreError> {
        let ad_copy = self.ad_copy.generate(offer.category, &offer.title);
        if ad_copy.is_none() {
            warn!(hash = %offer.identity_hash, "ad copy generation failed, inserting without copy");
        }
        let ts = format_ts(now);
        self.store
            .execute(
                "INSERT INTO feeds (category, title, link, description, pub_date, \
                 item_hash, image_url, source_url, ad_copy, \
                 first_seen_at, last_seen_at, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                &[
                    SqlParam::Text(offer.category.as_str().to_string()),
                    SqlParam::Text(offer.title.clone()),
                    SqlParam::Text(offer.link),
                    SqlParam::opt_text(offer.description),
                    SqlParam::Text(format_ts(offer.pub_date)),
                    SqlParam::Text(offer.identity_hash.clone()),
                    SqlParam::opt_text(offer.image_url),
                    SqlParam::Text(offer.source_url),
                    SqlParam::opt_text(ad_copy),
                    SqlParam::Text(ts.clone()),
                    SqlParam::Text(ts.clone()),
                    SqlParam::Text(ts),
                ],
            )
            .await?;
        info!(hash = %offer.identity_hash, title = %offer.title, "inserted new offer");
        Ok(())
    }

    /// Reconcile a whole producer batch, isolating per-item failures.
    ///
    /// Data errors skip the item; store errors fail the item and continue.
    /// Only connection exhaustion aborts the batch.
    pub async fn ingest_batch(
        &self,
        drafts: Vec<OfferDraft>,
    ) -> Result<IngestSummary, StoreError> {
        self.ingest_batch_at(drafts, Utc::now()).await
    }

    pub async fn ingest_batch_at(
        &self,
        drafts: Vec<OfferDraft>,
        now: DateTime<Utc>,
    ) -> Result<IngestSummary, StoreError> {
        let mut summary = IngestSummary::default();
        for draft in drafts {
            let context = format!("{} ({})", draft.title, draft.link);
            match self.add_or_refresh_at(draft, now).await {
                Ok(ReconcileOutcome::Inserted) => summary.inserted += 1,
                Ok(ReconcileOutcome::Refreshed) => summary.refreshed += 1,
                Err(ReconcileError::Draft(err)) => {
                    warn!(item = %context, error = %err, "skipping malformed offer");
                    summary.skipped += 1;
                }
                Err(ReconcileError::Store(err @ StoreError::Connect { .. })) => {
                    error!(item = %context, error = %err, "store unreachable, aborting batch");
                    return Err(err);
                }
                Err(ReconcileError::Store(err)) => {
                    error!(item = %context, error = %err, "failed to reconcile offer");
                    summary.failed += 1;
                }
            }
        }
        info!(
            inserted = summary.inserted,
            refreshed = summary.refreshed,
            skipped = summary.skipped,
            failed = summary.failed,
            "batch reconciled"
        );
        Ok(summary)
    }
}

/// Well under SQLite's default 999 bind-parameter ceiling.
const DELETE_CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeKind {
    AgeBased,
    DuplicateBased,
}

impl PurgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurgeKind::AgeBased => "age_based",
            PurgeKind::DuplicateBased => "duplicate_based",
        }
    }
}

/// Age-based and duplicate-based purge passes.
///
/// Both are idempotent; each relies on single-statement store atomicity and
/// appends one audit row per non-empty purge. Zero-count runs only log.
pub struct CleanupScheduler<'a> {
    store: &'a StoreClient,
    retention_horizon: Duration,
}

impl<'a> CleanupScheduler<'a> {
    pub fn new(store: &'a StoreClient, retention_horizon: Duration) -> Self {
        Self {
            store,
            retention_horizon,
        }
    }

    pub async fn purge_aged(&self) -> Result<u64, StoreError> {
        self.purge_aged_at(Utc::now()).await
    }

    /// Delete every entry created before the retention horizon.
    pub async fn purge_aged_at(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = format_ts(now - self.retention_horizon);
        let removed = self
            .store
            .execute(
                "DELETE FROM feeds WHERE created_at < ?",
                &[SqlParam::Text(cutoff)],
            )
            .await?;

        if removed == 0 {
            info!("no entries older than the retention horizon");
            return Ok(0);
        }

        self.record_audit(now, removed, PurgeKind::AgeBased).await?;
        info!(removed, "purged aged entries");
        Ok(removed)
    }

    pub async fn purge_duplicates(&self) -> Result<u64, StoreError> {
        self.purge_duplicates_at(Utc::now()).await
    }

    /// Within each (title, link) group keep the most-recently-seen row and
    /// delete the rest.
    pub async fn purge_duplicates_at(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let losers = self
            .store
            .fetch_all(
                "WITH ranked AS ( \
                     SELECT id, ROW_NUMBER() OVER ( \
                         PARTITION BY title, link \
                         ORDER BY last_seen_at DESC \
                     ) AS row_num \
                     FROM feeds \
                 ) \
                 SELECT id FROM ranked WHERE row_num > 1",
                &[],
            )
            .await?;

        if losers.is_empty() {
            info!("no duplicate entries found");
            return Ok(0);
        }

        let ids: Vec<SqlParam> = losers
            .iter()
            .map(|row| SqlParam::Int(row.get::<i64, _>("id")))
            .collect();
        // Delete in chunks so the id list never exceeds SQLite's bind limit.
        let mut removed = 0u64;
        for chunk in ids.chunks(DELETE_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            removed += self
                .store
                .execute(
                    &format!("DELETE FROM feeds WHERE id IN ({placeholders})"),
                    chunk,
                )
                .await?;
        }

        self.record_audit(now, removed, PurgeKind::DuplicateBased)
            .await?;
        info!(removed, "purged duplicate entries");
        Ok(removed)
    }

    async fn record_audit(
        &self,
        now: DateTime<Utc>,
        removed: u64,
        kind: PurgeKind,
    ) -> Result<(), StoreError> {
        self.store
            .execute(
                "INSERT INTO cleanup_audit (run_time, entries_removed, kind) VALUES (?, ?, ?)",
                &[
                    SqlParam::Text(format_ts(now)),
                    SqlParam::Int(removed as i64),
                    SqlParam::Text(kind.as_str().to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}
