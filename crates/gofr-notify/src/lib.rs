//! Webhook fan-out with a persisted at-most-once delivery log.
//!
//! A (hash, category) pair is notified at most once, ever: the sent log is
//! append-only and guarded by a store-level uniqueness constraint, so
//! overlapping runs cannot double-notify.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gofr_core::{redirect_url, Category};
use gofr_store::{format_ts, Row, SqlParam, StoreClient, StoreError};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "gofr-notify";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("missing required environment variables: {0}")]
    MissingEnv(String),
    #[error("failed to build webhook http client: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Environment variable carrying the endpoint for each notifiable category.
fn env_var_for(category: Category) -> Option<&'static str> {
    match category {
        Category::IvyLeagueCourse => Some("WEBHOOK_IVY_LEAGUE"),
        Category::UdemyCourse => Some("WEBHOOK_UDEMY"),
        Category::ItchioGame => Some("WEBHOOK_ITCHIO"),
        Category::Videogame => Some("WEBHOOK_VIDEOGAME"),
        Category::Dlc => Some("WEBHOOK_DLC"),
        Category::Unknown => None,
    }
}

/// Immutable webhook routing, built and validated once at startup.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    endpoints: HashMap<Category, String>,
    pub redirect_base: String,
    pub send_timeout: Duration,
}

impl WebhookConfig {
    pub fn new(
        endpoints: HashMap<Category, String>,
        redirect_base: impl Into<String>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            endpoints,
            redirect_base: redirect_base.into(),
            send_timeout,
        }
    }

    /// Read every notifiable category's endpoint from the environment.
    ///
    /// All five variables are required; any missing one is a startup error
    /// naming the full missing set.
    pub fn from_env(
        redirect_base: impl Into<String>,
        send_timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let mut endpoints = HashMap::new();
        let mut missing = Vec::new();
        for category in Category::ALL_NOTIFIABLE {
            let name = env_var_for(category).expect("notifiable categories have an env var");
            match std::env::var(name) {
                Ok(url) if !url.trim().is_empty() => {
                    endpoints.insert(category, url);
                }
                _ => missing.push(name),
            }
        }
        if !missing.is_empty() {
            return Err(NotifyError::MissingEnv(missing.join(", ")));
        }
        Ok(Self::new(endpoints, redirect_base, send_timeout))
    }

    pub fn endpoint_for(&self, category: Category) -> Option<&str> {
        self.endpoints.get(&category).map(String::as_str)
    }
}

/// Per-run dispatch tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Scans offer entries in creation order and notifies each configured
/// category endpoint exactly once per (hash, category).
pub struct DeliveryTracker<'a> {
    store: &'a StoreClient,
    config: WebhookConfig,
    http: reqwest::Client,
}

impl<'a> DeliveryTracker<'a> {
    pub fn new(store: &'a StoreClient, config: WebhookConfig) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(config.send_timeout)
            .build()?;
        Ok(Self {
            store,
            config,
            http,
        })
    }

    pub async fn is_sent(&self, hash: &str, category: Category) -> Result<bool, StoreError> {
        let row = self
            .store
            .fetch_optional(
                "SELECT 1 FROM webhook_sent_log WHERE item_hash = ? AND category = ?",
                &[
                    SqlParam::Text(hash.to_string()),
                    SqlParam::Text(category.as_str().to_string()),
                ],
            )
            .await?;
        Ok(row.is_some())
    }

    pub async fn mark_sent(&self, hash: &str, category: Category) -> Result<(), StoreError> {
        self.mark_sent_at(hash, category, Utc::now()).await
    }

    /// Record a delivery. A duplicate insert for the same (hash, category)
    /// means another run already delivered it; that is success, not an error.
    pub async fn mark_sent_at(
        &self,
        hash: &str,
        category: Category,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = self
            .store
            .execute(
                "INSERT INTO webhook_sent_log (item_hash, category, sent_at) VALUES (?, ?, ?)",
                &[
                    SqlParam::Text(hash.to_string()),
                    SqlParam::Text(category.as_str().to_string()),
                    SqlParam::Text(format_ts(now)),
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.is_unique_violation() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Notify every pending entry, oldest first.
    ///
    /// Entries whose category has no configured endpoint are skipped and
    /// left unmarked, so configuring an endpoint later notifies the backlog.
    /// A send is attempted once; win or lose, the entry is marked so it is
    /// never retried. One item's failure never blocks the rest.
    pub async fn dispatch_pending(&self) -> Result<DispatchSummary, NotifyError> {
        let rows = self
            .store
            .fetch_all(
                "SELECT item_hash, category, ad_copy FROM feeds ORDER BY created_at ASC",
                &[],
            )
            .await?;

        let mut summary = DispatchSummary::default();
        for row in rows {
            let hash: String = row.get("item_hash");
            let category = Category::from_token(&row.get::<String, _>("category"));
            let ad_copy: Option<String> = row.get("ad_copy");

            let Some(endpoint) = self.config.endpoint_for(category) else {
                summary.skipped += 1;
                continue;
            };

            match self.is_sent(&hash, category).await {
                Ok(true) => {
                    summary.skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err @ StoreError::Connect { .. }) => {
                    error!(error = %err, "store unreachable, aborting dispatch");
                    return Err(err.into());
                }
                Err(err) => {
                    error!(hash = %hash, error = %err, "failed to check sent log");
                    summary.failed += 1;
                    continue;
                }
            }

            let link = redirect_url(&self.config.redirect_base, &hash);
            let content = match ad_copy {
                Some(copy) => format!("{copy}\n{link}"),
                None => link,
            };

            let delivered = match self
                .http
                .post(endpoint)
                .json(&json!({ "content": content }))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    info!(hash = %hash, category = %category, "webhook notification sent");
                    true
                }
                Ok(resp) => {
                    warn!(hash = %hash, category = %category, status = %resp.status(), "webhook rejected notification");
                    false
                }
                Err(err) => {
                    warn!(hash = %hash, category = %category, error = %err, "webhook send failed");
                    false
                }
            };

            // Single attempt per item: mark regardless of the send outcome
            // so the pair is never notified twice. An unreachable store ends
            // the pass; any other marking error charges this item alone.
            match self.mark_sent(&hash, category).await {
                Ok(()) if delivered => summary.sent += 1,
                Ok(()) => summary.failed += 1,
                Err(err @ StoreError::Connect { .. }) => {
                    error!(error = %err, "store unreachable, aborting dispatch");
                    return Err(err.into());
                }
                Err(err) => {
                    error!(hash = %hash, error = %err, "failed to record delivery");
                    summary.failed += 1;
                }
            }
        }

        info!(
            sent = summary.sent,
            skipped = summary.skipped,
            failed = summary.failed,
            "dispatch pass complete"
        );
        Ok(summary)
    }
}
