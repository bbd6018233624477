//! Remote-store connection management for GOFR.
//!
//! Every store mutation in the system funnels through [`StoreClient`], so
//! every caller inherits the same bounded retry policy and transparent
//! reconnection on transport faults.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection};
use sqlx::{query::Query, ConnectOptions, Connection, Sqlite};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use sqlx::sqlite::SqliteRow;
pub use sqlx::Row;

pub const CRATE_NAME: &str = "gofr-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store connection after {attempts} attempts: {source}")]
    Connect {
        attempts: usize,
        source: sqlx::Error,
    },
    #[error("store query failed: {source}")]
    Query { source: sqlx::Error },
    #[error("invalid store URL: {source}")]
    Url { source: sqlx::Error },
    #[error("invalid timestamp in store: {0}")]
    Timestamp(String),
}

impl StoreError {
    /// True when the underlying failure is a UNIQUE constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Query { source } => source
                .as_database_error()
                .map(|db| db.is_unique_violation())
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Transport-class faults invalidate the cached handle; anything else is a
/// plain query error and is not retried.
pub fn is_transport_fault(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Bounded linear backoff: attempt N (1-based) waits N × base delay.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        self.base_delay.saturating_mul(attempt_index as u32 + 1)
    }
}

/// A positional bind parameter for a runtime-built query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Null,
}

impl SqlParam {
    pub fn opt_text(value: Option<String>) -> Self {
        match value {
            Some(v) => SqlParam::Text(v),
            None => SqlParam::Null,
        }
    }
}

fn build_query<'q>(sql: &'q str, params: &'q [SqlParam]) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            SqlParam::Text(v) => query.bind(v.as_str()),
            SqlParam::Int(v) => query.bind(*v),
            SqlParam::Null => query.bind(Option::<String>::None),
        };
    }
    query
}

#[derive(Clone, Copy)]
enum QueryMode {
    Execute,
    FetchAll,
    FetchOptional,
}

enum QueryOutput {
    Affected(u64),
    Rows(Vec<SqliteRow>),
    OptionalRow(Option<SqliteRow>),
}

/// Lazily-connected store client.
///
/// The connection is created on first use and recreated after any
/// transport-class fault, which recovers transparently from idle-timeout
/// disconnects between cron invocations.
pub struct StoreClient {
    url: String,
    backoff: BackoffPolicy,
    conn: Mutex<Option<SqliteConnection>>,
}

impl StoreClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_backoff(url, BackoffPolicy::default())
    }

    pub fn with_backoff(url: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            url: url.into(),
            backoff,
            conn: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn open_connection(&self) -> Result<SqliteConnection, StoreError> {
        let options = SqliteConnectOptions::from_str(&self.url)
            .map_err(|source| StoreError::Url { source })?
            .create_if_missing(true);

        let mut last_err: Option<sqlx::Error> = None;
        for attempt in 0..self.backoff.max_attempts {
            match options.connect().await {
                Ok(conn) => {
                    debug!(url = %self.url, "store connection established");
                    return Ok(conn);
                }
                Err(err) => {
                    warn!(attempt = attempt + 1, error = %err, "store connection attempt failed");
                    last_err = Some(err);
                    if attempt + 1 < self.backoff.max_attempts {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        Err(StoreError::Connect {
            attempts: self.backoff.max_attempts,
            source: last_err.expect("at least one connection attempt was made"),
        })
    }

    async fn run(
        &self,
        sql: &str,
        params: &[SqlParam],
        mode: QueryMode,
    ) -> Result<QueryOutput, StoreError> {
        let mut guard = self.conn.lock().await;
        let mut last_transport: Option<sqlx::Error> = None;

        for attempt in 0..self.backoff.max_attempts {
            if guard.is_none() {
                *guard = Some(self.open_connection().await?);
            }
            let conn = guard.as_mut().expect("connection slot populated above");

            let query = build_query(sql, params);
            let result = match mode {
                QueryMode::Execute => query
                    .execute(&mut *conn)
                    .await
                    .map(|r| QueryOutput::Affected(r.rows_affected())),
                QueryMode::FetchAll => query.fetch_all(&mut *conn).await.map(QueryOutput::Rows),
                QueryMode::FetchOptional => query
                    .fetch_optional(&mut *conn)
                    .await
                    .map(QueryOutput::OptionalRow),
            };

            match result {
                Ok(output) => return Ok(output),
                Err(err) if is_transport_fault(&err) => {
                    warn!(attempt = attempt + 1, error = %err, "transport fault, discarding store handle");
                    *guard = None;
                    last_transport = Some(err);
                    if attempt + 1 < self.backoff.max_attempts {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    }
                }
                Err(err) => return Err(StoreError::Query { source: err }),
            }
        }

        Err(StoreError::Query {
            source: last_transport.expect("retry loop captured a transport fault"),
        })
    }

    /// Run a mutation; returns the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, StoreError> {
        match self.run(sql, params, QueryMode::Execute).await? {
            QueryOutput::Affected(n) => Ok(n),
            _ => unreachable!("execute mode always yields an affected-row count"),
        }
    }

    pub async fn fetch_all(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<SqliteRow>, StoreError> {
        match self.run(sql, params, QueryMode::FetchAll).await? {
            QueryOutput::Rows(rows) => Ok(rows),
            _ => unreachable!("fetch-all mode always yields rows"),
        }
    }

    pub async fn fetch_optional(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Option<SqliteRow>, StoreError> {
        match self.run(sql, params, QueryMode::FetchOptional).await? {
            QueryOutput::OptionalRow(row) => Ok(row),
            _ => unreachable!("fetch-optional mode always yields an optional row"),
        }
    }

    /// Release the cached handle if one is held; a no-op otherwise.
    pub async fn close(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            if let Err(err) = conn.close().await {
                warn!(error = %err, "error closing store connection");
            }
        }
    }

    /// Create the schema if absent. Idempotent.
    ///
    /// `feeds` deliberately carries no unique constraint on `item_hash`:
    /// the freshness-window model allows a new generation of the same hash
    /// once the previous one has aged past the window.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for ddl in [FEEDS_DDL, WEBHOOK_SENT_LOG_DDL, CLEANUP_AUDIT_DDL] {
            self.execute(ddl, &[]).await?;
        }
        Ok(())
    }
}

const FEEDS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS feeds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    title TEXT NOT NULL,
    link TEXT NOT NULL,
    description TEXT,
    pub_date TEXT NOT NULL,
    item_hash TEXT NOT NULL,
    image_url TEXT,
    source_url TEXT,
    ad_copy TEXT,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    created_at TEXT NOT NULL
)
"#;

const WEBHOOK_SENT_LOG_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS webhook_sent_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_hash TEXT NOT NULL,
    category TEXT NOT NULL,
    sent_at TEXT NOT NULL,
    UNIQUE(item_hash, category)
)
"#;

const CLEANUP_AUDIT_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS cleanup_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_time TEXT NOT NULL,
    entries_removed INTEGER NOT NULL,
    kind TEXT NOT NULL
)
"#;

/// Render a timestamp for a TEXT column.
///
/// Fixed-width RFC 3339 with microseconds and a `Z` suffix, so lexicographic
/// comparison in SQL matches chronological order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Timestamp(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn test_client(dir: &tempfile::TempDir) -> StoreClient {
        let url = format!("sqlite://{}", dir.path().join("store.db").display());
        StoreClient::with_backoff(
            url,
            BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(300));
    }

    #[test]
    fn transport_faults_are_classified() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_transport_fault(&io));
        assert!(is_transport_fault(&sqlx::Error::Protocol("bad frame".into())));
        assert!(!is_transport_fault(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn timestamps_round_trip_and_sort_textually() {
        let earlier = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let later = earlier + chrono::Duration::seconds(1);
        let a = format_ts(earlier);
        let b = format_ts(later);
        assert!(a < b);
        assert_eq!(parse_ts(&a).unwrap(), earlier);
        assert!(parse_ts("not-a-timestamp").is_err());
    }

    #[tokio::test]
    async fn close_without_connection_is_a_noop() {
        let dir = tempdir().expect("tempdir");
        let client = test_client(&dir);
        client.close().await;
        client.close().await;
    }

    #[tokio::test]
    async fn migrate_is_idempotent_and_queries_round_trip() {
        let dir = tempdir().expect("tempdir");
        let client = test_client(&dir);
        client.migrate().await.expect("first migrate");
        client.migrate().await.expect("second migrate");

        let now = format_ts(Utc::now());
        let affected = client
            .execute(
                "INSERT INTO cleanup_audit (run_time, entries_removed, kind) VALUES (?, ?, ?)",
                &[
                    SqlParam::Text(now.clone()),
                    SqlParam::Int(4),
                    SqlParam::Text("age_based".into()),
                ],
            )
            .await
            .expect("insert");
        assert_eq!(affected, 1);

        let row = client
            .fetch_optional(
                "SELECT entries_removed, kind FROM cleanup_audit WHERE run_time = ?",
                &[SqlParam::Text(now)],
            )
            .await
            .expect("fetch")
            .expect("row present");
        assert_eq!(row.get::<i64, _>("entries_removed"), 4);
        assert_eq!(row.get::<String, _>("kind"), "age_based");

        client.close().await;
    }

    #[tokio::test]
    async fn duplicate_sent_log_insert_is_a_unique_violation() {
        let dir = tempdir().expect("tempdir");
        let client = test_client(&dir);
        client.migrate().await.expect("migrate");

        let params = [
            SqlParam::Text("abc1234".into()),
            SqlParam::Text("Videogame".into()),
            SqlParam::Text(format_ts(Utc::now())),
        ];
        let sql = "INSERT INTO webhook_sent_log (item_hash, category, sent_at) VALUES (?, ?, ?)";
        client.execute(sql, &params).await.expect("first insert");
        let err = client.execute(sql, &params).await.expect_err("duplicate");
        assert!(err.is_unique_violation());

        client.close().await;
    }

    #[tokio::test]
    async fn unresolvable_store_url_exhausts_attempts() {
        let client = StoreClient::with_backoff(
            "sqlite:///nonexistent-root-dir/gofr/store.db",
            BackoffPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
            },
        );
        let err = client
            .execute("SELECT 1", &[])
            .await
            .expect_err("connection must fail");
        assert!(matches!(err, StoreError::Connect { attempts: 2, .. }));
    }
}
