//! SQLite-backed Delta ledger.
//!
//! Single writer discipline is delegated to SQLite; readers never block on
//! writers thanks to WAL mode. All writes go through the idempotent
//! [`DeltaStore::upsert`].

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::types::{
    DeltaAction, DeltaQuery, DeltaRecord, DeltaSummary, NewDeltaRecord, StoreStats, UpsertOutcome,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("delta record must carry at least one delta value")]
    EmptyRecord,

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone)]
pub struct DeltaStore {
    pool: SqlitePool,
}

impl DeltaStore {
    /// Opens (creating if needed) the ledger at `database_url` and runs
    /// migrations. WAL keeps readers from blocking behind writers.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(url = database_url, "delta store ready");
        Ok(Self { pool })
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same database.
    pub async fn connect_in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Idempotent append.
    ///
    /// When the latest row with the same `(account, instrument,
    /// correlation_id, action)` key carries identical logical content the
    /// write is a no-op; otherwise a new row is appended with a fresh
    /// `created_at`. Both the engine (post-fill) and the position poller may
    /// attempt equivalent `observe` writes, so this is load-bearing.
    pub async fn upsert(&self, record: NewDeltaRecord) -> StoreResult<UpsertOutcome> {
        if !record.has_delta() {
            return Err(StoreError::EmptyRecord);
        }

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r"
            SELECT id, target_delta, move_position_delta, observed_delta, order_id
            FROM delta_records
            WHERE account_id = ?1
              AND instrument_id = ?2
              AND (correlation_id = ?3 OR (correlation_id IS NULL AND ?3 IS NULL))
              AND action = ?4
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            ",
        )
        .bind(&record.account_id)
        .bind(&record.instrument_id)
        .bind(&record.correlation_id)
        .bind(record.action.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let same = row.get::<Option<f64>, _>("target_delta") == record.target_delta
                && row.get::<Option<f64>, _>("move_position_delta") == record.move_position_delta
                && row.get::<Option<f64>, _>("observed_delta") == record.observed_delta
                && row.get::<Option<String>, _>("order_id") == record.order_id;
            if same {
                let id: i64 = row.get("id");
                tx.commit().await?;
                debug!(id, "delta upsert unchanged");
                return Ok(UpsertOutcome::Unchanged(id));
            }
        }

        let created_at = Utc::now();
        let result = sqlx::query(
            r"
            INSERT INTO delta_records (
                account_id, instrument_id, correlation_id, tv_signal_id, action,
                target_delta, move_position_delta, observed_delta, order_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
        )
        .bind(&record.account_id)
        .bind(&record.instrument_id)
        .bind(&record.correlation_id)
        .bind(&record.tv_signal_id)
        .bind(record.action.as_str())
        .bind(record.target_delta)
        .bind(record.move_position_delta)
        .bind(record.observed_delta)
        .bind(&record.order_id)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        let id = result.last_insert_rowid();
        debug!(
            id,
            account = %record.account_id,
            instrument = %record.instrument_id,
            action = %record.action,
            "delta record appended"
        );
        Ok(UpsertOutcome::Inserted(id))
    }

    /// Records for one account, newest first, filtered and paged.
    pub async fn by_account(&self, account_id: &str, query: &DeltaQuery) -> StoreResult<Vec<DeltaRecord>> {
        let mut sql = String::from(
            "SELECT id, account_id, instrument_id, correlation_id, tv_signal_id, action, \
             target_delta, move_position_delta, observed_delta, order_id, created_at \
             FROM delta_records WHERE account_id = ?",
        );
        if query.from.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if query.to.is_some() {
            sql.push_str(" AND created_at <= ?");
        }
        if !query.actions.is_empty() {
            sql.push_str(" AND action IN (");
            sql.push_str(&vec!["?"; query.actions.len()].join(", "));
            sql.push(')');
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql).bind(account_id);
        if let Some(from) = query.from {
            q = q.bind(from);
        }
        if let Some(to) = query.to {
            q = q.bind(to);
        }
        for action in &query.actions {
            q = q.bind(action.as_str());
        }
        q = q
            .bind(i64::from(query.limit.unwrap_or(100)))
            .bind(i64::from(query.offset.unwrap_or(0)));

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Latest record for an instrument, regardless of action.
    pub async fn latest_by_instrument(
        &self,
        account_id: &str,
        instrument_id: &str,
    ) -> StoreResult<Option<DeltaRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, account_id, instrument_id, correlation_id, tv_signal_id, action,
                   target_delta, move_position_delta, observed_delta, order_id, created_at
            FROM delta_records
            WHERE account_id = ?1 AND instrument_id = ?2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            ",
        )
        .bind(account_id)
        .bind(instrument_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Latest observed delta for an instrument, used by the position poller
    /// to decide whether a move is worth recording.
    pub async fn latest_observed_delta(
        &self,
        account_id: &str,
        instrument_id: &str,
    ) -> StoreResult<Option<f64>> {
        let row = sqlx::query(
            r"
            SELECT observed_delta
            FROM delta_records
            WHERE account_id = ?1 AND instrument_id = ?2 AND observed_delta IS NOT NULL
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            ",
        )
        .bind(account_id)
        .bind(instrument_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| r.get::<Option<f64>, _>("observed_delta")))
    }

    /// Latest target delta for an instrument (for breach detection).
    pub async fn latest_target_delta(
        &self,
        account_id: &str,
        instrument_id: &str,
    ) -> StoreResult<Option<f64>> {
        let row = sqlx::query(
            r"
            SELECT target_delta
            FROM delta_records
            WHERE account_id = ?1 AND instrument_id = ?2
              AND action = 'target' AND target_delta IS NOT NULL
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            ",
        )
        .bind(account_id)
        .bind(instrument_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| r.get::<Option<f64>, _>("target_delta")))
    }

    /// Aggregate summary over a time range.
    pub async fn summary(
        &self,
        account_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<DeltaSummary> {
        let counts = sqlx::query(
            r"
            SELECT action, COUNT(*) AS n
            FROM delta_records
            WHERE account_id = ?1 AND created_at >= ?2 AND created_at <= ?3
            GROUP BY action
            ORDER BY action
            ",
        )
        .bind(account_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut count_by_action = Vec::with_capacity(counts.len());
        for row in &counts {
            let action: String = row.get("action");
            if let Ok(action) = action.parse::<DeltaAction>() {
                let n: i64 = row.get("n");
                count_by_action.push((action, u64::try_from(n).unwrap_or(0)));
            }
        }

        let net: Option<f64> = sqlx::query_scalar(
            r"
            SELECT SUM(observed_delta)
            FROM delta_records d
            WHERE d.account_id = ?1
              AND d.created_at >= ?2 AND d.created_at <= ?3
              AND d.observed_delta IS NOT NULL
              AND d.id = (
                  SELECT d2.id FROM delta_records d2
                  WHERE d2.account_id = d.account_id
                    AND d2.instrument_id = d.instrument_id
                    AND d2.observed_delta IS NOT NULL
                    AND d2.created_at >= ?2 AND d2.created_at <= ?3
                  ORDER BY d2.created_at DESC, d2.id DESC
                  LIMIT 1
              )
            ",
        )
        .bind(account_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;

        let last_updated: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM delta_records WHERE account_id = ?1 \
             AND created_at >= ?2 AND created_at <= ?3",
        )
        .bind(account_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;

        Ok(DeltaSummary {
            count_by_action,
            net_observed_delta: net.unwrap_or(0.0),
            last_updated,
        })
    }

    /// Whole-store statistics for the operator surface.
    pub async fn stats(&self) -> StoreResult<StoreStats> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delta_records")
            .fetch_one(&self.pool)
            .await?;

        let counts = sqlx::query(
            "SELECT action, COUNT(*) AS n FROM delta_records GROUP BY action ORDER BY action",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut count_by_action = Vec::with_capacity(counts.len());
        for row in &counts {
            let action: String = row.get("action");
            if let Ok(action) = action.parse::<DeltaAction>() {
                let n: i64 = row.get("n");
                count_by_action.push((action, u64::try_from(n).unwrap_or(0)));
            }
        }

        let accounts: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT account_id FROM delta_records ORDER BY account_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let instruments: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT instrument_id FROM delta_records ORDER BY instrument_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(StoreStats {
            total_records: u64::try_from(total).unwrap_or(0),
            count_by_action,
            accounts,
            instruments,
        })
    }

    /// Deletes records older than `days`; returns the number removed.
    pub async fn prune_older_than(&self, days: u32) -> StoreResult<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let result = sqlx::query("DELETE FROM delta_records WHERE created_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Test hook: appends a row with an explicit timestamp.
    #[doc(hidden)]
    pub async fn insert_backdated(
        &self,
        record: NewDeltaRecord,
        created_at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let result = sqlx::query(
            r"
            INSERT INTO delta_records (
                account_id, instrument_id, correlation_id, tv_signal_id, action,
                target_delta, move_position_delta, observed_delta, order_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
        )
        .bind(&record.account_id)
        .bind(&record.instrument_id)
        .bind(&record.correlation_id)
        .bind(&record.tv_signal_id)
        .bind(record.action.as_str())
        .bind(record.target_delta)
        .bind(record.move_position_delta)
        .bind(record.observed_delta)
        .bind(&record.order_id)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> StoreResult<DeltaRecord> {
    let action: String = row.get("action");
    let action = action
        .parse::<DeltaAction>()
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(e.into())))?;
    Ok(DeltaRecord {
        id: row.get("id"),
        account_id: row.get("account_id"),
        instrument_id: row.get("instrument_id"),
        correlation_id: row.get("correlation_id"),
        tv_signal_id: row.get("tv_signal_id"),
        action,
        target_delta: row.get("target_delta"),
        move_position_delta: row.get("move_position_delta"),
        observed_delta: row.get("observed_delta"),
        order_id: row.get("order_id"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observe(account: &str, instrument: &str, delta: f64) -> NewDeltaRecord {
        NewDeltaRecord {
            account_id: account.to_string(),
            instrument_id: instrument.to_string(),
            correlation_id: None,
            tv_signal_id: None,
            action: DeltaAction::Observe,
            target_delta: None,
            move_position_delta: None,
            observed_delta: Some(delta),
            order_id: None,
        }
    }

    fn target(account: &str, instrument: &str, correlation: &str, delta: f64) -> NewDeltaRecord {
        NewDeltaRecord {
            account_id: account.to_string(),
            instrument_id: instrument.to_string(),
            correlation_id: Some(correlation.to_string()),
            tv_signal_id: None,
            action: DeltaAction::Target,
            target_delta: Some(delta),
            move_position_delta: None,
            observed_delta: None,
            order_id: None,
        }
    }

    #[tokio::test]
    async fn upsert_with_identical_content_is_noop() {
        let store = DeltaStore::connect_in_memory().await.unwrap();

        let first = store.upsert(observe("a", "X", 0.30)).await.unwrap();
        let second = store.upsert(observe("a", "X", 0.30)).await.unwrap();

        assert!(matches!(first, UpsertOutcome::Inserted(_)));
        assert_eq!(second, UpsertOutcome::Unchanged(first.id()));

        let records = store.by_account("a", &DeltaQuery::default()).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn upsert_with_changed_content_appends() {
        let store = DeltaStore::connect_in_memory().await.unwrap();

        store.upsert(observe("a", "X", 0.30)).await.unwrap();
        store.upsert(observe("a", "X", 0.35)).await.unwrap();

        let records = store.by_account("a", &DeltaQuery::default()).await.unwrap();
        assert_eq!(records.len(), 2);
        // Newest first.
        assert_eq!(records[0].observed_delta, Some(0.35));
    }

    #[tokio::test]
    async fn record_without_any_delta_is_rejected() {
        let store = DeltaStore::connect_in_memory().await.unwrap();
        let mut record = observe("a", "X", 0.0);
        record.observed_delta = None;
        assert!(matches!(
            store.upsert(record).await,
            Err(StoreError::EmptyRecord)
        ));
    }

    #[tokio::test]
    async fn by_account_filters_on_action_and_pages() {
        let store = DeltaStore::connect_in_memory().await.unwrap();
        store.upsert(observe("a", "X", 0.10)).await.unwrap();
        store.upsert(target("a", "X", "s1", 0.30)).await.unwrap();
        store.upsert(observe("b", "Y", 0.20)).await.unwrap();

        let query = DeltaQuery {
            actions: vec![DeltaAction::Target],
            ..DeltaQuery::default()
        };
        let targets = store.by_account("a", &query).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].action, DeltaAction::Target);

        let paged = store
            .by_account(
                "a",
                &DeltaQuery {
                    limit: Some(1),
                    offset: Some(1),
                    ..DeltaQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
    }

    #[tokio::test]
    async fn latest_by_instrument_returns_newest() {
        let store = DeltaStore::connect_in_memory().await.unwrap();
        store.upsert(observe("a", "X", 0.10)).await.unwrap();
        store.upsert(observe("a", "X", 0.20)).await.unwrap();

        let latest = store.latest_by_instrument("a", "X").await.unwrap().unwrap();
        assert_eq!(latest.observed_delta, Some(0.20));

        assert!(store.latest_by_instrument("a", "missing").await.unwrap().is_none());
        assert_eq!(store.latest_observed_delta("a", "X").await.unwrap(), Some(0.20));
    }

    #[tokio::test]
    async fn summary_counts_and_nets_latest_observations() {
        let store = DeltaStore::connect_in_memory().await.unwrap();
        store.upsert(observe("a", "X", 0.10)).await.unwrap();
        store.upsert(observe("a", "X", 0.30)).await.unwrap();
        store.upsert(observe("a", "Y", -0.20)).await.unwrap();
        store.upsert(target("a", "X", "s1", 0.30)).await.unwrap();

        let from = Utc::now() - Duration::hours(1);
        let to = Utc::now() + Duration::hours(1);
        let summary = store.summary("a", from, to).await.unwrap();

        // Net = latest X (0.30) + latest Y (-0.20).
        assert!((summary.net_observed_delta - 0.10).abs() < 1e-9);
        assert!(summary
            .count_by_action
            .iter()
            .any(|(action, n)| *action == DeltaAction::Observe && *n == 3));
        assert!(summary.last_updated.is_some());
    }

    #[tokio::test]
    async fn prune_removes_only_old_rows() {
        let store = DeltaStore::connect_in_memory().await.unwrap();
        store
            .insert_backdated(observe("a", "X", 0.10), Utc::now() - Duration::days(120))
            .await
            .unwrap();
        store.upsert(observe("a", "X", 0.20)).await.unwrap();

        let removed = store.prune_older_than(90).await.unwrap();
        assert_eq!(removed, 1);

        let records = store.by_account("a", &DeltaQuery::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].observed_delta, Some(0.20));
    }

    #[tokio::test]
    async fn stats_reports_distinct_accounts_and_instruments() {
        let store = DeltaStore::connect_in_memory().await.unwrap();
        store.upsert(observe("a", "X", 0.10)).await.unwrap();
        store.upsert(observe("b", "Y", 0.20)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.accounts, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(stats.instruments, vec!["X".to_string(), "Y".to_string()]);
    }
}
