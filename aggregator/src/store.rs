//! SQLite-backed mirror tables.
//!
//! Every mirrored entity is a [`Record`]. Aggregation replaces a table's
//! whole content inside one transaction, so a reader sees either the old set
//! or the new set and never a mix of both.

use crate::pagination::PaginationFilter;
use serde::Serialize;
use sqlx::query_builder::Separated;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// Keeps bulk inserts well under SQLite's bound-parameter limit.
const INSERT_CHUNK: usize = 100;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub trait Record:
    for<'r> FromRow<'r, SqliteRow> + Serialize + Send + Sync + Unpin + 'static
{
    /// Human readable kind, used in not-found errors.
    const KIND: &'static str;
    const TABLE: &'static str;
    const KEY: &'static str;
    /// Column order used by [`Record::bind_row`].
    const COLUMNS: &'static [&'static str];

    fn key(&self) -> &str;

    fn bind_row<'args>(&self, row: &mut Separated<'_, 'args, Sqlite, &'static str>);
}

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
    migrated: Arc<AtomicBool>,
}

impl Store {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        // WAL lets a read transaction keep its snapshot while a replace commits.
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Store {
            pool,
            migrated: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A migrated private database living as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A single connection that is never recycled; closing it drops the data.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Store {
            pool,
            migrated: Arc::new(AtomicBool::new(false)),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        self.migrated.store(true, Ordering::Relaxed);
        tracing::info!("store migrations applied");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.migrated.load(Ordering::Relaxed)
    }

    /// Replaces the whole table with `rows` in one transaction.
    ///
    /// Rows sharing a key collapse to the last one. If any statement fails the
    /// transaction is dropped and rolled back.
    pub async fn replace_all<R: Record>(&self, rows: &[R]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(&format!("DELETE FROM {}", R::TABLE))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let insert = format!(
            "INSERT OR REPLACE INTO {} ({}) ",
            R::TABLE,
            R::COLUMNS.join(", ")
        );
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new(insert.as_str());
            builder.push_values(chunk, |mut row, record| record.bind_row(&mut row));
            builder.build().execute(&mut *tx).await?;
        }

        let count = count_on::<R>(&mut tx).await?;
        tx.commit().await?;

        tracing::debug!(table = R::TABLE, deleted, inserted = count, "table replaced");
        Ok(count)
    }

    pub async fn purge<R: Record>(&self) -> Result<u64, StoreError> {
        let deleted = sqlx::query(&format!("DELETE FROM {}", R::TABLE))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    pub async fn count<R: Record>(&self) -> Result<u64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        count_on::<R>(&mut conn).await
    }

    pub async fn page<R: Record>(&self, filter: &PaginationFilter) -> Result<Vec<R>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        page_on::<R>(&mut conn, filter).await
    }

    /// One page and the total row count, read from the same snapshot.
    pub async fn page_with_count<R: Record>(
        &self,
        filter: &PaginationFilter,
    ) -> Result<(Vec<R>, u64), StoreError> {
        let mut tx = self.pool.begin().await?;
        let total = count_on::<R>(&mut tx).await?;
        let rows = page_on::<R>(&mut tx, filter).await?;
        tx.commit().await?;
        Ok((rows, total))
    }

    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), StoreError> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn get<R: Record>(&self, key: &str) -> Result<Option<R>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            R::COLUMNS.join(", "),
            R::TABLE,
            R::KEY
        );
        let row = sqlx::query_as::<_, R>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

async fn count_on<R: Record>(conn: &mut SqliteConnection) -> Result<u64, StoreError> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", R::TABLE))
        .fetch_one(conn)
        .await?;
    Ok(u64::try_from(count).unwrap_or_default())
}

async fn page_on<R: Record>(
    conn: &mut SqliteConnection,
    filter: &PaginationFilter,
) -> Result<Vec<R>, StoreError> {
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {} LIMIT ? OFFSET ?",
        R::COLUMNS.join(", "),
        R::TABLE,
        R::KEY
    );
    let rows = sqlx::query_as::<_, R>(&sql)
        .bind(i64::from(filter.page_size()))
        .bind(i64::try_from(filter.offset()).unwrap_or(i64::MAX))
        .fetch_all(conn)
        .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CmdbUser, LegacyConnection};
    use chrono::{TimeZone, Utc};

    fn user(id: &str, name: &str) -> CmdbUser {
        CmdbUser {
            sys_id: id.into(),
            user_name: name.into(),
            email: Some(format!("{name}@example.com")),
            first_name: None,
            last_name: None,
            active: true,
            aggregated_at: Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn replace_all_swaps_the_whole_set() {
        let store = Store::in_memory().await.unwrap();
        assert!(store.is_ready());

        store
            .replace_all(&[user("1", "ann"), user("2", "bob")])
            .await
            .unwrap();
        assert_eq!(store.count::<CmdbUser>().await.unwrap(), 2);

        let inserted = store.replace_all(&[user("3", "cid")]).await.unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(store.get::<CmdbUser>("1").await.unwrap(), None);
        assert_eq!(store.get::<CmdbUser>("3").await.unwrap(), Some(user("3", "cid")));

        // Other tables are untouched.
        assert_eq!(store.count::<LegacyConnection>().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn large_sets_are_inserted_in_chunks() {
        let store = Store::in_memory().await.unwrap();
        let users: Vec<_> = (0..(INSERT_CHUNK * 2 + 7))
            .map(|i| user(&format!("{i:04}"), &format!("user{i}")))
            .collect();

        assert_eq!(store.replace_all(&users).await.unwrap(), 207);
    }

    #[tokio::test]
    async fn duplicate_keys_collapse() {
        let store = Store::in_memory().await.unwrap();
        let inserted = store
            .replace_all(&[user("1", "ann"), user("1", "ann-renamed")])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(
            store.get::<CmdbUser>("1").await.unwrap().unwrap().user_name,
            "ann-renamed"
        );
    }

    #[tokio::test]
    async fn pages_are_ordered_by_key() {
        let store = Store::in_memory().await.unwrap();
        let users: Vec<_> = (0..25).map(|i| user(&format!("{i:02}"), "u")).collect();
        store.replace_all(&users).await.unwrap();

        let filter = PaginationFilter::new(3, 10, 50);
        let page = store.page::<CmdbUser>(&filter).await.unwrap();
        let ids: Vec<_> = page.iter().map(|u| u.sys_id.as_str()).collect();
        assert_eq!(ids, ["20", "21", "22", "23", "24"]);

        let clamped = PaginationFilter::new(1, 1000, 7);
        assert_eq!(store.page::<CmdbUser>(&clamped).await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn purge_empties_the_table() {
        let store = Store::in_memory().await.unwrap();
        store
            .replace_all(&[user("1", "ann"), user("2", "bob")])
            .await
            .unwrap();
        assert_eq!(store.purge::<CmdbUser>().await.unwrap(), 2);
        assert_eq!(store.count::<CmdbUser>().await.unwrap(), 0);
        assert_eq!(store.purge::<CmdbUser>().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_insert_keeps_the_previous_set() {
        let store = Store::in_memory().await.unwrap();
        store
            .replace_all(&[user("1", "ann"), user("2", "bob")])
            .await
            .unwrap();
        store
            .execute_raw(
                "CREATE TRIGGER reject_user BEFORE INSERT ON cmdb_users \
                 WHEN NEW.sys_id = 'reject' BEGIN SELECT RAISE(ABORT, 'rejected'); END",
            )
            .await
            .unwrap();

        // The rejected row sits in the second chunk, after the delete and a
        // successful first insert.
        let mut users: Vec<_> = (0..INSERT_CHUNK + 20)
            .map(|i| user(&format!("n{i:04}"), "new"))
            .collect();
        users[INSERT_CHUNK + 5] = user("reject", "bad");

        let err = store.replace_all(&users).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));

        assert_eq!(store.count::<CmdbUser>().await.unwrap(), 2);
        assert_eq!(store.get::<CmdbUser>("1").await.unwrap(), Some(user("1", "ann")));
        assert_eq!(store.get::<CmdbUser>("n0000").await.unwrap(), None);
    }

    #[tokio::test]
    async fn page_and_count_come_from_one_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("mirror.db").display());
        let store = Store::connect(&url, 2).await.unwrap();
        store.migrate().await.unwrap();
        store
            .replace_all(&[user("1", "ann"), user("2", "bob")])
            .await
            .unwrap();

        let filter = PaginationFilter::new(1, 10, 50);
        let newer: Vec<_> = (0..30).map(|i| user(&format!("n{i:02}"), "new")).collect();

        // A replace commits between the count and the page of an open read.
        let mut tx = store.pool.begin().await.unwrap();
        assert_eq!(count_on::<CmdbUser>(&mut tx).await.unwrap(), 2);
        assert_eq!(store.replace_all(&newer).await.unwrap(), 30);
        let rows = page_on::<CmdbUser>(&mut tx, &filter).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|u| u.sys_id.as_str()).collect();
        assert_eq!(ids, ["1", "2"]);
        tx.commit().await.unwrap();

        let (rows, total) = store.page_with_count::<CmdbUser>(&filter).await.unwrap();
        assert_eq!(total, 30);
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].sys_id, "n00");
    }
}
