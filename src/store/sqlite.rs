use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use uuid::Uuid;

use crate::model::{QueuedRecord, RecordKey, Version, Versioned};

use super::document::{decode, encode};
use super::{compute_etag, CasOutcome, DocumentStore, ScanFilter, ScanItem, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queued_records (
    partition_key TEXT NOT NULL,
    row_key TEXT NOT NULL,
    etag TEXT NOT NULL,
    lease_owner TEXT NOT NULL DEFAULT '',
    data TEXT NOT NULL,
    PRIMARY KEY (partition_key, row_key)
);

CREATE INDEX IF NOT EXISTS idx_queued_lease_owner ON queued_records(partition_key, lease_owner);
"#;

fn sql_err(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn fresh_etag(key: &RecordKey, body: &str) -> Version {
    // Several processes may share one database file, so the salt is random
    compute_etag(key, body, Uuid::new_v4().as_bytes())
}

/// SQLite-backed store. Every process opening the same file sees the same
/// queue; conditional replace is a single guarded `UPDATE`.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(sql_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(sql_err)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("sqlite task failed: {e}")))?
    }

    /// Flush the write-ahead log into the main database file.
    pub async fn sync(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                .map_err(sql_err)
        })
        .await
    }
}

#[async_trait::async_trait]
impl DocumentStore for SqliteStore {
    async fn read(&self, key: &RecordKey) -> Result<Option<Versioned<QueuedRecord>>, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT etag, data FROM queued_records WHERE partition_key = ?1 AND row_key = ?2",
                    params![key.partition_key(), key.row_key()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql_err)?;

            row.map(|(etag, data)| {
                Ok(Versioned {
                    value: decode(&key.to_string(), &data)?,
                    version: Version::new(etag),
                })
            })
            .transpose()
        })
        .await
    }

    async fn conditional_replace(
        &self,
        record: &QueuedRecord,
        expected: &Version,
    ) -> Result<CasOutcome, StoreError> {
        let body = encode(record)?;
        let key = record.key.clone();
        let owner = record.lease.owner.clone();
        let expected = expected.clone();
        self.with_conn(move |conn| {
            let etag = fresh_etag(&key, &body);
            let updated = conn
                .execute(
                    r#"
                    UPDATE queued_records
                    SET etag = ?1, data = ?2, lease_owner = ?3
                    WHERE partition_key = ?4 AND row_key = ?5 AND etag = ?6
                    "#,
                    params![
                        etag.as_str(),
                        body,
                        owner,
                        key.partition_key(),
                        key.row_key(),
                        expected.as_str()
                    ],
                )
                .map_err(sql_err)?;
            if updated > 0 {
                return Ok(CasOutcome::Replaced(etag));
            }

            let exists = conn
                .query_row(
                    "SELECT 1 FROM queued_records WHERE partition_key = ?1 AND row_key = ?2",
                    params![key.partition_key(), key.row_key()],
                    |_| Ok(()),
                )
                .optional()
                .map_err(sql_err)?
                .is_some();
            Ok(if exists {
                CasOutcome::Conflict
            } else {
                CasOutcome::NotFound
            })
        })
        .await
    }

    async fn delete(&self, key: &RecordKey) -> Result<bool, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM queued_records WHERE partition_key = ?1 AND row_key = ?2",
                    params![key.partition_key(), key.row_key()],
                )
                .map_err(sql_err)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ScanItem>, StoreError> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let limit = filter
                .limit
                .and_then(|l| i64::try_from(l).ok())
                .unwrap_or(-1);
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT partition_key, row_key, etag, data FROM queued_records
                    WHERE (?1 IS NULL OR partition_key = ?1)
                      AND (?2 = 0 OR lease_owner != '')
                    ORDER BY partition_key, row_key
                    LIMIT ?3
                    "#,
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(
                    params![filter.partition, i64::from(filter.leased_only), limit],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;

            Ok(rows
                .into_iter()
                .map(|(pk, rk, etag, data)| {
                    decode(&format!("{pk}/{rk}"), &data).map(|value| Versioned {
                        value,
                        version: Version::new(etag),
                    })
                })
                .collect())
        })
        .await
    }

    async fn insert(&self, record: &QueuedRecord) -> Result<Version, StoreError> {
        let body = encode(record)?;
        let key = record.key.clone();
        let owner = record.lease.owner.clone();
        self.with_conn(move |conn| {
            let etag = fresh_etag(&key, &body);
            let inserted = conn.execute(
                r#"
                INSERT INTO queued_records (partition_key, row_key, etag, lease_owner, data)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![key.partition_key(), key.row_key(), etag.as_str(), owner, body],
            );
            match inserted {
                Ok(_) => Ok(etag),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::AlreadyExists(key.to_string()))
                }
                Err(e) => Err(sql_err(e)),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StoredPayload;

    fn record(rk: &str) -> QueuedRecord {
        QueuedRecord::new(
            RecordKey::new("active", rk).unwrap(),
            StoredPayload::Inline(r#"{"Remitente":"a@b.c"}"#.into()),
        )
    }

    #[tokio::test]
    async fn cas_distinguishes_conflict_from_missing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = record("a");
        let v1 = store.insert(&rec).await.unwrap();

        let mut leased = rec.clone();
        leased.lease.owner = "alice".into();
        assert!(matches!(
            store.conditional_replace(&leased, &v1).await.unwrap(),
            CasOutcome::Replaced(_)
        ));
        assert_eq!(
            store.conditional_replace(&rec, &v1).await.unwrap(),
            CasOutcome::Conflict
        );

        assert!(store.delete(&rec.key).await.unwrap());
        assert_eq!(
            store.conditional_replace(&rec, &v1).await.unwrap(),
            CasOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn leased_only_scan_uses_owner_column() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&record("a")).await.unwrap();
        let mut leased = record("b");
        leased.lease.owner = "bob".into();
        store.insert(&leased).await.unwrap();

        let all = store.scan(&ScanFilter::partition("active")).await.unwrap();
        assert_eq!(all.len(), 2);

        let leased_only = store
            .scan(&ScanFilter::partition("active").leased_only())
            .await
            .unwrap();
        assert_eq!(leased_only.len(), 1);
        assert_eq!(
            leased_only[0].as_ref().unwrap().value.key.row_key(),
            "b"
        );

        let none = store.scan(&ScanFilter::partition("archive")).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn duplicate_insert_is_reported() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&record("a")).await.unwrap();
        assert!(matches!(
            store.insert(&record("a")).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn documents_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert(&record("a")).await.unwrap();
            store.sync().await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let read = store
            .read(&RecordKey::new("active", "a").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.value, record("a"));
    }
}
