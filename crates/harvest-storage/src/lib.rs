//! Persistence collaborators, write-behind queue and HTTP fetch utilities for harvest.

mod http;
mod queue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::HarvestRecord;
use rand::Rng;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub use http::{
    classify_reqwest_error, classify_status, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use queue::{persist, QueueClosed, QueueItem, QueueStats, WriteBehindConfig, WriteBehindQueue};

pub const CRATE_NAME: &str = "harvest-storage";

/// Persistence principal a batch of records belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub id: Uuid,
    pub external_id: String,
}

/// Storage representation of one harvested record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub owner_id: Uuid,
    pub session_ref: String,
    pub record_id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub content_hash: String,
    pub captured_at: DateTime<Utc>,
    pub data: JsonValue,
}

impl StoredRecord {
    pub fn from_record(
        owner: &Owner,
        session_ref: &str,
        record: &HarvestRecord,
    ) -> Result<Self, PersistenceError> {
        let data = serde_json::to_value(record)?;
        let content_hash = sha256_hex(&serde_json::to_vec(&data)?);
        Ok(Self {
            owner_id: owner.id,
            session_ref: session_ref.to_string(),
            record_id: record.id.clone(),
            url: record.url.clone(),
            title: record.title.clone(),
            body: record.body.clone(),
            content_hash,
            captured_at: record.captured_at,
            data,
        })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("owner {0} not found")]
    OwnerNotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serializing record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

/// Backing store the write-behind queue persists into.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn resolve_owner(&self, owner_id: &str) -> Result<Owner, PersistenceError>;

    /// Opens one atomic unit of work. Dropping the transaction without
    /// calling `commit` discards everything written through it.
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, PersistenceError>;
}

#[async_trait]
pub trait RecordTransaction: Send {
    async fn write_records(&mut self, records: &[StoredRecord]) -> Result<u64, PersistenceError>;
    async fn commit(self: Box<Self>) -> Result<(), PersistenceError>;
}

/// Exponential delay with additive jitter and a hard ceiling.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next try of an item that has failed `attempts` times.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.delay_with_jitter(attempts, jitter)
    }

    pub fn delay_with_jitter(&self, attempts: u32, jitter: Duration) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(factor)
            .saturating_add(jitter)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running harvest migrations")
    }
}

const UPSERT_OWNER_SQL: &str = r#"
    INSERT INTO harvest_owners (external_id)
    VALUES ($1)
    ON CONFLICT (external_id) DO UPDATE SET external_id = EXCLUDED.external_id
    RETURNING id, external_id
"#;

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn resolve_owner(&self, owner_id: &str) -> Result<Owner, PersistenceError> {
        // Owners are created on first use; the no-op update makes RETURNING
        // yield the existing row on conflict.
        let row = sqlx::query(UPSERT_OWNER_SQL)
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(Owner {
            id: row.try_get("id")?,
            external_id: row.try_get("external_id")?,
        })
    }

    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, PersistenceError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgRecordTransaction { tx }))
    }
}

struct PgRecordTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RecordTransaction for PgRecordTransaction {
    async fn write_records(&mut self, records: &[StoredRecord]) -> Result<u64, PersistenceError> {
        let mut written = 0u64;
        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO harvest_records
                       (owner_id, session_ref, record_id, url, title, body,
                        content_hash, captured_at, data_json)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (owner_id, record_id) DO UPDATE
                   SET session_ref = EXCLUDED.session_ref,
                       url = EXCLUDED.url,
                       title = EXCLUDED.title,
                       body = EXCLUDED.body,
                       content_hash = EXCLUDED.content_hash,
                       captured_at = EXCLUDED.captured_at,
                       data_json = EXCLUDED.data_json,
                       updated_at = NOW()
                 WHERE harvest_records.content_hash <> EXCLUDED.content_hash
                "#,
            )
            .bind(record.owner_id)
            .bind(&record.session_ref)
            .bind(&record.record_id)
            .bind(record.url.as_deref())
            .bind(record.title.as_deref())
            .bind(record.body.as_deref())
            .bind(&record.content_hash)
            .bind(record.captured_at)
            .bind(&record.data)
            .execute(&mut *self.tx)
            .await?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Process-local store used when no database is configured, and by tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    strict_owners: bool,
    owners: HashMap<String, Owner>,
    records: Vec<StoredRecord>,
    fail_remaining: u32,
    write_attempts: u32,
}

impl MemoryRecordStore {
    /// Owners are registered on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only owners added through [`MemoryRecordStore::register_owner`] resolve.
    pub fn strict() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                strict_owners: true,
                ..Default::default()
            })),
        }
    }

    pub async fn register_owner(&self, external_id: &str) -> Owner {
        let mut state = self.state.lock().await;
        state
            .owners
            .entry(external_id.to_string())
            .or_insert_with(|| Owner {
                id: Uuid::new_v4(),
                external_id: external_id.to_string(),
            })
            .clone()
    }

    /// Makes the next `count` record writes fail.
    pub async fn fail_next(&self, count: u32) {
        self.state.lock().await.fail_remaining = count;
    }

    /// Committed records in commit order.
    pub async fn records(&self) -> Vec<StoredRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn write_attempts(&self) -> u32 {
        self.state.lock().await.write_attempts
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn resolve_owner(&self, owner_id: &str) -> Result<Owner, PersistenceError> {
        {
            let state = self.state.lock().await;
            if let Some(owner) = state.owners.get(owner_id) {
                return Ok(owner.clone());
            }
            if state.strict_owners {
                return Err(PersistenceError::OwnerNotFound(owner_id.to_string()));
            }
        }
        Ok(self.register_owner(owner_id).await)
    }

    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, PersistenceError> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            pending: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    pending: Vec<StoredRecord>,
}

#[async_trait]
impl RecordTransaction for MemoryTransaction {
    async fn write_records(&mut self, records: &[StoredRecord]) -> Result<u64, PersistenceError> {
        let mut state = self.state.lock().await;
        state.write_attempts += 1;
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(PersistenceError::Message("injected write failure".to_string()));
        }
        drop(state);
        self.pending.extend_from_slice(records);
        Ok(records.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        let this = *self;
        let mut state = this.state.lock().await;
        state.records.extend(this.pending);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Map;

    fn record(id: &str) -> HarvestRecord {
        HarvestRecord {
            id: id.to_string(),
            url: Some(format!("https://example.test/{id}")),
            title: Some("Profile".to_string()),
            body: None,
            captured_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
            attributes: Map::new(),
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn stored_record_hash_tracks_content() {
        let owner = Owner {
            id: Uuid::new_v4(),
            external_id: "user_1".into(),
        };
        let a = StoredRecord::from_record(&owner, "job-1", &record("a")).unwrap();
        let again = StoredRecord::from_record(&owner, "job-2", &record("a")).unwrap();
        let mut changed = record("a");
        changed.body = Some("new bio".into());
        let b = StoredRecord::from_record(&owner, "job-1", &changed).unwrap();

        assert_eq!(a.content_hash, again.content_hash);
        assert_ne!(a.content_hash, b.content_hash);
        assert_eq!(a.data["id"], "a");
        assert_eq!(a.owner_id, owner.id);
    }

    #[test]
    fn stored_record_serializes_owner_id_as_uuid_string() {
        let owner = Owner {
            id: Uuid::new_v4(),
            external_id: "user_1".into(),
        };
        let stored = StoredRecord::from_record(&owner, "job-1", &record("a")).unwrap();
        let value = serde_json::to_value(&stored).unwrap();

        assert_eq!(value["owner_id"], owner.id.to_string());
        assert_eq!(value["record_id"], "a");
        assert_eq!(value["content_hash"], stored.content_hash);
    }

    async fn assert_owner_created_on_first_use(store: &dyn RecordStore) {
        let external_id = format!("first-use-{}", Uuid::new_v4());
        let created = store.resolve_owner(&external_id).await.unwrap();
        assert_eq!(created.external_id, external_id);

        let again = store.resolve_owner(&external_id).await.unwrap();
        assert_eq!(again.id, created.id);
    }

    #[tokio::test]
    async fn memory_store_creates_owner_on_first_use() {
        let store = MemoryRecordStore::new();
        assert_owner_created_on_first_use(&store).await;
    }

    #[tokio::test]
    async fn postgres_store_creates_owner_on_first_use() {
        let Ok(url) = std::env::var("HARVEST_TEST_DATABASE_URL") else {
            return;
        };
        let store = PgRecordStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        assert_owner_created_on_first_use(&store).await;

        let owner = store.resolve_owner("pg-writer").await.unwrap();
        let rows = vec![StoredRecord::from_record(&owner, "job-1", &record("a")).unwrap()];
        let mut tx = store.begin().await.unwrap();
        tx.write_records(&rows).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[test]
    fn owner_lookup_inserts_missing_owners() {
        let sql = UPSERT_OWNER_SQL.split_whitespace().collect::<Vec<_>>().join(" ");
        assert!(sql.starts_with("INSERT INTO harvest_owners (external_id)"));
        assert!(sql.contains("ON CONFLICT (external_id) DO UPDATE"));
        assert!(sql.ends_with("RETURNING id, external_id"));
    }

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        let policy = BackoffPolicy::default();
        let max_jitter = Duration::from_millis(999);

        assert_eq!(policy.delay_with_jitter(1, Duration::ZERO), Duration::from_millis(1000));
        assert_eq!(policy.delay_with_jitter(2, Duration::ZERO), Duration::from_millis(2000));
        assert_eq!(policy.delay_with_jitter(3, Duration::ZERO), Duration::from_millis(4000));
        assert!(
            policy.delay_with_jitter(1, max_jitter) < policy.delay_with_jitter(2, Duration::ZERO)
        );
        assert!(
            policy.delay_with_jitter(2, max_jitter) < policy.delay_with_jitter(3, Duration::ZERO)
        );
        assert_eq!(policy.delay_with_jitter(6, max_jitter), Duration::from_secs(30));
        assert_eq!(policy.delay_with_jitter(40, max_jitter), Duration::from_secs(30));
    }

    #[test]
    fn sampled_backoff_is_monotonic_within_ceiling() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let (b1, b2, b3) = (
                policy.delay_for_attempt(1),
                policy.delay_for_attempt(2),
                policy.delay_for_attempt(3),
            );
            assert!(b1 < b2 && b2 < b3, "{b1:?} {b2:?} {b3:?}");
            assert!(b3 <= Duration::from_millis(30_000));
        }
    }

    #[tokio::test]
    async fn memory_transaction_discards_uncommitted_writes() {
        let store = MemoryRecordStore::new();
        let owner = store.resolve_owner("user_1").await.unwrap();
        let rows = vec![StoredRecord::from_record(&owner, "job-1", &record("a")).unwrap()];

        let mut tx = store.begin().await.unwrap();
        tx.write_records(&rows).await.unwrap();
        drop(tx);
        assert!(store.records().await.is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.write_records(&rows).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn strict_memory_store_rejects_unknown_owner() {
        let store = MemoryRecordStore::strict();
        let err = store.resolve_owner("ghost").await.unwrap_err();
        assert!(matches!(err, PersistenceError::OwnerNotFound(id) if id == "ghost"));

        let registered = store.register_owner("user_7").await;
        assert_eq!(store.resolve_owner("user_7").await.unwrap(), registered);
    }
}
