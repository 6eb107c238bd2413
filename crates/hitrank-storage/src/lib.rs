//! Record persistence (Postgres + in-memory) and HTTP fetch utilities for hitrank.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hitrank_core::Record;
use reqwest::StatusCode;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "hitrank-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    Duplicate(i64),
    #[error("record {0} does not exist")]
    Missing(i64),
    #[error("commit rejected: {0}")]
    CommitRejected(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Read access to the record set plus a way to open a write transaction.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every stored record ordered by id.
    async fn list_all(&self) -> Result<Vec<Record>, StoreError>;

    async fn get_by_id(&self, id: i64) -> Result<Option<Record>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn RecordTx>, StoreError>;
}

/// A unit of work. Nothing is visible to other readers until `commit`; dropping
/// or rolling back discards every staged write.
#[async_trait]
pub trait RecordTx: Send {
    async fn get_by_id(&mut self, id: i64) -> Result<Option<Record>, StoreError>;

    /// Records of `year` by descending hits, then ascending id.
    async fn list_by_year(&mut self, year: i32) -> Result<Vec<Record>, StoreError>;

    async fn insert(&mut self, record: &Record) -> Result<(), StoreError>;

    /// Overwrite every column of an existing record.
    async fn update(&mut self, record: &Record) -> Result<(), StoreError>;

    /// Write only the rank column.
    async fn set_rank(&mut self, id: i64, rank: i32) -> Result<(), StoreError>;

    /// Write the description only if the stored one is still absent or blank.
    /// Returns whether the row was written.
    async fn fill_description(&mut self, id: i64, description: &str) -> Result<bool, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, rank, player_name, age, hits, year, bats, description FROM players";

fn record_from_row(row: &PgRow) -> Result<Record, sqlx::Error> {
    Ok(Record {
        id: row.try_get("id")?,
        rank: row.try_get("rank")?,
        player_name: row.try_get("player_name")?,
        age: row.try_get("age")?,
        hits: row.try_get("hits")?,
        year: row.try_get("year")?,
        bats: row.try_get("bats")?,
        description: row.try_get("description")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn list_all(&self) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| record_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn begin(&self) -> Result<Box<dyn RecordTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgRecordTx { tx }))
    }
}

pub struct PgRecordTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RecordTx for PgRecordTx {
    async fn get_by_id(&mut self, id: i64) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn list_by_year(&mut self, year: i32) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE year = $1 ORDER BY hits DESC, id ASC"
        ))
        .bind(year)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| record_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn insert(&mut self, record: &Record) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO players (id, rank, player_name, age, hits, year, bats, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.rank)
        .bind(&record.player_name)
        .bind(record.age)
        .bind(record.hits)
        .bind(record.year)
        .bind(&record.bats)
        .bind(record.description.as_deref())
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(record.id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&mut self, record: &Record) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE players
               SET rank = $2,
                   player_name = $3,
                   age = $4,
                   hits = $5,
                   year = $6,
                   bats = $7,
                   description = $8
             WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.rank)
        .bind(&record.player_name)
        .bind(record.age)
        .bind(record.hits)
        .bind(record.year)
        .bind(&record.bats)
        .bind(record.description.as_deref())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Missing(record.id));
        }
        Ok(())
    }

    async fn set_rank(&mut self, id: i64, rank: i32) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE players SET rank = $2 WHERE id = $1")
            .bind(id)
            .bind(rank)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Missing(id));
        }
        Ok(())
    }

    async fn fill_description(&mut self, id: i64, description: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE players
               SET description = $2
             WHERE id = $1
               AND (description IS NULL OR btrim(description) = '')
            "#,
        )
        .bind(id)
        .bind(description)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get_by_id(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::Missing(id)),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Process-local store used for offline runs and tests.
///
/// Transactions stage their writes privately and replay them against the
/// current rows under a single lock on commit, so column-level writes only
/// touch their own column.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    shared: Arc<MemoryShared>,
}

#[derive(Debug, Default)]
struct MemoryShared {
    rows: Mutex<BTreeMap<i64, Record>>,
    rejected_commits: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let rows = records.into_iter().map(|r| (r.id, r)).collect();
        Self {
            shared: Arc::new(MemoryShared {
                rows: Mutex::new(rows),
                rejected_commits: AtomicUsize::new(0),
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.shared.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Make the next `count` commits fail with [`StoreError::CommitRejected`].
    pub fn reject_next_commits(&self, count: usize) {
        self.shared.rejected_commits.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn list_all(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.shared.rows.lock().await.values().cloned().collect())
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Record>, StoreError> {
        Ok(self.shared.rows.lock().await.get(&id).cloned())
    }

    async fn begin(&self) -> Result<Box<dyn RecordTx>, StoreError> {
        Ok(Box::new(MemoryRecordTx {
            shared: Arc::clone(&self.shared),
            staged: BTreeMap::new(),
            writes: Vec::new(),
        }))
    }
}

#[derive(Debug)]
enum StagedWrite {
    Row(Record),
    Rank { id: i64, rank: i32 },
    FillDescription { id: i64, description: String },
}

impl StagedWrite {
    fn apply(self, rows: &mut BTreeMap<i64, Record>) {
        match self {
            StagedWrite::Row(record) => {
                rows.insert(record.id, record);
            }
            StagedWrite::Rank { id, rank } => {
                if let Some(row) = rows.get_mut(&id) {
                    row.rank = rank;
                }
            }
            StagedWrite::FillDescription { id, description } => {
                if let Some(row) = rows.get_mut(&id).filter(|row| !row.has_description()) {
                    row.description = Some(description);
                }
            }
        }
    }
}

pub struct MemoryRecordTx {
    shared: Arc<MemoryShared>,
    // this transaction's view of the rows it has written
    staged: BTreeMap<i64, Record>,
    writes: Vec<StagedWrite>,
}

impl MemoryRecordTx {
    async fn current(&self, id: i64) -> Option<Record> {
        if let Some(record) = self.staged.get(&id) {
            return Some(record.clone());
        }
        self.shared.rows.lock().await.get(&id).cloned()
    }
}

#[async_trait]
impl RecordTx for MemoryRecordTx {
    async fn get_by_id(&mut self, id: i64) -> Result<Option<Record>, StoreError> {
        Ok(self.current(id).await)
    }

    async fn list_by_year(&mut self, year: i32) -> Result<Vec<Record>, StoreError> {
        let mut merged = self.shared.rows.lock().await.clone();
        merged.extend(self.staged.iter().map(|(id, r)| (*id, r.clone())));
        let mut rows: Vec<Record> = merged.into_values().filter(|r| r.year == year).collect();
        rows.sort_by(|a, b| b.hits.cmp(&a.hits).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn insert(&mut self, record: &Record) -> Result<(), StoreError> {
        if self.current(record.id).await.is_some() {
            return Err(StoreError::Duplicate(record.id));
        }
        self.staged.insert(record.id, record.clone());
        self.writes.push(StagedWrite::Row(record.clone()));
        Ok(())
    }

    async fn update(&mut self, record: &Record) -> Result<(), StoreError> {
        if self.current(record.id).await.is_none() {
            return Err(StoreError::Missing(record.id));
        }
        self.staged.insert(record.id, record.clone());
        self.writes.push(StagedWrite::Row(record.clone()));
        Ok(())
    }

    async fn set_rank(&mut self, id: i64, rank: i32) -> Result<(), StoreError> {
        let mut record = self.current(id).await.ok_or(StoreError::Missing(id))?;
        record.rank = rank;
        self.staged.insert(id, record);
        self.writes.push(StagedWrite::Rank { id, rank });
        Ok(())
    }

    async fn fill_description(&mut self, id: i64, description: &str) -> Result<bool, StoreError> {
        let mut record = self.current(id).await.ok_or(StoreError::Missing(id))?;
        if record.has_description() {
            return Ok(false);
        }
        record.description = Some(description.to_string());
        self.staged.insert(id, record);
        self.writes.push(StagedWrite::FillDescription {
            id,
            description: description.to_string(),
        });
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryRecordTx { shared, writes, .. } = *self;
        let rejected = shared
            .rejected_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(StoreError::CommitRejected(format!(
                "{} staged writes discarded",
                writes.len()
            )));
        }

        let mut rows = shared.rows.lock().await;
        debug!(writes = writes.len(), "committing memory transaction");
        for write in writes {
            write.apply(&mut rows);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        debug!(writes = self.writes.len(), "rolling back memory transaction");
        Ok(())
    }
}

/// Client settings for upstream fetches. Each fetch is a single attempt.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_once(url).instrument(span).await
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        debug!(%status, bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
