use super::{QueueItem, Result, Store, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gavel_common::rpc::SearchFilter;
use gavel_common::types::{Job, JobResult, JobState};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Default `limit` for searches that don't set one.
pub const DEFAULT_SEARCH_LIMIT: u32 = 10;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs (
        uuid TEXT PRIMARY KEY NOT NULL,
        dataset_id TEXT NOT NULL,
        code BLOB NOT NULL,
        language TEXT NOT NULL,
        eval_id TEXT NOT NULL DEFAULT '',
        state INTEGER NOT NULL DEFAULT 0,
        submission_id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        finished_at TEXT,
        result TEXT,
        error_message TEXT NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_task_id ON jobs (task_id)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state)",
    "CREATE TABLE IF NOT EXISTS queue_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        priority INTEGER NOT NULL,
        job_uuid TEXT NOT NULL REFERENCES jobs (uuid)
    )",
    "CREATE INDEX IF NOT EXISTS idx_queue_items_priority ON queue_items (priority DESC, id)",
    "CREATE TABLE IF NOT EXISTS finished_queue_items (
        id INTEGER PRIMARY KEY NOT NULL REFERENCES queue_items (id)
    )",
];

const JOB_COLUMNS: &str = "uuid, dataset_id, code, language, eval_id, state, submission_id, \
                           task_id, created_at, finished_at, result";

// Equal priorities are served in insertion order.
const FIRST_UNCONSUMED: &str = "SELECT q.id, q.priority, q.job_uuid
    FROM queue_items q
    LEFT JOIN finished_queue_items f ON f.id = q.id
    WHERE f.id IS NULL
    ORDER BY q.priority DESC, q.id ASC
    LIMIT 1";

#[derive(sqlx::FromRow)]
struct JobRow {
    uuid: String,
    dataset_id: String,
    code: Vec<u8>,
    language: String,
    eval_id: String,
    state: i64,
    submission_id: String,
    task_id: String,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    result: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        let uuid = parse_uuid(&row.uuid)?;
        let state = JobState::from_i64(row.state)
            .ok_or_else(|| StoreError::Serialization(format!("invalid job state {}", row.state)))?;
        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str::<JobResult>)
            .transpose()?;

        Ok(Job {
            uuid,
            dataset_id: row.dataset_id,
            code: row.code,
            language: row.language,
            eval_id: row.eval_id,
            state,
            submission_id: row.submission_id,
            task_id: row.task_id,
            created_at: row.created_at,
            finished_at: row.finished_at,
            result,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: i64,
    priority: i64,
    job_uuid: String,
}

impl TryFrom<QueueRow> for QueueItem {
    type Error = StoreError;

    fn try_from(row: QueueRow) -> Result<Self> {
        Ok(QueueItem {
            id: row.id,
            priority: i32::try_from(row.priority)
                .map_err(|_| StoreError::Serialization(format!("priority {} out of range", row.priority)))?,
            job_uuid: parse_uuid(&row.job_uuid)?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serialization(format!("invalid uuid {}: {}", s, e)))
}

/// Escape LIKE wildcards so the needle is matched literally.
fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// A connection holding `BEGIN EXCLUSIVE`.
///
/// Dropped without `commit`, the connection is detached from the pool and
/// closed, which rolls the transaction back.
struct ExclusiveLock {
    conn: Option<PoolConnection<Sqlite>>,
}

impl ExclusiveLock {
    async fn acquire(pool: &SqlitePool) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN EXCLUSIVE").execute(&mut *conn).await?;
        Ok(Self { conn: Some(conn) })
    }

    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_deref_mut()
            .ok_or(StoreError::Database(sqlx::Error::PoolClosed))
    }

    async fn commit(mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
            drop(conn.detach());
            return Err(e.into());
        }
        Ok(())
    }

    async fn first_unconsumed(&mut self) -> Result<Option<QueueItem>> {
        let row: Option<QueueRow> = sqlx::query_as(FIRST_UNCONSUMED)
            .fetch_optional(self.conn()?)
            .await?;
        row.map(QueueItem::try_from).transpose()
    }

    async fn tombstone(&mut self, id: i64) -> Result<bool> {
        let done = sqlx::query(
            "INSERT OR IGNORE INTO finished_queue_items (id) SELECT id FROM queue_items WHERE id = ?",
        )
        .bind(id)
        .execute(self.conn()?)
        .await?;
        Ok(done.rows_affected() == 1)
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

/// SQLite-backed `Store`. WAL journal, with a busy timeout so that
/// `BEGIN EXCLUSIVE` waits for the lock instead of failing immediately.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(database_url, "Connected to job store");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn exists(&self, uuid: &Uuid) -> Result<bool> {
        let found: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM jobs WHERE uuid = ?")
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// `Ok(false)` for a conditional update that matched nothing on an
    /// existing job, `NotFound` if the job doesn't exist.
    async fn unchanged(&self, uuid: &Uuid) -> Result<bool> {
        if self.exists(uuid).await? {
            Ok(false)
        } else {
            Err(StoreError::NotFound)
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_job(&self, job: &Job) -> Result<Uuid> {
        let uuid = if job.uuid.is_nil() { Uuid::new_v4() } else { job.uuid };
        let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
        let error_message = job
            .result
            .as_ref()
            .map(|r| r.error_message.clone())
            .unwrap_or_default();

        let inserted = sqlx::query(
            "INSERT INTO jobs (uuid, dataset_id, code, language, eval_id, state, submission_id, \
             task_id, created_at, finished_at, result, error_message) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid.to_string())
        .bind(&job.dataset_id)
        .bind(&job.code)
        .bind(&job.language)
        .bind(&job.eval_id)
        .bind(job.state.as_i64())
        .bind(&job.submission_id)
        .bind(&job.task_id)
        .bind(job.created_at)
        .bind(job.finished_at)
        .bind(result)
        .bind(error_message)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(uuid),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Conflict(format!("job {} already exists", uuid)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_job(&self, uuid: &Uuid) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as(&format!("SELECT {} FROM jobs WHERE uuid = ?", JOB_COLUMNS))
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(StoreError::NotFound)?.try_into()
    }

    async fn search_jobs(&self, filter: &SearchFilter) -> Result<Vec<Job>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM jobs WHERE 1 = 1", JOB_COLUMNS));

        if let Some(task_id) = non_empty(&filter.task_id) {
            query.push(" AND task_id = ").push_bind(task_id.to_string());
        }
        if let Some(dataset_id) = non_empty(&filter.dataset_id) {
            query.push(" AND dataset_id = ").push_bind(dataset_id.to_string());
        }
        if let Some(language) = non_empty(&filter.language) {
            query.push(" AND language = ").push_bind(language.to_string());
        }
        if let Some(eval_id) = non_empty(&filter.eval_id) {
            query.push(" AND eval_id = ").push_bind(eval_id.to_string());
        }
        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state.as_i64());
        }
        if let Some(needle) = non_empty(&filter.error_message) {
            // LIKE is case-insensitive for ASCII in SQLite
            query
                .push(" AND error_message LIKE ")
                .push_bind(format!("%{}%", escape_like(needle)))
                .push(" ESCAPE '\\'");
        }

        let limit = filter.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let offset = filter.offset.unwrap_or(0);
        query
            .push(" ORDER BY created_at ASC, uuid ASC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::from(offset));

        let rows: Vec<JobRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn enqueue_job(&self, priority: i32, job_uuid: &Uuid) -> Result<i64> {
        let done = sqlx::query("INSERT INTO queue_items (priority, job_uuid) VALUES (?, ?)")
            .bind(priority)
            .bind(job_uuid.to_string())
            .execute(&self.pool)
            .await;

        match done {
            Ok(done) => {
                let id = done.last_insert_rowid();
                debug!(job_uuid = %job_uuid, queue_id = id, priority, "Enqueued job");
                Ok(id)
            }
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn first_in_queue(&self) -> Result<QueueItem> {
        let mut lock = ExclusiveLock::acquire(&self.pool).await?;
        let item = lock.first_unconsumed().await?;
        lock.commit().await?;
        item.ok_or(StoreError::NotFound)
    }

    async fn dequeue_job(&self) -> Result<QueueItem> {
        let mut lock = ExclusiveLock::acquire(&self.pool).await?;
        let Some(item) = lock.first_unconsumed().await? else {
            lock.commit().await?;
            return Err(StoreError::NotFound);
        };
        lock.tombstone(item.id).await?;
        lock.commit().await?;
        debug!(job_uuid = %item.job_uuid, queue_id = item.id, "Dequeued job");
        Ok(item)
    }

    async fn set_job_state_and_eval_id(&self, uuid: &Uuid, state: JobState, eval_id: &str) -> Result<bool> {
        let done = sqlx::query("UPDATE jobs SET state = ?, eval_id = ? WHERE uuid = ? AND state < ?")
            .bind(state.as_i64())
            .bind(eval_id)
            .bind(uuid.to_string())
            .bind(state.as_i64())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 1 {
            return Ok(true);
        }
        self.unchanged(uuid).await
    }

    async fn finish_job(&self, uuid: &Uuid, result: &JobResult) -> Result<Job> {
        let done = sqlx::query(
            "UPDATE jobs SET state = ?, finished_at = ?, result = ?, error_message = ? \
             WHERE uuid = ? AND state < ?",
        )
        .bind(JobState::Done.as_i64())
        .bind(Utc::now())
        .bind(serde_json::to_string(result)?)
        .bind(&result.error_message)
        .bind(uuid.to_string())
        .bind(JobState::Done.as_i64())
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            // NotFound falls out of is_finished for a missing row
            if self.is_finished(uuid).await? {
                return Err(StoreError::Conflict("job is finished".to_string()));
            }
            return Err(StoreError::NotFound);
        }
        self.read_job(uuid).await
    }

    async fn is_finished(&self, uuid: &Uuid) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT state FROM jobs WHERE uuid = ?")
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let (state,) = row.ok_or(StoreError::NotFound)?;
        Ok(state == JobState::Done.as_i64())
    }

    async fn claim_job(&self, uuid: &Uuid, eval_id: &str) -> Result<bool> {
        let done = sqlx::query("UPDATE jobs SET state = ?, eval_id = ? WHERE uuid = ? AND state = ?")
            .bind(JobState::Processing.as_i64())
            .bind(eval_id)
            .bind(uuid.to_string())
            .bind(JobState::Waiting.as_i64())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 1 {
            return Ok(true);
        }
        self.unchanged(uuid).await
    }

    async fn rollback_job(&self, uuid: &Uuid, eval_id: &str) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE jobs SET state = ?, eval_id = '' WHERE uuid = ? AND state = ? AND eval_id = ?",
        )
        .bind(JobState::Waiting.as_i64())
        .bind(uuid.to_string())
        .bind(JobState::Processing.as_i64())
        .bind(eval_id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 1 {
            return Ok(true);
        }
        self.unchanged(uuid).await
    }

    async fn consume_queue_item(&self, id: i64) -> Result<bool> {
        let mut lock = ExclusiveLock::acquire(&self.pool).await?;
        let consumed = lock.tombstone(id).await?;
        lock.commit().await?;
        Ok(consumed)
    }

    async fn requeue_if_consumed(&self, item: &QueueItem) -> Result<Option<i64>> {
        let mut lock = ExclusiveLock::acquire(&self.pool).await?;
        let tombstone: Option<(i64,)> = sqlx::query_as("SELECT id FROM finished_queue_items WHERE id = ?")
            .bind(item.id)
            .fetch_optional(lock.conn()?)
            .await?;
        if tombstone.is_none() {
            lock.commit().await?;
            return Ok(None);
        }

        let done = sqlx::query("INSERT INTO queue_items (priority, job_uuid) VALUES (?, ?)")
            .bind(item.priority)
            .bind(item.job_uuid.to_string())
            .execute(lock.conn()?)
            .await?;
        lock.commit().await?;
        let id = done.last_insert_rowid();
        info!(job_uuid = %item.job_uuid, old_queue_id = item.id, queue_id = id, "Re-enqueued consumed job");
        Ok(Some(id))
    }
}
