//! Source mirror + snapshot store access for cylsnap.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use cylsnap_core::{canonical_id, HiddenTypeMarker, SnapshotRecord, SourceHead, SourceRecord, TypeKey};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

pub const CRATE_NAME: &str = "cylsnap-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("cannot decode row for {cylinder_id}: {reason}")]
    Decode { cylinder_id: String, reason: String },
    #[error("write rejected for {cylinder_id}: {reason}")]
    Rejected { cylinder_id: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait SourceMirror: Send + Sync {
    async fn list_heads(&self) -> StoreResult<Vec<SourceHead>>;

    async fn fetch(&self, cylinder_id: &str) -> StoreResult<Vec<SourceRecord>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub type_key: Option<TypeKey>,
    pub enduser_code: Option<String>,
}

impl SnapshotFilter {
    pub fn matches(&self, record: &SnapshotRecord) -> bool {
        self.type_key
            .as_ref()
            .is_none_or(|key| &record.type_key == key)
            && self
                .enduser_code
                .as_deref()
                .is_none_or(|code| record.enduser_code == code)
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn refresh_heads(&self) -> StoreResult<HashMap<String, DateTime<Utc>>>;

    async fn get(&self, cylinder_id: &str) -> StoreResult<Option<SnapshotRecord>>;

    /// Atomic insert-or-replace keyed by canonical identifier. Padded duplicates of the
    /// same identifier are dropped in the same unit of work. Returns `false` when an
    /// existing row carries a newer refresh timestamp and was kept.
    async fn upsert(&self, record: &SnapshotRecord) -> StoreResult<bool>;

    async fn delete(&self, cylinder_id: &str) -> StoreResult<u64>;

    async fn truncate(&self) -> StoreResult<u64>;

    async fn list(&self, filter: &SnapshotFilter) -> StoreResult<Vec<SnapshotRecord>>;

    async fn hidden_type_keys(&self) -> StoreResult<HashSet<TypeKey>>;

    async fn hide_type(&self, marker: &HiddenTypeMarker) -> StoreResult<()>;

    async fn unhide_type(&self, type_key: &TypeKey) -> StoreResult<bool>;
}

#[derive(Debug, Default)]
struct MemoryState {
    sources: Vec<SourceRecord>,
    snapshots: BTreeMap<String, SnapshotRecord>,
    hidden: BTreeMap<TypeKey, HiddenTypeMarker>,
    failing_writes: HashSet<String>,
    unreachable: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: Vec<SourceRecord>) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                sources,
                ..Default::default()
            }),
        }
    }

    pub async fn put_source(&self, record: SourceRecord) {
        let mut state = self.state.write().await;
        state.sources.retain(|r| r.cylinder_id != record.cylinder_id);
        state.sources.push(record);
    }

    pub async fn remove_source(&self, cylinder_id: &str) {
        let mut state = self.state.write().await;
        state
            .sources
            .retain(|r| canonical_id(&r.cylinder_id) != canonical_id(cylinder_id));
    }

    /// Stores a row verbatim, bypassing canonicalization, as older jobs did.
    pub async fn put_snapshot_raw(&self, record: SnapshotRecord) {
        let mut state = self.state.write().await;
        state.snapshots.insert(record.cylinder_id.clone(), record);
    }

    pub async fn fail_writes_for(&self, cylinder_id: &str) {
        let mut state = self.state.write().await;
        state.failing_writes.insert(cylinder_id.to_string());
    }

    /// Snapshot writes fail as if the connection pool had timed out.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.write().await.unreachable = unreachable;
    }
}

impl MemoryState {
    fn check_reachable(&self) -> StoreResult<()> {
        if self.unreachable {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn variants_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a SnapshotRecord> + 'a {
        self.snapshots
            .iter()
            .filter(move |(key, _)| canonical_id(key) == id)
            .map(|(_, record)| record)
    }
}

#[async_trait]
impl SourceMirror for MemoryStore {
    async fn list_heads(&self) -> StoreResult<Vec<SourceHead>> {
        let state = self.state.read().await;
        Ok(state
            .sources
            .iter()
            .map(|r| SourceHead {
                cylinder_id: r.cylinder_id.clone(),
                source_updated_at: r.source_updated_at,
            })
            .collect())
    }

    async fn fetch(&self, cylinder_id: &str) -> StoreResult<Vec<SourceRecord>> {
        let state = self.state.read().await;
        let wanted = canonical_id(cylinder_id);
        Ok(state
            .sources
            .iter()
            .filter(|r| r.canonical_id() == wanted)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn refresh_heads(&self) -> StoreResult<HashMap<String, DateTime<Utc>>> {
        let state = self.state.read().await;
        let mut heads: HashMap<String, DateTime<Utc>> = HashMap::new();
        for record in state.snapshots.values() {
            let entry = heads
                .entry(canonical_id(&record.cylinder_id).to_string())
                .or_insert(record.refreshed_at);
            *entry = (*entry).max(record.refreshed_at);
        }
        Ok(heads)
    }

    async fn get(&self, cylinder_id: &str) -> StoreResult<Option<SnapshotRecord>> {
        let state = self.state.read().await;
        Ok(state
            .variants_of(canonical_id(cylinder_id))
            .max_by_key(|r| r.refreshed_at)
            .cloned())
    }

    async fn upsert(&self, record: &SnapshotRecord) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        state.check_reachable()?;
        let id = canonical_id(&record.cylinder_id).to_string();
        if state.failing_writes.contains(&id) {
            return Err(StoreError::Rejected {
                cylinder_id: id,
                reason: "write fault injected".to_string(),
            });
        }
        if state
            .variants_of(&id)
            .any(|existing| existing.refreshed_at > record.refreshed_at)
        {
            return Ok(false);
        }
        state
            .snapshots
            .retain(|key, _| key == &id || canonical_id(key) != id);
        let mut stored = record.clone();
        stored.cylinder_id = id.clone();
        state.snapshots.insert(id, stored);
        Ok(true)
    }

    async fn delete(&self, cylinder_id: &str) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        state.check_reachable()?;
        let wanted = canonical_id(cylinder_id);
        let before = state.snapshots.len();
        state.snapshots.retain(|key, _| canonical_id(key) != wanted);
        Ok((before - state.snapshots.len()) as u64)
    }

    async fn truncate(&self) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let removed = state.snapshots.len() as u64;
        state.snapshots.clear();
        Ok(removed)
    }

    async fn list(&self, filter: &SnapshotFilter) -> StoreResult<Vec<SnapshotRecord>> {
        let state = self.state.read().await;
        Ok(state
            .snapshots
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn hidden_type_keys(&self) -> StoreResult<HashSet<TypeKey>> {
        let state = self.state.read().await;
        Ok(state.hidden.keys().cloned().collect())
    }

    async fn hide_type(&self, marker: &HiddenTypeMarker) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.hidden.insert(marker.type_key.clone(), marker.clone());
        Ok(())
    }

    async fn unhide_type(&self, type_key: &TypeKey) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        Ok(state.hidden.remove(type_key).is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

const SOURCE_COLUMNS: &str = r#"
    cylinder_id,
    gas_name,
    capacity::float8 AS capacity,
    valve_spec,
    cylinder_spec,
    location_code,
    usage_code,
    enduser_code,
    condition_code,
    pressure_due_date,
    last_moved_at,
    source_updated_at
"#;

const SNAPSHOT_COLUMNS: &str = r#"
    cylinder_id, gas_name, capacity, valve_spec, cylinder_spec, location_code,
    usage_code, enduser_code, condition_code, status, valve_format, valve_material,
    cylinder_format, cylinder_material, usage_place, type_key, is_available,
    pressure_due_date, last_event_at, source_updated_at, refreshed_at
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect_with_retry(database_url: &str, backoff: BackoffPolicy) -> StoreResult<Self> {
        let mut attempt = 0usize;
        loop {
            let result = PgPoolOptions::new()
                .max_connections(8)
                .acquire_timeout(Duration::from_secs(10))
                .connect(database_url)
                .await;
            match result {
                Ok(pool) => return Ok(Self::new(pool)),
                Err(err)
                    if classify_sqlx_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries =>
                {
                    let delay = backoff.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %err, "database unreachable; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn decode_error(cylinder_id: &str, err: sqlx::Error) -> StoreError {
    StoreError::Decode {
        cylinder_id: cylinder_id.to_string(),
        reason: err.to_string(),
    }
}

fn source_from_row(row: &PgRow) -> StoreResult<SourceRecord> {
    let cylinder_id: String = row.try_get("cylinder_id")?;
    let source_updated_at: Option<DateTime<Utc>> = row
        .try_get("source_updated_at")
        .map_err(|e| decode_error(&cylinder_id, e))?;
    let Some(source_updated_at) = source_updated_at else {
        return Err(StoreError::Decode {
            cylinder_id,
            reason: "source_updated_at is null".to_string(),
        });
    };
    let get_text = |column: &str| -> StoreResult<Option<String>> {
        row.try_get::<Option<String>, _>(column)
            .map_err(|e| decode_error(&cylinder_id, e))
    };
    Ok(SourceRecord {
        gas_name: get_text("gas_name")?,
        capacity: row
            .try_get::<Option<f64>, _>("capacity")
            .map_err(|e| decode_error(&cylinder_id, e))?,
        valve_spec: get_text("valve_spec")?,
        cylinder_spec: get_text("cylinder_spec")?,
        location_code: get_text("location_code")?,
        usage_code: get_text("usage_code")?,
        enduser_code: get_text("enduser_code")?,
        condition_code: get_text("condition_code")?,
        pressure_due_date: row
            .try_get::<Option<NaiveDate>, _>("pressure_due_date")
            .map_err(|e| decode_error(&cylinder_id, e))?,
        last_moved_at: row
            .try_get::<Option<DateTime<Utc>>, _>("last_moved_at")
            .map_err(|e| decode_error(&cylinder_id, e))?,
        source_updated_at,
        cylinder_id,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<SnapshotRecord, sqlx::Error> {
    Ok(SnapshotRecord {
        cylinder_id: row.try_get("cylinder_id")?,
        gas_name: row.try_get("gas_name")?,
        capacity: row.try_get("capacity")?,
        valve_spec: row.try_get("valve_spec")?,
        cylinder_spec: row.try_get("cylinder_spec")?,
        location_code: row.try_get("location_code")?,
        usage_code: row.try_get("usage_code")?,
        enduser_code: row.try_get("enduser_code")?,
        condition_code: row.try_get("condition_code")?,
        status: row.try_get("status")?,
        valve_format: row.try_get("valve_format")?,
        valve_material: row.try_get("valve_material")?,
        cylinder_format: row.try_get("cylinder_format")?,
        cylinder_material: row.try_get("cylinder_material")?,
        usage_place: row.try_get("usage_place")?,
        type_key: TypeKey::new(row.try_get::<String, _>("type_key")?),
        is_available: row.try_get("is_available")?,
        pressure_due_date: row.try_get("pressure_due_date")?,
        last_event_at: row.try_get("last_event_at")?,
        source_updated_at: row.try_get("source_updated_at")?,
        refreshed_at: row.try_get("refreshed_at")?,
    })
}

#[async_trait]
impl SourceMirror for PgStore {
    async fn list_heads(&self) -> StoreResult<Vec<SourceHead>> {
        let rows = sqlx::query(
            r#"
            SELECT cylinder_id,
                   COALESCE(source_updated_at, 'epoch'::timestamptz) AS source_updated_at
              FROM cylinder_source_view
             WHERE cylinder_id IS NOT NULL
             ORDER BY cylinder_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SourceHead {
                cylinder_id: row.try_get("cylinder_id")?,
                source_updated_at: row.try_get("source_updated_at")?,
            });
        }
        Ok(out)
    }

    async fn fetch(&self, cylinder_id: &str) -> StoreResult<Vec<SourceRecord>> {
        let sql = format!(
            "SELECT {SOURCE_COLUMNS} FROM cylinder_source_view WHERE BTRIM(cylinder_id) = $1 ORDER BY cylinder_id"
        );
        let rows = sqlx::query(&sql)
            .bind(canonical_id(cylinder_id))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn refresh_heads(&self) -> StoreResult<HashMap<String, DateTime<Utc>>> {
        let rows = sqlx::query(
            r#"
            SELECT BTRIM(cylinder_id) AS cylinder_id, MAX(refreshed_at) AS refreshed_at
              FROM cylinder_snapshot
             GROUP BY BTRIM(cylinder_id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("cylinder_id")?, row.try_get("refreshed_at")?);
        }
        Ok(out)
    }

    async fn get(&self, cylinder_id: &str) -> StoreResult<Option<SnapshotRecord>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM cylinder_snapshot WHERE BTRIM(cylinder_id) = $1 ORDER BY refreshed_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(canonical_id(cylinder_id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(snapshot_from_row).transpose()?)
    }

    async fn upsert(&self, record: &SnapshotRecord) -> StoreResult<bool> {
        let id = canonical_id(&record.cylinder_id);
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT refreshed_at FROM cylinder_snapshot WHERE BTRIM(cylinder_id) = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        for row in &existing {
            let refreshed_at: DateTime<Utc> = row.try_get("refreshed_at")?;
            if refreshed_at > record.refreshed_at {
                tx.rollback().await?;
                return Ok(false);
            }
        }

        sqlx::query("DELETE FROM cylinder_snapshot WHERE BTRIM(cylinder_id) = $1 AND cylinder_id <> $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO cylinder_snapshot (
                cylinder_id, gas_name, capacity, valve_spec, cylinder_spec, location_code,
                usage_code, enduser_code, condition_code, status, valve_format, valve_material,
                cylinder_format, cylinder_material, usage_place, type_key, is_available,
                pressure_due_date, last_event_at, source_updated_at, refreshed_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21
            )
            ON CONFLICT (cylinder_id) DO UPDATE SET
                gas_name = EXCLUDED.gas_name,
                capacity = EXCLUDED.capacity,
                valve_spec = EXCLUDED.valve_spec,
                cylinder_spec = EXCLUDED.cylinder_spec,
                location_code = EXCLUDED.location_code,
                usage_code = EXCLUDED.usage_code,
                enduser_code = EXCLUDED.enduser_code,
                condition_code = EXCLUDED.condition_code,
                status = EXCLUDED.status,
                valve_format = EXCLUDED.valve_format,
                valve_material = EXCLUDED.valve_material,
                cylinder_format = EXCLUDED.cylinder_format,
                cylinder_material = EXCLUDED.cylinder_material,
                usage_place = EXCLUDED.usage_place,
                type_key = EXCLUDED.type_key,
                is_available = EXCLUDED.is_available,
                pressure_due_date = EXCLUDED.pressure_due_date,
                last_event_at = EXCLUDED.last_event_at,
                source_updated_at = EXCLUDED.source_updated_at,
                refreshed_at = EXCLUDED.refreshed_at
            WHERE cylinder_snapshot.refreshed_at <= EXCLUDED.refreshed_at
            "#,
        )
        .bind(id)
        .bind(&record.gas_name)
        .bind(record.capacity)
        .bind(&record.valve_spec)
        .bind(&record.cylinder_spec)
        .bind(&record.location_code)
        .bind(&record.usage_code)
        .bind(&record.enduser_code)
        .bind(&record.condition_code)
        .bind(&record.status)
        .bind(&record.valve_format)
        .bind(&record.valve_material)
        .bind(&record.cylinder_format)
        .bind(&record.cylinder_material)
        .bind(&record.usage_place)
        .bind(record.type_key.as_str())
        .bind(record.is_available)
        .bind(record.pressure_due_date)
        .bind(record.last_event_at)
        .bind(record.source_updated_at)
        .bind(record.refreshed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, cylinder_id: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM cylinder_snapshot WHERE BTRIM(cylinder_id) = $1")
            .bind(canonical_id(cylinder_id))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn truncate(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM cylinder_snapshot")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list(&self, filter: &SnapshotFilter) -> StoreResult<Vec<SnapshotRecord>> {
        let sql = format!(
            r#"
            SELECT {SNAPSHOT_COLUMNS}
              FROM cylinder_snapshot
             WHERE ($1::text IS NULL OR type_key = $1)
               AND ($2::text IS NULL OR enduser_code = $2)
             ORDER BY cylinder_id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.type_key.as_ref().map(TypeKey::as_str))
            .bind(filter.enduser_code.as_deref())
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(snapshot_from_row(row)?);
        }
        Ok(out)
    }

    async fn hidden_type_keys(&self) -> StoreResult<HashSet<TypeKey>> {
        let rows = sqlx::query("SELECT type_key FROM hidden_cylinder_types")
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(TypeKey::new(row.try_get::<String, _>("type_key")?));
        }
        Ok(out)
    }

    async fn hide_type(&self, marker: &HiddenTypeMarker) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO hidden_cylinder_types (type_key, hidden_at, note)
            VALUES ($1, $2, $3)
            ON CONFLICT (type_key) DO UPDATE SET note = EXCLUDED.note
            "#,
        )
        .bind(marker.type_key.as_str())
        .bind(marker.hidden_at)
        .bind(marker.note.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unhide_type(&self, type_key: &TypeKey) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM hidden_cylinder_types WHERE type_key = $1")
            .bind(type_key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
